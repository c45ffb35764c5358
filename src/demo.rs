//! Demo data: a few assets, users and the catalog transitions wired to them.

use serde_json::json;

use crate::error::Result;
use crate::models::{
    AssetKind, BaseObject, KEEP_ORIGINAL_STATUS, Transition, TransitionModel, User,
};
use crate::store::StoreState;

pub const DEPLOYMENT_ACTIONS: [&str; 10] = [
    "clean_hostname",
    "clean_dns",
    "clean_ipaddresses",
    "clean_dhcp",
    "assign_new_hostname",
    "create_dhcp_entries",
    "wait_for_dhcp_servers",
    "create_dns_entries",
    "deploy",
    "wait_for_ping",
];

fn server(hostname: &str, mac_suffix: u8) -> BaseObject {
    BaseObject::new(AssetKind::DataCenterAsset, 1)
        .with_hostname(hostname)
        .with_field(
            "ethernets",
            json!([
                {"mac": format!("02:00:00:00:01:{mac_suffix:02x}"), "is_management": true},
                {"mac": format!("02:00:00:00:02:{mac_suffix:02x}"), "is_management": false},
            ]),
        )
        .with_field(
            "ip_addresses",
            json!([{
                "address": format!("10.0.0.{mac_suffix}"),
                "hostname": hostname,
                "is_management": true,
                "dhcp_expose": false,
            }]),
        )
        .with_field(
            "dns_records",
            json!([{"name": hostname, "type": "A", "content": format!("10.10.0.{mac_suffix}"), "ptr": true}]),
        )
}

/// Fill an empty store with demo objects. Fails if the transitions already exist.
pub fn seed(state: &mut StoreState) -> Result<()> {
    let dc = TransitionModel::status(AssetKind::DataCenterAsset);
    let vm = TransitionModel::status(AssetKind::VirtualServer);
    let back_office = TransitionModel::status(AssetKind::BackOfficeAsset);

    let deploy = Transition::new("Deploy", dc.clone(), [1, 3, 7], 2).with_actions(DEPLOYMENT_ACTIONS);
    let release = Transition::new("Release asset", back_office.clone(), [1, 10], 4)
        .with_actions(["assign_user", "assign_owner", "release_report"]);
    let ret = Transition::new("Return asset", back_office.clone(), [4, 5], 10).with_actions(["unassign_user"]);

    state.insert_user(User::superuser("admin"));
    state.insert_user(User::new("jdoe").grant_transition(&release).grant_transition(&ret));

    state.insert_transition(deploy)?;
    state.insert_transition(
        Transition::new("Deploy", vm, [1], 2)
            .with_actions(DEPLOYMENT_ACTIONS)
            .on_service("DEPLOYMENT"),
    )?;
    state.insert_transition(Transition::new("Liquidate", dc, [3, 4, 7], 5).with_actions(["clean_hostname"]))?;
    state.insert_transition(release)?;
    state.insert_transition(ret)?;
    state.insert_transition(
        Transition::new("Report", back_office, [1, 4, 10], KEEP_ORIGINAL_STATUS).with_actions(["release_report"]),
    )?;

    state.insert_object(server("s1000.dc", 1));
    state.insert_object(server("s1001.dc", 2));
    state.insert_object(server("s1002.dc", 3).with_field("allow_deployment", false));
    state.insert_object(
        BaseObject::new(AssetKind::VirtualServer, 1)
            .with_hostname("vm-1.dc")
            .with_field("ethernets", json!([{"mac": "02:00:00:00:03:01", "is_management": false}])),
    );
    state.insert_object(BaseObject::new(AssetKind::BackOfficeAsset, 1).with_hostname("laptop-1"));
    state.insert_object(BaseObject::new(AssetKind::BackOfficeAsset, 10).with_hostname("laptop-2"));
    state.insert_object(BaseObject::new(AssetKind::Licence, 2));
    Ok(())
}
