//! Built-in actions for deployment and back-office transitions.
//!
//! Objects keep their network data in `fields`:
//! `ethernets` (`[{mac, is_management}]`), `ip_addresses`
//! (`[{address, hostname, mac, is_management, dhcp_expose}]`) and
//! `dns_records` (`[{name, type, content, ptr}]`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ActionContext, ActionDef, ActionOutcome, ActionRegistry, FieldKind, FormField};
use crate::error::ActionError;
use crate::models::{AssetKind, Attachment, BaseObject, ObjectId, User};

pub const DEPLOYMENT_KINDS: &[AssetKind] = &[AssetKind::DataCenterAsset, AssetKind::VirtualServer];
pub const BACK_OFFICE_KINDS: &[AssetKind] = &[AssetKind::BackOfficeAsset];

/// Above this many records DNS must be cleaned by hand.
pub const MAX_DNS_ENTRIES_TO_CLEAN: usize = 30;

pub const PREBOOTS: &[(i64, &str)] = &[(1, "ubuntu-22.04"), (2, "centos-7"), (3, "esxi-8")];

type ActionResult = Result<ActionOutcome, ActionError>;

pub fn register(registry: &mut ActionRegistry) {
    registry
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("clean_hostname", clean_hostname).verbose_name("Clean hostname"),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("clean_dns", clean_dns)
                .verbose_name("Clean DNS entries")
                .run_after(["clean_hostname"])
                .asynchronous(),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("clean_ipaddresses", clean_ipaddresses)
                .verbose_name("Clean IP addresses")
                .run_after(["clean_dns"]),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("clean_dhcp", clean_dhcp)
                .verbose_name("Clean DHCP entries")
                .run_after(["clean_dns", "clean_ipaddresses"]),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("assign_new_hostname", assign_new_hostname)
                .verbose_name("Assign new hostname")
                .form_field(
                    FormField::new(
                        "hostname",
                        "Hostname",
                        FieldKind::Char {
                            max_length: Some(255),
                        },
                    )
                    .exclude_from_history()
                    .validation(validate_hostname_template),
                )
                .run_after(["clean_dns", "clean_dhcp", "clean_hostname"]),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("create_dhcp_entries", create_dhcp_entries)
                .verbose_name("Assign new IP address and create DHCP entries")
                .form_field(
                    FormField::new("ip", "IP Address", FieldKind::IpAddress)
                        .exclude_from_history()
                        .validation(validate_single_instance),
                )
                .run_after(["assign_new_hostname", "clean_ipaddresses", "clean_dhcp"])
                .precondition(check_mac_address),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("wait_for_dhcp_servers", wait_for_dhcp_servers)
                .verbose_name("Wait for DHCP servers")
                .run_after(["create_dhcp_entries"])
                .asynchronous(),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("create_dns_entries", create_dns_entries)
                .verbose_name("Create DNS entries")
                .run_after(["assign_new_hostname", "create_dhcp_entries"]),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("deploy", deploy)
                .verbose_name("Apply preboot")
                .form_field(FormField::new(
                    "preboot",
                    "Preboot",
                    FieldKind::Choice(
                        PREBOOTS
                            .iter()
                            .map(|(id, name)| (*id, name.to_string()))
                            .collect(),
                    ),
                ))
                .run_after([
                    "assign_new_hostname",
                    "create_dhcp_entries",
                    "wait_for_dhcp_servers",
                    "create_dns_entries",
                ])
                .precondition(check_if_deployment_is_available)
                .asynchronous(),
        )
        .register(
            DEPLOYMENT_KINDS,
            ActionDef::new("wait_for_ping", wait_for_ping)
                .verbose_name("Wait for ping")
                .run_after(["deploy"])
                .asynchronous(),
        );

    registry
        .register(
            BACK_OFFICE_KINDS,
            ActionDef::new("assign_user", assign_user).form_field(FormField::new(
                "user",
                "User",
                FieldKind::Char {
                    max_length: Some(150),
                },
            )),
        )
        .register(
            BACK_OFFICE_KINDS,
            ActionDef::new("assign_owner", assign_owner).form_field(FormField::new(
                "owner",
                "Owner",
                FieldKind::Char {
                    max_length: Some(150),
                },
            )),
        )
        .register(
            BACK_OFFICE_KINDS,
            ActionDef::new("unassign_user", unassign_user),
        )
        .register(
            BACK_OFFICE_KINDS,
            ActionDef::new("release_report", release_report)
                .verbose_name("Release report")
                .run_after(["assign_user", "assign_owner"]),
        );
}

fn array_field<'o>(obj: &'o BaseObject, name: &str) -> &'o [Value] {
    obj.field(name)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn is_management(entry: &Value) -> bool {
    entry
        .get("is_management")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn non_mgmt_mac(obj: &BaseObject) -> Option<String> {
    array_field(obj, "ethernets")
        .iter()
        .filter(|eth| !is_management(eth))
        .find_map(|eth| eth.get("mac").and_then(Value::as_str))
        .map(str::to_string)
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn check_mac_address(instances: &[BaseObject], _: Option<&User>) -> BTreeMap<ObjectId, String> {
    instances
        .iter()
        .filter(|obj| non_mgmt_mac(obj).is_none())
        .map(|obj| (obj.id, "Non-management MAC address not found".to_string()))
        .collect()
}

fn check_if_deployment_is_available(
    instances: &[BaseObject],
    _: Option<&User>,
) -> BTreeMap<ObjectId, String> {
    instances
        .iter()
        .filter(|obj| obj.field("allow_deployment").and_then(Value::as_bool) == Some(false))
        .map(|obj| (obj.id, "Deployment is not available for this asset".to_string()))
        .collect()
}

fn validate_hostname_template(
    instances: &[BaseObject],
    data: &BTreeMap<String, Value>,
) -> Result<(), String> {
    let hostname = data.get("hostname").and_then(Value::as_str).unwrap_or("");
    if instances.len() > 1 && !hostname.contains('#') {
        return Err("Hostname must contain # when assigning many objects".to_string());
    }
    Ok(())
}

fn validate_single_instance(
    instances: &[BaseObject],
    _: &BTreeMap<String, Value>,
) -> Result<(), String> {
    if instances.len() > 1 {
        return Err("An IP address can be assigned to one object only".to_string());
    }
    Ok(())
}

fn clean_hostname(ctx: &mut ActionContext<'_>) -> ActionResult {
    for obj in ctx.instances.iter_mut() {
        warn!(object = %obj, hostname = ?obj.hostname, "Clearing hostname");
        obj.hostname = None;
    }
    Ok(ActionOutcome::Done)
}

fn clean_dns(ctx: &mut ActionContext<'_>) -> ActionResult {
    for obj in ctx.instances.iter_mut() {
        let records = array_field(obj, "dns_records").to_vec();
        if records.is_empty() {
            info!(object = %obj, "No DNS records - skipping cleaning DNS entries");
            continue;
        }
        if records.len() > MAX_DNS_ENTRIES_TO_CLEAN {
            return Err(ActionError::failed(format!(
                "Cannot clean {} entries for {obj} - clean it manually",
                records.len()
            )));
        }
        for record in &records {
            warn!(object = %obj, record = %record, "Deleting DNS record");
        }
        obj.remove_field("dns_records");
    }
    Ok(ActionOutcome::Done)
}

fn clean_ipaddresses(ctx: &mut ActionContext<'_>) -> ActionResult {
    for obj in ctx.instances.iter_mut() {
        let (kept, removed): (Vec<Value>, Vec<Value>) = array_field(obj, "ip_addresses")
            .iter()
            .cloned()
            .partition(is_management);
        for ip in &removed {
            let address = &ip["address"];
            warn!(object = %obj, ip = %address, "Deleting IP address");
        }
        obj.set_field("ip_addresses", Value::Array(kept));
    }
    Ok(ActionOutcome::Done)
}

fn clean_dhcp(ctx: &mut ActionContext<'_>) -> ActionResult {
    for obj in ctx.instances.iter_mut() {
        let mut entries = array_field(obj, "ip_addresses").to_vec();
        for entry in entries.iter_mut() {
            if entry.get("dhcp_expose").and_then(Value::as_bool) == Some(true) {
                let address = &entry["address"];
                warn!(object = %obj, ip = %address, "Removing DHCP entry");
                entry["dhcp_expose"] = Value::Bool(false);
            }
        }
        obj.set_field("ip_addresses", Value::Array(entries));
    }
    Ok(ActionOutcome::Done)
}

fn assign_new_hostname(ctx: &mut ActionContext<'_>) -> ActionResult {
    let template = ctx.str_param("hostname")?.to_string();
    let many = ctx.instances.len() > 1;
    let mut assigned = Vec::with_capacity(ctx.instances.len());
    for (index, obj) in ctx.instances.iter_mut().enumerate() {
        let hostname = if many {
            template.replacen('#', &(index + 1).to_string(), 1)
        } else {
            template.clone()
        };
        info!(object = %obj, hostname = %hostname, "Assigning hostname");
        obj.hostname = Some(hostname.clone());
        assigned.push((obj.id, hostname));
    }
    for (id, hostname) in assigned {
        ctx.record_history(id, "hostname", hostname.clone());
        ctx.share_for("hostnames", id, hostname);
    }
    Ok(ActionOutcome::Done)
}

fn create_dhcp_entries(ctx: &mut ActionContext<'_>) -> ActionResult {
    let ip = ctx.str_param("ip")?.to_string();
    if ctx.instances.len() != 1 {
        return Err(ActionError::InvalidParam {
            name: "ip".into(),
            reason: "one IP address given for many objects".into(),
        });
    }
    let obj = &mut ctx.instances[0];
    let mac = non_mgmt_mac(obj)
        .ok_or_else(|| ActionError::failed("Non-management MAC address not found"))?;
    let mut entries = array_field(obj, "ip_addresses").to_vec();
    if entries.iter().any(|e| e["address"] == ip.as_str()) {
        return Err(ActionError::failed(format!(
            "IP {ip} is already assigned to {obj}"
        )));
    }
    info!(object = %obj, ip = %ip, mac = %mac, "Assigning IP and creating DHCP entry");
    entries.push(json!({
        "address": ip,
        "hostname": obj.hostname,
        "mac": mac,
        "is_management": false,
        "dhcp_expose": true,
    }));
    obj.set_field("ip_addresses", Value::Array(entries));
    let id = obj.id;

    ctx.record_history(id, "ip", ip.clone());
    ctx.record_history(id, "mac", mac);
    ctx.share_for("ip_addresses", id, ip);
    ctx.shared_params.insert(
        "dhcp_entry_created_date".to_string(),
        Value::from(Utc::now().to_rfc3339()),
    );
    Ok(ActionOutcome::Done)
}

/// Reschedules until every object's DHCP server synced after the entries were created.
fn wait_for_dhcp_servers(ctx: &mut ActionContext<'_>) -> ActionResult {
    let created = parse_time(ctx.shared_params.get("dhcp_entry_created_date"))
        .ok_or_else(|| ActionError::MissingParam("dhcp_entry_created_date".into()))?;
    for obj in ctx.instances.iter() {
        match parse_time(obj.field("dhcp_synced_at")) {
            Some(synced) if synced >= created => {}
            _ => {
                info!(object = %obj, "DHCP servers not synchronized yet");
                return Ok(ActionOutcome::Reschedule);
            }
        }
    }
    Ok(ActionOutcome::Done)
}

fn create_dns_entries(ctx: &mut ActionContext<'_>) -> ActionResult {
    let mut records = Vec::with_capacity(ctx.instances.len());
    for obj in ctx.instances.iter() {
        let ip = ctx
            .history(obj.id, "ip")
            .or_else(|| ctx.shared_for("ip_addresses", obj.id))
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::failed(format!("No IP address assigned to {obj}")))?
            .to_string();
        let hostname = obj
            .hostname
            .clone()
            .ok_or_else(|| ActionError::failed(format!("{obj} has no hostname")))?;
        records.push(json!({"name": hostname, "type": "A", "content": ip, "ptr": true}));
    }
    for (obj, record) in ctx.instances.iter_mut().zip(records) {
        info!(object = %obj, record = %record, "Creating DNS record");
        let mut existing = array_field(obj, "dns_records").to_vec();
        existing.push(record);
        obj.set_field("dns_records", Value::Array(existing));
    }
    Ok(ActionOutcome::Done)
}

/// Marks the deployment and waits for the server to ping back.
fn deploy(ctx: &mut ActionContext<'_>) -> ActionResult {
    let preboot_id = ctx.i64_param("preboot")?;
    let preboot = PREBOOTS
        .iter()
        .find(|(id, _)| *id == preboot_id)
        .map(|(_, name)| *name)
        .ok_or_else(|| ActionError::InvalidParam {
            name: "preboot".into(),
            reason: format!("unknown preboot {preboot_id}"),
        })?;
    for obj in ctx.instances.iter_mut() {
        info!(object = %obj, preboot, "Deploying");
        obj.set_field("preboot", preboot);
        obj.remove_field("last_ping");
    }
    Ok(ActionOutcome::Freeze)
}

fn wait_for_ping(ctx: &mut ActionContext<'_>) -> ActionResult {
    if ctx.instances.iter().all(|obj| obj.field("last_ping").is_some()) {
        Ok(ActionOutcome::Done)
    } else {
        Ok(ActionOutcome::Reschedule)
    }
}

fn assign_user(ctx: &mut ActionContext<'_>) -> ActionResult {
    let user = ctx.str_param("user")?.to_string();
    for obj in ctx.instances.iter_mut() {
        obj.set_field("user", user.clone());
    }
    Ok(ActionOutcome::Done)
}

fn assign_owner(ctx: &mut ActionContext<'_>) -> ActionResult {
    let owner = ctx.str_param("owner")?.to_string();
    for obj in ctx.instances.iter_mut() {
        obj.set_field("owner", owner.clone());
    }
    Ok(ActionOutcome::Done)
}

fn unassign_user(ctx: &mut ActionContext<'_>) -> ActionResult {
    let mut previous = Vec::new();
    for obj in ctx.instances.iter_mut() {
        if let Some(user) = obj.remove_field("user") {
            previous.push((obj.id, user));
        }
    }
    for (id, user) in previous {
        ctx.record_history(id, "Previous user", user);
    }
    Ok(ActionOutcome::Done)
}

fn release_report(ctx: &mut ActionContext<'_>) -> ActionResult {
    let released_by = ctx
        .requester
        .map(|u| u.username.as_str())
        .unwrap_or("system");
    let mut content = String::from("Release report\n");
    content.push_str(&format!("Date: {}\n", Utc::now().format("%Y-%m-%d")));
    content.push_str(&format!("Released by: {released_by}\n"));
    for obj in ctx.instances.iter() {
        content.push_str(&format!(
            "\n{obj}\n  user: {}\n  owner: {}\n",
            obj.field_str("user").unwrap_or("-"),
            obj.field_str("owner").unwrap_or("-"),
        ));
    }
    let ids: Vec<String> = ctx.instances.iter().map(|o| o.id.to_string()).collect();
    Ok(ActionOutcome::Attachment(Attachment::text(
        format!("release-{}.txt", ids.join("-")),
        content,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionData, HistoryKwargs, SharedParams};

    fn dc_asset(id: ObjectId) -> BaseObject {
        let mut obj = BaseObject::new(AssetKind::DataCenterAsset, 1)
            .with_hostname(format!("old{id}.dc"))
            .with_field(
                "ethernets",
                json!([{"mac": "aa:bb", "is_management": true}, {"mac": "cc:dd", "is_management": false}]),
            )
            .with_field(
                "ip_addresses",
                json!([
                    {"address": "10.0.0.1", "is_management": true, "dhcp_expose": true},
                    {"address": "10.1.0.1", "is_management": false, "dhcp_expose": true}
                ]),
            );
        obj.id = id;
        obj
    }

    fn run(
        registry: &ActionRegistry,
        name: &str,
        instances: &mut [BaseObject],
        params: ActionData,
        shared: &mut SharedParams,
    ) -> (Result<ActionOutcome, ActionError>, HistoryKwargs) {
        let action = registry.get(instances[0].kind, name).unwrap();
        let mut history = HistoryKwargs::new();
        let mut ctx = ActionContext {
            instances,
            requester: None,
            params,
            history_kwargs: &mut history,
            shared_params: shared,
            attachments: &[],
            job_action: None,
        };
        let result = action.call(&mut ctx);
        (result, history)
    }

    #[test]
    fn clean_ipaddresses_keeps_management_ips() {
        let registry = ActionRegistry::with_catalog();
        let mut objs = vec![dc_asset(1)];
        let (result, _) = run(&registry, "clean_ipaddresses", &mut objs, ActionData::new(), &mut SharedParams::new());
        assert_eq!(result, Ok(ActionOutcome::Done));
        let ips = objs[0].field("ip_addresses").unwrap().as_array().unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0]["address"], "10.0.0.1");
    }

    #[test]
    fn clean_dhcp_unexposes_entries() {
        let registry = ActionRegistry::with_catalog();
        let mut objs = vec![dc_asset(1)];
        run(&registry, "clean_dhcp", &mut objs, ActionData::new(), &mut SharedParams::new());
        let ips = objs[0].field("ip_addresses").unwrap().as_array().unwrap();
        assert!(ips.iter().all(|ip| ip["dhcp_expose"] == false));
    }

    #[test]
    fn clean_dns_refuses_too_many_records() {
        let registry = ActionRegistry::with_catalog();
        let records: Vec<Value> = (0..=MAX_DNS_ENTRIES_TO_CLEAN)
            .map(|i| json!({"name": format!("r{i}"), "type": "A"}))
            .collect();
        let mut objs = vec![dc_asset(1).with_field("dns_records", Value::Array(records))];
        let (result, _) = run(&registry, "clean_dns", &mut objs, ActionData::new(), &mut SharedParams::new());
        assert!(matches!(result, Err(ActionError::Failed(_))));
        assert!(objs[0].field("dns_records").is_some());
    }

    #[test]
    fn assign_new_hostname_numbers_many_objects() {
        let registry = ActionRegistry::with_catalog();
        let mut objs = vec![dc_asset(1), dc_asset(2)];
        let mut shared = SharedParams::new();
        let params = ActionData::from([("hostname".to_string(), json!("s#.dc"))]);
        let (result, history) = run(&registry, "assign_new_hostname", &mut objs, params, &mut shared);
        assert_eq!(result, Ok(ActionOutcome::Done));
        assert_eq!(objs[0].hostname.as_deref(), Some("s1.dc"));
        assert_eq!(objs[1].hostname.as_deref(), Some("s2.dc"));
        assert_eq!(history[&2]["hostname"], "s2.dc");
        assert_eq!(shared["hostnames"], json!({"1": "s1.dc", "2": "s2.dc"}));
    }

    #[test]
    fn create_dhcp_entries_uses_first_non_mgmt_mac() {
        let registry = ActionRegistry::with_catalog();
        let mut objs = vec![dc_asset(1)];
        let mut shared = SharedParams::new();
        let params = ActionData::from([("ip".to_string(), json!("10.2.0.5"))]);
        let (result, history) = run(&registry, "create_dhcp_entries", &mut objs, params, &mut shared);
        assert_eq!(result, Ok(ActionOutcome::Done));
        assert_eq!(history[&1]["mac"], "cc:dd");
        assert_eq!(shared["ip_addresses"]["1"], "10.2.0.5");
        assert!(shared.contains_key("dhcp_entry_created_date"));
        let ips = objs[0].field("ip_addresses").unwrap().as_array().unwrap();
        assert_eq!(ips.last().unwrap()["dhcp_expose"], true);
    }

    #[test]
    fn mac_precondition_reports_objects_without_mac() {
        let registry = ActionRegistry::with_catalog();
        let action = registry.get(AssetKind::DataCenterAsset, "create_dhcp_entries").unwrap();
        let mut bare = BaseObject::new(AssetKind::DataCenterAsset, 1);
        bare.id = 9;
        let errors = action.check_precondition(&[dc_asset(1), bare], None);
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key(&9));
    }

    #[test]
    fn wait_for_dhcp_servers_reschedules_until_synced() {
        let registry = ActionRegistry::with_catalog();
        let created = Utc::now();
        let mut shared = SharedParams::from([(
            "dhcp_entry_created_date".to_string(),
            json!(created.to_rfc3339()),
        )]);
        let mut objs = vec![dc_asset(1)];
        let (result, _) = run(&registry, "wait_for_dhcp_servers", &mut objs, ActionData::new(), &mut shared);
        assert_eq!(result, Ok(ActionOutcome::Reschedule));

        let synced = created + chrono::Duration::seconds(5);
        objs[0].set_field("dhcp_synced_at", synced.to_rfc3339());
        let (result, _) = run(&registry, "wait_for_dhcp_servers", &mut objs, ActionData::new(), &mut shared);
        assert_eq!(result, Ok(ActionOutcome::Done));
    }

    #[test]
    fn deploy_freezes_with_selected_preboot() {
        let registry = ActionRegistry::with_catalog();
        let mut objs = vec![dc_asset(1)];
        let params = ActionData::from([("preboot".to_string(), json!("2"))]);
        let (result, _) = run(&registry, "deploy", &mut objs, params, &mut SharedParams::new());
        assert_eq!(result, Ok(ActionOutcome::Freeze));
        assert_eq!(objs[0].field_str("preboot"), Some("centos-7"));
    }

    #[test]
    fn release_report_lists_assignments() {
        let registry = ActionRegistry::with_catalog();
        let mut laptop = BaseObject::new(AssetKind::BackOfficeAsset, 1)
            .with_field("user", "jdoe")
            .with_field("owner", "it-dept");
        laptop.id = 3;
        let mut objs = vec![laptop];
        let (result, _) = run(&registry, "release_report", &mut objs, ActionData::new(), &mut SharedParams::new());
        match result {
            Ok(ActionOutcome::Attachment(attachment)) => {
                assert_eq!(attachment.file_name, "release-3.txt");
                assert!(attachment.content.contains("user: jdoe"));
                assert!(attachment.content.contains("owner: it-dept"));
            }
            other => panic!("expected attachment, got {other:?}"),
        }
    }
}
