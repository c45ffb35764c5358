//! Ralph command line, built on clap.
//!
//! Defines [`Cli`] with its [`Command`] subcommands and the global flags
//! (`--store`, `--service`, `--verbose`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ralph::TransitionRef;
use ralph::models::ObjectId;
use serde_json::Value;
use uuid::Uuid;

/// Ralph: asset transitions and the asynchronous job worker.
#[derive(Debug, Parser)]
#[command(name = "ralph", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store file; overrides `ralph.toml` and `RALPH_STORE_PATH`.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Async service the worker consumes.
    #[arg(long, global = true)]
    pub service: Option<String>,

    /// Debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Seed the store with demo assets, users and transitions.
    Demo {
        /// Replace an existing store.
        #[arg(long)]
        force: bool,
    },

    /// List the transitions available for an object.
    Transitions {
        object: ObjectId,

        #[arg(long, default_value = "status")]
        field: String,

        #[arg(long)]
        user: Option<String>,
    },

    /// Run a transition (by name or id) on one or more objects.
    Run {
        transition: String,

        #[arg(required = true)]
        objects: Vec<ObjectId>,

        #[arg(long, default_value = "status")]
        field: String,

        /// Form value as `<action>__<field>=<value>`; repeatable.
        #[arg(long = "data", value_parser = parse_key_value)]
        data: Vec<(String, Value)>,

        #[arg(long)]
        user: Option<String>,
    },

    /// Process the job queue.
    Worker {
        /// Run the currently due jobs and exit.
        #[arg(long)]
        once: bool,
    },

    /// List jobs, or show one job with its actions.
    Status { job: Option<Uuid> },

    /// Stop a job before its next action.
    Kill { job: Uuid },

    /// Requeue a frozen job.
    Unfreeze { job: Uuid },

    /// Report a ping from a deployed object; resumes its frozen jobs.
    Ping { object: ObjectId },

    /// Report that the DHCP servers synced the object's entries.
    DhcpSynced { object: ObjectId },
}

/// Values are parsed as JSON when possible and kept as strings otherwise.
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Numeric arguments (optionally `#`-prefixed) are ids, anything else a name.
pub fn transition_ref(arg: &str) -> TransitionRef {
    match arg.trim_start_matches('#').parse() {
        Ok(id) => TransitionRef::Id(id),
        Err(_) => TransitionRef::Name(arg.to_string()),
    }
}
