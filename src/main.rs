mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::Style;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Command};
use ralph::actions::ActionRegistry;
use ralph::config::RalphConfig;
use ralph::models::ActionData;
use ralph::store::StoreState;
use ralph::ui::{self, JobProgress};
use ralph::{Store, TransitionEngine, TransitionError, TransitionRun, TransitionRunner, Worker, demo};

fn init_tracing(config: &RalphConfig, verbose: bool) {
    let default_filter = if verbose {
        "ralph=debug".to_string()
    } else {
        config.log_filter.clone()
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Print the per-object or per-field details carried by a rejected transition.
fn report_transition_error(err: &TransitionError) {
    let red = Style::new().red();
    match err {
        TransitionError::TransitionNotAllowed { errors, .. } => {
            for (object_id, messages) in errors {
                for message in messages {
                    eprintln!("  {} #{object_id}: {message}", red.apply_to("✗"));
                }
            }
        }
        TransitionError::InvalidData { errors, .. } => {
            for (action, fields) in errors {
                for (field, messages) in fields {
                    eprintln!("  {} {action}__{field}: {}", red.apply_to("✗"), messages.join(" "));
                }
            }
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RalphConfig::load()?;
    if let Some(path) = cli.store {
        config.store_path = path;
    }
    if let Some(service) = cli.service {
        config.async_service_name = service;
    }
    init_tracing(&config, cli.verbose);

    let store = Arc::new(
        Store::open(&config.store_path)
            .with_context(|| format!("opening store {}", config.store_path.display()))?,
    );
    let registry = Arc::new(ActionRegistry::with_catalog());
    let engine = TransitionEngine::new(Arc::clone(&store), Arc::clone(&registry));

    match cli.command {
        Command::Demo { force } => {
            let populated = store.read(|s| !s.objects.is_empty() || !s.transitions.is_empty());
            if populated && !force {
                bail!(
                    "store {} is not empty; use --force to replace it",
                    config.store_path.display()
                );
            }
            store
                .atomic(|tx| {
                    *tx = StoreState::default();
                    demo::seed(tx)
                })
                .context("seeding demo data")?;
            println!("Demo data written to {}", config.store_path.display());
            store.read(|s| {
                for object in s.objects.values() {
                    let transitions: Vec<_> = s
                        .transitions_for_field(object.kind, "status")
                        .into_iter()
                        .filter(|t| t.allows_source(object.status))
                        .cloned()
                        .collect();
                    ui::print_transitions(object, &transitions);
                }
            });
        }

        Command::Transitions { object, field, user } => {
            let transitions = engine.get_available_transitions_for_field(object, &field, user.as_deref())?;
            let object = store.read(|s| s.object(object).cloned())?;
            ui::print_transitions(&object, &transitions);
        }

        Command::Run {
            transition,
            objects,
            field,
            data,
            user,
        } => {
            let data: ActionData = data.into_iter().collect();
            let run = engine.run_transition(
                &objects,
                cli::transition_ref(&transition),
                &field,
                user.as_deref(),
                data,
            );
            match run {
                Ok(TransitionRun::Scheduled(job_ids)) => {
                    for job_id in job_ids {
                        println!("Scheduled job {job_id}");
                    }
                }
                Ok(TransitionRun::Completed(outcome)) => {
                    ui::print_transition_outcome(&outcome);
                    if !outcome.success {
                        bail!("transition {transition} failed");
                    }
                }
                Err(err) => {
                    report_transition_error(&err);
                    return Err(err).with_context(|| format!("running transition {transition}"));
                }
            }
        }

        Command::Worker { once } => {
            let runner = TransitionRunner::new(Arc::clone(&store), Arc::clone(&registry), config.worker_id())
                .with_lease_ttl(config.lease_ttl())
                .with_reschedule_delay(config.reschedule_delay());
            let worker = Worker::new(runner, config.async_service_name.clone(), config.poll_interval());
            if once {
                let progress = JobProgress::start(&format!("Processing {} jobs", config.async_service_name));
                let results = worker.run_once().await;
                for (job_id, outcome) in &results {
                    progress.job_done(job_id, outcome);
                }
                progress.finish(results.len());
            } else {
                worker.run().await;
            }
        }

        Command::Status { job: Some(job_id) } => {
            store.read(|s| -> Result<()> {
                let job = s.job(job_id)?;
                let actions = s.job_actions(job_id);
                let history: Vec<_> = s
                    .history_for_object(job.object_id)
                    .into_iter()
                    .filter(|h| h.created_at >= job.created_at)
                    .collect();
                ui::print_job(job, &actions, &history);
                Ok(())
            })?;
        }

        Command::Status { job: None } => {
            store.read(|s| {
                let mut jobs: Vec<_> = s.jobs.values().collect();
                jobs.sort_by_key(|j| j.created_at);
                ui::print_jobs(&jobs);
            });
        }

        Command::Kill { job } => {
            let job = engine.kill_job(job)?;
            println!("Job {} is {}", job.id, job.status);
        }

        Command::Unfreeze { job } => {
            if engine.unfreeze_job(job)? {
                println!("Job {job} requeued");
            } else {
                println!("Job {job} is not frozen");
            }
        }

        Command::Ping { object } => {
            let resumed = engine.ping(object)?;
            println!("Ping recorded for #{object}, {} job(s) resumed", resumed.len());
        }

        Command::DhcpSynced { object } => {
            engine.mark_dhcp_synced(object)?;
            println!("DHCP sync recorded for #{object}");
        }
    }

    Ok(())
}
