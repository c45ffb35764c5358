//! Terminal output: spinners for running jobs and coloured summaries.
//!
//! Uses `indicatif` for the spinner and `console` for styling.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::engine::TransitionOutcome;
use crate::models::{
    BaseObject, JobStatus, Transition, TransitionJob, TransitionJobAction, TransitionJobActionStatus,
    TransitionsHistory,
};
use crate::runner::RunOutcome;

/// Spinner shown while the worker processes jobs.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self::with_bar(pb)
    }

    /// No terminal output.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Print one line per processed job above the spinner.
    pub fn job_done(&self, job_id: &uuid::Uuid, outcome: &RunOutcome) {
        self.pb.println(format!("  {} {job_id}", self.outcome_symbol(outcome)));
    }

    pub fn outcome_symbol(&self, outcome: &RunOutcome) -> String {
        match outcome {
            RunOutcome::Finished => format!("{} finished", self.green.apply_to("✓")),
            RunOutcome::Failed(reason) => format!("{} failed: {reason}", self.red.apply_to("✗")),
            RunOutcome::Rescheduled => format!("{} rescheduled", self.yellow.apply_to("↻")),
            RunOutcome::Frozen => format!("{} frozen", self.yellow.apply_to("❄")),
            RunOutcome::Killed => format!("{} killed", self.red.apply_to("■")),
            RunOutcome::AlreadyEnded => "- already ended".to_string(),
            RunOutcome::Skipped => "- skipped".to_string(),
        }
    }

    pub fn finish(&self, processed: usize) {
        self.pb.finish_and_clear();
        println!("  {} {processed} job(s) processed", self.green.apply_to("✓"));
    }
}

fn job_status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Finished => Style::new().green().bold(),
        JobStatus::Failed | JobStatus::Killed => Style::new().red().bold(),
        JobStatus::Frozen => Style::new().cyan(),
        JobStatus::Queued | JobStatus::Started => Style::new().yellow(),
    }
}

fn action_status_style(status: TransitionJobActionStatus) -> Style {
    match status {
        TransitionJobActionStatus::Finished => Style::new().green(),
        TransitionJobActionStatus::Failed => Style::new().red().bold(),
        TransitionJobActionStatus::Started => Style::new().yellow(),
    }
}

pub fn print_transition_outcome(outcome: &TransitionOutcome) {
    if outcome.success {
        println!("  {} Transition finished", Style::new().green().bold().apply_to("✓"));
    } else {
        println!("  {} Transition failed and was rolled back", Style::new().red().bold().apply_to("✗"));
    }
    for attachment in &outcome.attachments {
        println!("  {} {}", Style::new().cyan().apply_to("📎"), attachment.file_name);
        println!("{}", Style::new().dim().apply_to(&attachment.content));
    }
}

pub fn print_transitions(object: &BaseObject, transitions: &[Transition]) {
    let status = object
        .kind
        .status_name(object.status)
        .map(str::to_string)
        .unwrap_or_else(|| object.status.to_string());
    println!("{} [{}]", Style::new().bold().apply_to(object), status);
    if transitions.is_empty() {
        println!("  no transitions available");
    }
    for transition in transitions {
        println!("  #{:<3} {}", transition.id, transition.name);
    }
}

pub fn print_jobs(jobs: &[&TransitionJob]) {
    if jobs.is_empty() {
        println!("No transition jobs.");
        return;
    }
    for job in jobs {
        println!(
            "{}  {:<9}  object #{:<4} transition #{:<3} {}",
            job.id,
            job_status_style(job.status).apply_to(job.status),
            job.object_id,
            job.transition_id,
            job.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

pub fn print_job(job: &TransitionJob, actions: &[&TransitionJobAction], history: &[&TransitionsHistory]) {
    println!("{}", Style::new().bold().apply_to(format!("─── Job {} ───", job.id)));
    println!("service: {}", job.service_name);
    println!("status:  {}", job_status_style(job.status).apply_to(job.status));
    if let Some(reason) = &job.reason {
        println!("reason:  {}", Style::new().red().apply_to(reason));
    }
    if let Some(user) = &job.user {
        println!("user:    {user}");
    }
    if let Some(lease) = &job.lease {
        println!("lease:   {} until {}", lease.owner, lease.expires_at.format("%H:%M:%S"));
    }
    for action in actions {
        println!(
            "  {:<24} {}",
            action.action_name,
            action_status_style(action.status).apply_to(action.status)
        );
    }
    if !history.is_empty() {
        println!();
        println!("{}", Style::new().dim().apply_to("─── History ───"));
    }
    for entry in history {
        println!(
            "{}",
            serde_json::to_string_pretty(entry).unwrap_or_default()
        );
    }
}
