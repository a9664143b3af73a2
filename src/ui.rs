//! Terminal output: a spinner while a job runs and colored results.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::carrier::Carrier;
use crate::state_machine::{JobReport, JobStatus};

/// Spinner shown while a job runs in the background.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
}

impl JobProgress {
    pub fn start(job_id: &str, carrier: Carrier) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("{carrier} job {job_id}: processing"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Stop the spinner and print the one-line outcome.
    pub fn complete(&self, report: &JobReport) {
        self.pb.finish_and_clear();
        match report.status {
            JobStatus::Completed => {
                println!("  {} {}", self.green.apply_to("✓"), report.message);
            }
            _ => {
                println!("  {} Job failed: {}", self.red.apply_to("✗"), report.message);
            }
        }
    }
}

fn status_style(status: Option<JobStatus>) -> Style {
    match status {
        Some(JobStatus::Completed) => Style::new().green().bold(),
        Some(JobStatus::Failed) => Style::new().red().bold(),
        Some(_) => Style::new().yellow(),
        None => Style::new().dim(),
    }
}

/// Print the job report as pretty JSON under a colored heading.
pub fn print_report(report: &JobReport) {
    println!();
    println!("{}", status_style(Some(report.status)).apply_to("─── Job Report ───"));
    println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
}

pub fn print_status(job_id: &str, status: Option<JobStatus>) {
    let label = status.map_or("unknown", |s| s.as_str());
    println!("{job_id}: {}", status_style(status).apply_to(label));
}

pub fn print_uploaded(locations: &[String]) {
    let green = Style::new().green().bold();
    for location in locations {
        println!("  {} {location}", green.apply_to("↑"));
    }
    println!("{} file(s) uploaded", locations.len());
}
