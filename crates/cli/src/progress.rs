//! Progress bar driven by orchestrator events.

use colored::Colorize;
use events::{Event, EventBus};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub struct RunProgress {
    task: JoinHandle<()>,
}

impl RunProgress {
    /// Subscribe before the run starts so no completion is missed.
    pub fn attach(bus: &EventBus, total: usize) -> Self {
        let mut rx = bus.subscribe();
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => match envelope.event {
                        Event::JobSucceeded { job_id, attempts } => {
                            bar.inc(1);
                            bar.set_message(format!("{} ok ({} attempt(s))", job_id, attempts));
                        }
                        Event::JobFailed { job_id, .. } => {
                            bar.inc(1);
                            bar.println(format!("{} {}", "failed".red(), job_id));
                        }
                        Event::CheckpointCommitted { completed, .. } => {
                            bar.println(format!("{} at {} jobs", "committed".green(), completed));
                        }
                        Event::CheckpointPublished { remote, branch } => {
                            bar.println(format!("{} {}/{}", "pushed".green(), remote, branch));
                        }
                        Event::Error { message, .. } => {
                            bar.println(format!("{} {}", "error".yellow(), message));
                        }
                        Event::RunFinished { .. } => break,
                        _ => {}
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
            bar.finish_and_clear();
        });

        Self { task }
    }

    /// Wait for the bar to drain after a completed run.
    pub async fn finish(self) {
        let _ = self.task.await;
    }

    /// Drop the bar when the run never started.
    pub fn abort(self) {
        self.task.abort();
    }
}
