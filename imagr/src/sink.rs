//! Terminal presentation of controller events.
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imagr_core::controller::{Confirmation, EventSink, OperationKind, OperationStatus, Warning};
use imagr_core::hash::HashResult;
use imagr_core::transfer::ProgressSample;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

/// Progress bars, prompts and warnings on the terminal.
pub struct TerminalSink {
    quiet: bool,
    stage: Stage,
    bar: Option<ProgressBar>,
    /// Sector count of a truncated write the user accepted, so the verify
    /// that follows it does not ask again.
    accepted_truncation: Option<u64>,
}

#[derive(Clone, Copy)]
struct Stage {
    prefix: &'static str,
    color: &'static str,
    done: &'static str,
}

const READING: Stage = Stage {
    prefix: "Reading",
    color: "green",
    done: "Read complete.",
};
const WRITING: Stage = Stage {
    prefix: "Writing",
    color: "green",
    done: "Write complete.",
};
const VERIFYING: Stage = Stage {
    prefix: "Verifying",
    color: "magenta",
    done: "Verification successful.",
};

impl TerminalSink {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            stage: READING,
            bar: None,
            accepted_truncation: None,
        }
    }

    fn bar_style(&self) -> ProgressStyle {
        let template = format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{}/black}}] {{pos}}/{{len}} sectors ({{msg}}, {{eta}})",
            self.stage.color
        );
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("■ ")
    }

    fn ask(&self, prompt: &str) -> bool {
        match Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("cannot prompt for confirmation: {e}");
                false
            }
        }
    }
}

impl EventSink for TerminalSink {
    fn status_changed(&mut self, status: OperationStatus) {
        tracing::debug!(%status, "status");
        match status {
            OperationStatus::Reading => self.stage = READING,
            OperationStatus::Writing => self.stage = WRITING,
            OperationStatus::Verifying => self.stage = VERIFYING,
            OperationStatus::Canceled => {
                if let Some(bar) = &self.bar {
                    bar.set_message("cancelling");
                }
            }
            OperationStatus::Idle | OperationStatus::Exit => {}
        }
    }

    fn progress_range(&mut self, _min: u64, max: u64) {
        if self.quiet {
            return;
        }
        let bar = ProgressBar::new(max);
        bar.set_prefix(self.stage.prefix);
        bar.set_style(self.bar_style());
        bar.set_message("-- MB/s");
        self.bar = Some(bar);
    }

    fn progress(&mut self, sample: &ProgressSample) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{:.1} MB/s", sample.throughput_mbs));
        }
    }

    fn chunk_transferred(&mut self, sectors_done: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(sectors_done);
        }
    }

    fn progress_reset(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }

    fn operation_complete(&mut self, canceled: bool) {
        if canceled {
            println!("{}", style("Operation cancelled.").yellow());
        } else if !self.quiet {
            println!("{}", style(self.stage.done).green());
        }
    }

    fn warning(&mut self, warning: &Warning) {
        eprintln!("{} {warning}", style("WARNING:").red().bold());
    }

    fn hash_generated(&mut self, result: &HashResult) {
        tracing::info!(algorithm = %result.algorithm, bytes = result.bytes_hashed, "hash generated");
    }

    fn confirm(&mut self, request: &Confirmation) -> bool {
        match request {
            Confirmation::OverwriteVolume { volume } => {
                println!(
                    "{} This will erase all data on '{}'.",
                    style("WARNING:").red().bold(),
                    style(volume.display()).cyan()
                );
                self.ask("Are you sure you want to proceed?")
            }
            Confirmation::OverwriteImageFile { path } => self.ask(&format!(
                "'{}' already exists. Overwrite it?",
                path.display()
            )),
            Confirmation::Truncate {
                operation,
                required,
                available,
                sector_size,
                data_found,
            } => {
                if *operation == OperationKind::Verify
                    && self.accepted_truncation == Some(*available)
                {
                    if !self.quiet {
                        println!("Verifying the {available} sectors that were written.");
                    }
                    return true;
                }
                let bytes = |sectors: u64| HumanBytes(sectors * *sector_size as u64);
                println!(
                    "{} The {operation} needs {required} sectors ({}) but only {available} ({}) fit.",
                    style("WARNING:").red().bold(),
                    bytes(*required),
                    bytes(*available),
                );
                if *data_found {
                    println!(
                        "{}",
                        style("The sectors that would be left out contain data.").red()
                    );
                } else {
                    println!("The sectors that would be left out appear to be empty.");
                }
                let answer =
                    self.ask(&format!("Continue and copy only the first {available} sectors?"));
                self.accepted_truncation =
                    (answer && *operation == OperationKind::Write).then_some(*available);
                answer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truncate(operation: OperationKind, available: u64) -> Confirmation {
        Confirmation::Truncate {
            operation,
            required: 3000,
            available,
            sector_size: 512,
            data_found: true,
        }
    }

    #[test]
    fn verify_reuses_accepted_write_truncation() {
        let mut sink = TerminalSink::new(true);
        sink.accepted_truncation = Some(2048);

        assert!(sink.confirm(&truncate(OperationKind::Verify, 2048)));
    }
}
