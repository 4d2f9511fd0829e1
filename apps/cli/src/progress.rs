//! Progress bar for store operations

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use ovault_types::{EngineEvent, SessionState};

/// Renders one store session's progress from engine events
#[derive(Clone)]
pub struct StoreProgress {
    bar: ProgressBar,
}

impl StoreProgress {
    pub fn new(source: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} segments {msg}")
                .unwrap()
                .progress_chars("█▓▒░  "),
        );
        bar.set_message(format!("resolving {}", source));
        Self { bar }
    }

    pub fn handle_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::StoreStateChanged { state, .. } => {
                let label = match state {
                    SessionState::FetchingManifest => "fetching manifest",
                    SessionState::AcquiringLicense => "acquiring license",
                    SessionState::FetchingSegments => "fetching segments",
                    SessionState::Committing => "committing",
                    SessionState::Aborting => "aborting",
                    _ => return,
                };
                self.bar.set_message(label.to_string());
            }

            EngineEvent::StoreProgress {
                fetched_segments,
                total_segments,
                bytes_downloaded,
                speed,
                eta,
                ..
            } => {
                self.bar.set_length(*total_segments);
                self.bar.set_position(*fetched_segments);
                let mut message = format!(
                    "{} ({})",
                    human_bytes::human_bytes(*bytes_downloaded as f64),
                    crate::output::format_speed(*speed)
                );
                if let Some(eta) = eta {
                    message.push_str(&format!(", {} left", crate::output::format_eta(*eta)));
                }
                self.bar.set_message(message);
            }

            _ => {}
        }
    }

    pub fn finish_ok(&self) {
        self.bar.finish_with_message(format!(
            "{} Store complete",
            style("✓").green().bold()
        ));
    }

    pub fn finish_err(&self, error: &str) {
        self.bar.abandon_with_message(format!(
            "{} Failed: {}",
            style("✗").red().bold(),
            error
        ));
    }
}
