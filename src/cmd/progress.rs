//! Spinners and byte progress bars for the commands

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for steps with no measurable progress (building, wrapping, cataloging)
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Byte counter with throughput and ETA; the uploader sets its length
pub fn create_upload_bar(total: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.cyan} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░ ");
    bar.set_style(style);
    bar.set_message(message.to_string());
    bar
}

fn finish_spinner(spinner: &ProgressBar, prefix_style: &str, prefix: &str, message: &str) {
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template(&format!("{{prefix:.{}}} {{msg}}", prefix_style))
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_prefix(prefix.to_string());
    spinner.finish_with_message(message.to_string());
}

pub fn finish_spinner_success(spinner: &ProgressBar, message: &str) {
    finish_spinner(spinner, "green", "✓", message);
}

pub fn finish_spinner_error(spinner: &ProgressBar, message: &str) {
    finish_spinner(spinner, "red", "✗", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinner_finishes() {
        let spinner = create_spinner("Wrapping...");
        assert!(!spinner.is_finished());
        finish_spinner_success(&spinner, "Done");
        assert!(spinner.is_finished());

        let failed = create_spinner("Cataloging...");
        finish_spinner_error(&failed, "makecat failed");
        assert!(failed.is_finished());
    }

    #[test]
    fn test_upload_bar_tracks_bytes() {
        let bar = create_upload_bar(4096, "Uploading");
        assert_eq!(bar.length(), Some(4096));
        bar.inc(1024);
        assert_eq!(bar.position(), 1024);
        bar.finish_and_clear();
    }
}
