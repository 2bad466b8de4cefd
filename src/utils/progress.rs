//! Progress bars for collection runs, backed by indicatif.
//!
//! [`ProgressBar`] implements [`ProgressTracker`] so it can be handed to the
//! collection engine directly.

use crate::parallel::{ProgressTracker, Target};
use indicatif::{ProgressBar as IndicatifBar, ProgressStyle};

/// Progress bar wrapper for collection status
pub struct ProgressBar {
    bar: IndicatifBar,
}

impl ProgressBar {
    /// Create a new progress bar with known total
    pub fn new(total: usize, label: &str) -> Self {
        let bar = IndicatifBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed}) {prefix}")
                .expect("Invalid progress bar template")
                .progress_chars("█░"),
        );
        bar.set_message(label.to_string());

        Self { bar }
    }

    /// Spinner for work with no known total, such as loading range files
    pub fn new_spinner(label: &str) -> Self {
        let bar = IndicatifBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{msg} {spinner}")
                .expect("Invalid spinner template"),
        );
        bar.set_message(label.to_string());

        Self { bar }
    }

    pub fn set_length(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    pub fn update(&self, current: usize) {
        self.bar.set_position(current as u64);
    }

    pub fn inc(&self) {
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    pub fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Print a message above the progress bar without disturbing it
    pub fn println<S: AsRef<str>>(&self, msg: S) {
        self.bar.println(msg.as_ref());
    }
}

impl ProgressTracker for ProgressBar {
    fn set_total(&self, total: usize) {
        self.set_length(total);
    }

    fn on_complete(&self, completed: usize, _total: usize, target: &Target, success: bool) {
        self.update(completed);
        if !success {
            self.bar.set_prefix(format!("last failure: {}", target.label()));
        }
    }

    fn finish(&self) {
        ProgressBar::finish(self);
    }
}
