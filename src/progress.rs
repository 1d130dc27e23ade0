//! Minimal spinner shown while the upload runs

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct UploadSpinner {
    spinner: ProgressBar,
}

impl UploadSpinner {
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));

        Self { spinner }
    }

    pub fn set_message(&self, msg: String) {
        self.spinner.set_message(msg);
    }

    pub fn finish_and_clear(&self) {
        self.spinner.finish_and_clear();
    }
}

impl Default for UploadSpinner {
    fn default() -> Self {
        Self::new()
    }
}
