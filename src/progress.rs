//! Progress tracking and reporting

use indicatif::{ProgressBar, ProgressStyle};

/// Byte-level progress bar over the whole transfer set.
pub struct ProgressTracker {
    progress_bar: ProgressBar,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(total_bytes: u64) -> Self {
        let pb = ProgressBar::new(total_bytes);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { progress_bar: pb }
    }

    /// One file finished; advance by its size.
    pub fn update(&mut self, bytes: u64) {
        self.progress_bar.inc(bytes);
    }

    pub fn finish(&self) {
        self.progress_bar.finish_and_clear();
    }
}
