//! CLI-specific progress handling for slidestitch
//!
//! Renders the library's `(done, total)` tile callbacks as an indicatif bar.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use slidestitch::ProgressCallback;

/// Creates a progress bar for tile dispatch
pub fn create_progress_bar(total_tiles: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_tiles);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} tiles ({percent}%) {per_sec} ETA: {eta}")
            .expect("Failed to create progress style")
            .progress_chars("#>-")
    );
    pb
}

/// Progress bar shared by every fragment of a run
pub struct ProgressManager {
    pub pb: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager
    pub fn new(message: &str) -> Self {
        let pb = create_progress_bar(0);

        // Print initial message to stderr
        eprintln!("{}", message);

        Self { pb }
    }

    /// Callback that follows each fragment's tile count
    ///
    /// A fragment announces itself with `(0, total)`, which resets the bar.
    /// Every later call counts one tile; worker calls arrive out of order, so
    /// their `done` value never moves the bar.
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.pb.clone();
        Arc::new(move |done, total| {
            if done == 0 || pb.length() != Some(total) {
                pb.reset();
                pb.set_length(total);
            }
            if done == 0 {
                return;
            }
            pb.inc(1);
            if pb.position() >= total {
                pb.finish_with_message("✅ Fragment written");
            }
        })
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
