//! Progress display for fetch operations

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use is_terminal::IsTerminal;
use pagesync_core::{Progress, ProgressCallback};

/// Page progress bar on stderr.
///
/// Starts as a spinner and becomes a bar once the page total is known.
/// Hidden when stderr is not a terminal or `--quiet` was given.
#[derive(Clone)]
pub struct FetchProgress {
    bar: ProgressBar,
}

impl FetchProgress {
    /// Create the display; `visible` is ANDed with "stderr is a terminal".
    pub fn new(visible: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        if !(visible && std::io::stderr().is_terminal()) {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {pos} pages {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar }
    }

    /// Apply one progress report.
    pub fn update(&self, progress: Progress) {
        if let Some(total) = progress.total {
            if self.bar.length() != Some(total as u64) {
                self.bar.set_length(total as u64);
                self.bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
            }
        }
        self.bar.set_position(progress.completed as u64);
    }

    /// Callback feeding this display.
    pub fn callback(&self) -> ProgressCallback {
        let display = self.clone();
        Arc::new(move |progress| display.update(progress))
    }

    /// Remove the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
