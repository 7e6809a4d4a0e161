use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress of a simulated training run.
///
/// The progress bar shows the iterations completed by one rank and the
/// current scale. The number of iterations per second is logged when
/// the progress is dropped.
pub struct IterationProgress {
    progress_bar: ProgressBar,
    start: Instant,
    n_iterations: u64,
}

impl IterationProgress {
    pub fn new(iterations: usize) -> Result<Self> {
        let progress_bar = ProgressBar::new(iterations as u64);
        progress_bar.set_style(ProgressStyle::default_bar().template(
            "[Time: {elapsed_precise}, ETA: {eta_precise}] {bar} {pos}/{len} {msg}",
        )?);

        Ok(IterationProgress {
            progress_bar,
            start: Instant::now(),
            n_iterations: 0,
        })
    }

    /// Count a completed iteration.
    pub fn count_iteration(&mut self, scale: f64) {
        self.n_iterations += 1;
        self.progress_bar.set_message(format!("scale: {}", scale));
        self.progress_bar.inc(1);
    }

    /// Run `f` with the progress bar hidden.
    pub fn suspend<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.progress_bar.suspend(f)
    }
}

impl Drop for IterationProgress {
    fn drop(&mut self) {
        self.progress_bar.finish();

        let elapsed_secs = self.start.elapsed().as_secs_f32();
        log::info!(
            "Simulated {} iterations in {:.1}s ({:.1} iterations/s)",
            self.n_iterations,
            elapsed_secs,
            self.n_iterations as f32 / elapsed_secs
        );
    }
}
