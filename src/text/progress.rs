use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receives progress from long-running text operations.
pub trait ProgressReporter {
    /// `current` of `total` units of the step named `msg` are done.
    fn update(&mut self, msg: &str, current: u64, total: u64);

    fn finished(&mut self) {}
}

/// Progress bar on stderr.
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }

    /// A bar that draws nothing; useful when stderr is not a terminal.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for IndicatifProgress {
    fn update(&mut self, msg: &str, current: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(current);
        self.bar.set_message(msg.to_string());
    }

    fn finished(&mut self) {
        self.bar.finish_and_clear();
    }
}
