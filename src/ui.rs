//! Progress bars and operator-facing messages.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Application UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that draws nothing.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(
                ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// Get a writer for `tracing` that will not tear our progress bars.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Print a one-line message to stderr, above any progress bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        self.multi_progress.suspend(|| eprintln!("{emoji} {msg}"));
    }

    /// Create a progress bar for `len` units.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        let pb = self
            .multi_progress
            .add(ProgressBar::new(len).with_style(progress_style()));
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.set_prefix(config.emoji.to_owned());
        pb.set_message(config.msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

/// How to label a progress bar.
pub struct ProgressConfig<'a> {
    pub emoji: &'a str,
    /// Shown while running.
    pub msg: &'a str,
    /// Shown once finished.
    pub done_msg: &'a str,
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "  {prefix:3}{msg:20} {pos:>5}/{len:5} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}",
        )
        .expect("bad progress bar template")
}

/// Writes to stderr, suspending progress bars while it does so.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
