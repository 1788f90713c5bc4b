//! Progress and log facade.
//!
//! The engine reports through a [`Notifier`] instead of printing: in quiet
//! mode (verbosity 0) messages drive an `indicatif` spinner and layer
//! progress bars; at higher verbosity they become plain `log` records and
//! bars are suppressed.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbosityLevel {
    Quiet,
    Info,
    Debug,
    Trace,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    multi: Option<Arc<MultiProgress>>,
    spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity);
        let multi = if verbosity == VerbosityLevel::Quiet {
            Some(Arc::new(MultiProgress::new()))
        } else {
            None
        };
        Notifier {
            verbosity,
            multi,
            spinner: RefCell::new(None),
        }
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        self.verbosity
    }

    pub fn info(&self, message: &str) {
        if self.verbosity == VerbosityLevel::Quiet {
            self.spin(message);
        } else {
            info!("{message}");
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            debug!("{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        warn!("{message}");
    }

    /// A bounded progress bar for layer processing; `None` outside quiet mode.
    pub fn layer_progress(&self, total: u64, message: &str) -> Option<ProgressBar> {
        let multi = self.multi.as_ref()?;
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}",
            )
            .unwrap()
            .progress_chars("=> ");
        let bar = multi.add(ProgressBar::new(total));
        bar.set_style(style);
        bar.set_message(message.to_string());
        Some(bar)
    }

    fn spin(&self, message: &str) {
        if self.spinner.borrow().is_none() {
            if let Some(multi) = &self.multi {
                let style = ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap();
                let spinner = multi.add(ProgressBar::new_spinner());
                spinner.set_style(style);
                spinner.enable_steady_tick(Duration::from_millis(100));
                *self.spinner.borrow_mut() = Some(spinner);
            }
        }
        if let Some(spinner) = self.spinner.borrow().as_ref() {
            spinner.set_message(message.to_string());
        }
    }

    pub fn finish(&self) {
        if let Some(spinner) = self.spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(VerbosityLevel::from(0), VerbosityLevel::Quiet);
        assert_eq!(VerbosityLevel::from(1), VerbosityLevel::Info);
        assert_eq!(VerbosityLevel::from(2), VerbosityLevel::Debug);
        assert_eq!(VerbosityLevel::from(9), VerbosityLevel::Trace);
    }

    #[test]
    fn verbose_mode_has_no_bars() {
        let notifier = Notifier::new(2);
        assert!(notifier.layer_progress(10, "layers").is_none());
        notifier.info("plain log path");
        notifier.finish();
    }
}
