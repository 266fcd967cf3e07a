//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

use indicatif::{ProgressBar, ProgressStyle};

use crate::use_fancy_output;

pub(crate) mod completions;
pub(crate) mod dump;
pub(crate) mod flash;
pub(crate) mod plan;

/// Percentage progress bar on stderr, hidden in quiet or non-TTY mode.
pub(crate) fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Position of `done` out of `total` in percent.
pub(crate) fn percent(done: usize, total: usize) -> u64 {
    let (Ok(done), Ok(total)) = (u64::try_from(done), u64::try_from(total)) else {
        return 100;
    };
    if total == 0 {
        return 100;
    }
    let scaled = u128::from(done.min(total)) * 100 / u128::from(total);
    u64::try_from(scaled).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 200), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(200, 200), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(usize::MAX, usize::MAX), 100);
        assert_eq!(percent(usize::MAX / 2, usize::MAX), 49);
        assert_eq!(percent(300, 200), 100);
    }

    #[test]
    fn test_quiet_progress_bar_is_hidden() {
        assert!(progress_bar(true).is_hidden());
    }
}
