//! Byte progress bars for a single transfer

use crate::protocol::timeouts::PROGRESS_TICK_MS;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

pub struct TransferProgress {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferProgress {
    /// Visible bar when `enabled`, otherwise a hidden one that costs nothing
    pub fn new(label: &str, total: u64, enabled: bool) -> Self {
        let bar = if enabled {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar.enable_steady_tick(Duration::from_millis(PROGRESS_TICK_MS));
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(label.to_string());
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    pub fn finish(&self, msg: &str) {
        let secs = self.start_time.elapsed().as_secs_f64();
        self.bar
            .finish_with_message(format!("{} in {:.1}s", msg, secs));
    }

    pub fn abandon(&self, msg: &str) {
        self.bar.abandon_with_message(msg.to_string());
    }
}
