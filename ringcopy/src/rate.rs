//! Windowed rate accounting with smoothed reporting.
//!
//! One meter per coordinator (and one private to the feeder), so there is
//! never cross-task contention; everything here is `&mut self`.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Counts records over fixed reporting windows and keeps an exponentially
/// smoothed rows-per-second rate.
#[derive(Debug)]
pub struct RateMeter {
    update_interval: Duration,
    start: Instant,
    last_checkpoint: Instant,
    current_rate: f64,
    current_record: u64,
    total_records: u64,
    log_progress: bool,
    log_file: Option<PathBuf>,
}

impl RateMeter {
    /// Create a meter. With `log_progress` set, each window closes with a
    /// progress line; `log_file` additionally appends the same line to a
    /// file, which is truncated here if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing log file cannot be removed.
    pub fn new(
        update_interval: Duration,
        log_progress: bool,
        log_file: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        if let Some(path) = &log_file {
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }
        let now = Instant::now();
        Ok(Self {
            update_interval,
            start: now,
            last_checkpoint: now,
            current_rate: 0.0,
            current_record: 0,
            total_records: 0,
            log_progress,
            log_file,
        })
    }

    /// Add `n` records to the open window, rolling it if it is due.
    pub fn increment(&mut self, n: u64) {
        self.current_record += n;
        self.maybe_update();
    }

    /// Records in the window that has not been rolled yet.
    #[must_use]
    pub fn current_record(&self) -> u64 {
        self.current_record
    }

    /// Rolled total; lags the open window by up to one interval.
    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Rolled total plus the open window. Termination checks use this so
    /// they do not depend on window timing.
    #[must_use]
    pub fn grand_total(&self) -> u64 {
        self.total_records + self.current_record
    }

    /// Roll the window if `update_interval` has elapsed.
    pub fn maybe_update(&mut self) {
        if self.current_record == 0 {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_checkpoint) >= self.update_interval {
            self.update(now);
            self.log_message();
        }
    }

    /// Like [`maybe_update`](Self::maybe_update), but when the window is
    /// not yet due, sleep out the remainder. Lets a throttled caller yield
    /// until the budget refreshes.
    pub async fn maybe_update_sleeping(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_checkpoint);
        if elapsed >= self.update_interval {
            if self.current_record > 0 {
                self.update(now);
                self.log_message();
            }
            return;
        }
        tokio::time::sleep(self.update_interval - elapsed).await;
        self.maybe_update();
    }

    /// Force a final roll and report, then return the total.
    pub fn finish(&mut self) -> u64 {
        self.update(Instant::now());
        self.log_message();
        self.total_records
    }

    fn update(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_checkpoint).as_secs_f64();
        if elapsed >= 1e-9 {
            self.current_rate = self.smoothed(self.current_record as f64 / elapsed);
        }
        self.last_checkpoint = now;
        self.total_records += self.current_record;
        self.current_record = 0;
    }

    /// Average the window rate with the previous rate.
    fn smoothed(&self, new_rate: f64) -> f64 {
        if self.current_rate == 0.0 { new_rate } else { (self.current_rate + new_rate) / 2.0 }
    }

    /// Average rate since construction.
    #[must_use]
    pub fn avg_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed >= 1e-9 { self.total_records as f64 / elapsed } else { 0.0 }
    }

    fn log_message(&self) {
        if !self.log_progress {
            return;
        }
        let line = format!(
            "Processed: {} rows; Rate: {:7.0} rows/s; Avg. rate: {:7.0} rows/s",
            self.total_records,
            self.current_rate,
            self.avg_rate()
        );
        tracing::info!(
            rows = self.total_records,
            rate = self.current_rate as u64,
            avg_rate = self.avg_rate() as u64,
            "progress"
        );
        if let Some(path) = &self.log_file {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| writeln!(f, "{line}"));
            if let Err(e) = appended {
                tracing::warn!(path = %path.display(), error = %e, "cannot append rate log");
            }
        }
    }
}
