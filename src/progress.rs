use std::fmt;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

use crate::resources;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub processed: u64,
    pub total: u64,
    pub percent: f64,
    pub rows_per_second: f64,
    pub eta: Option<Duration>,
    pub memory: Option<u64>,
}

impl fmt::Display for ProgressSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Progress: {:.1}% ({}/{}) | Speed: {:.0} rows/s | Memory: {} | ETA: {}",
            self.percent,
            self.processed,
            self.total,
            self.rows_per_second,
            self.memory.map_or_else(|| "n/a".to_owned(), format_size),
            self.eta.map_or_else(|| "n/a".to_owned(), format_eta),
        )
    }
}

#[derive(Debug)]
pub struct ProgressState {
    total_rows: u64,
    processed_rows: u64,
    start: Instant,
    last_sample: Instant,
    interval: Duration,
    rows_per_second: f64,
    memory: Option<u64>,
}

impl ProgressState {
    pub fn new(total_rows: u64, start: Instant, interval: Duration) -> Self {
        Self {
            total_rows,
            processed_rows: 0,
            start,
            last_sample: start,
            interval,
            rows_per_second: 0.0,
            memory: None,
        }
    }

    pub fn record(&mut self, rows: u64) {
        self.processed_rows += rows;
    }

    /// Returns a fresh sample if at least one interval passed since the last.
    pub fn sample(
        &mut self,
        now: Instant,
        memory: impl FnOnce() -> Option<u64>,
    ) -> Option<ProgressSample> {
        if now.saturating_duration_since(self.last_sample) < self.interval {
            return None;
        }
        self.last_sample = now;
        self.memory = memory();
        Some(self.snapshot(now))
    }

    pub fn snapshot(&mut self, now: Instant) -> ProgressSample {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        self.rows_per_second = if elapsed > 0.0 {
            self.processed_rows as f64 / elapsed
        } else {
            0.0
        };

        let remaining = self.total_rows.saturating_sub(self.processed_rows);
        let eta = (self.rows_per_second > 0.0)
            .then(|| Duration::from_secs_f64(remaining as f64 / self.rows_per_second));
        let percent = if self.total_rows == 0 {
            100.0
        } else {
            self.processed_rows as f64 / self.total_rows as f64 * 100.0
        };

        ProgressSample {
            processed: self.processed_rows,
            total: self.total_rows,
            percent,
            rows_per_second: self.rows_per_second,
            eta,
            memory: self.memory,
        }
    }
}

/// Status line on stderr, refreshed at most once per sample interval.
pub struct ProgressMonitor {
    state: ProgressState,
    bar: ProgressBar,
}

impl ProgressMonitor {
    pub fn new(total_rows: u64, interval: Duration, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(total_rows);
            bar.set_style(
                ProgressStyle::with_template("[{bar:30}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            state: ProgressState::new(total_rows, Instant::now(), interval),
            bar,
        }
    }

    pub fn advance(&mut self) {
        self.state.record(1);
        if let Some(sample) = self.state.sample(Instant::now(), resources::resident_memory) {
            self.bar.set_position(sample.processed);
            self.bar.set_message(sample.to_string());
            log::trace!("{}", sample);
        }
    }

    /// Runs `f` with the status line cleared, so diagnostics don't interleave with it.
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.bar.suspend(f)
    }

    pub fn finish(mut self) -> ProgressSample {
        self.bar.finish_and_clear();
        self.state.memory = resources::resident_memory();
        self.state.snapshot(Instant::now())
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

pub fn format_eta(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
