use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PrecacheError;
use crate::limiter::DEFAULT_CHECK_INTERVAL;
use crate::progress::DEFAULT_SAMPLE_INTERVAL;

pub const DEFAULT_CPU_LIMIT: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Percent of one core, 1 to 100.
    pub cpu_limit: u8,
    pub check_interval: Duration,
    pub sample_interval: Duration,
    pub show_progress: bool,
    pub verify: bool,
}

impl Config {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            cpu_limit: DEFAULT_CPU_LIMIT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            show_progress: true,
            verify: false,
        }
    }

    pub fn validate(&self) -> Result<(), PrecacheError> {
        if !(1..=100).contains(&self.cpu_limit) {
            return Err(PrecacheError::Config(format!(
                "CPU limit must be between 1 and 100, got {}",
                self.cpu_limit
            )));
        }
        if same_file(&self.input, &self.output) {
            return Err(PrecacheError::Config(format!(
                "output {:?} would overwrite the input",
                self.output
            )));
        }
        Ok(())
    }

    /// CPU ceiling as a fraction of one core.
    pub fn ceiling(&self) -> f64 {
        f64::from(self.cpu_limit) / 100.0
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("stop_times.txt", "stop_times.msgpack");
        assert_eq!(config.cpu_limit, 50);
        assert_eq!(config.ceiling(), 0.5);
        assert_eq!(config.check_interval, Duration::from_millis(100));
        assert_eq!(config.sample_interval, Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_cpu_limit() {
        let mut config = Config::new("a.txt", "b.msgpack");
        config.cpu_limit = 0;
        assert!(matches!(config.validate(), Err(PrecacheError::Config(_))));
        config.cpu_limit = 101;
        assert!(matches!(config.validate(), Err(PrecacheError::Config(_))));
        config.cpu_limit = 100;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_output_over_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stop_times.txt");
        std::fs::write(&input, "trip_id\n").unwrap();

        let config = Config::new(&input, dir.path().join(".").join("stop_times.txt"));
        assert!(matches!(config.validate(), Err(PrecacheError::Config(_))));
    }
}
