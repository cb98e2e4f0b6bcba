use std::time::{Duration, Instant};

use crate::resources;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// CPU and wall time spent during one measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub cpu: Duration,
    pub wall: Duration,
}

impl UsageWindow {
    pub fn utilization(&self) -> f64 {
        if self.wall.is_zero() {
            return 0.0;
        }
        self.cpu.as_secs_f64() / self.wall.as_secs_f64()
    }
}

/// Feedback law deciding how long to pause after a window.
pub trait Throttle {
    fn observe(&mut self, window: UsageWindow) -> Duration;
}

/// Sleeps just long enough that the observed window would have met the
/// ceiling had the pause been part of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProportionalThrottle {
    ceiling: f64,
}

impl ProportionalThrottle {
    /// `ceiling` is a fraction of one core, clamped to `(0, 1]`.
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling: ceiling.clamp(f64::EPSILON, 1.0),
        }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }
}

impl Throttle for ProportionalThrottle {
    fn observe(&mut self, window: UsageWindow) -> Duration {
        if window.utilization() <= self.ceiling {
            return Duration::ZERO;
        }
        let target_wall = window.cpu.as_secs_f64() / self.ceiling;
        Duration::try_from_secs_f64(target_wall - window.wall.as_secs_f64())
            .unwrap_or(Duration::ZERO)
    }
}

pub trait ProcessClock {
    /// Monotonic time since an arbitrary origin.
    fn wall(&self) -> Duration;
    fn cpu_time(&self) -> Option<Duration>;
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl ProcessClock for SystemClock {
    fn wall(&self) -> Duration {
        self.origin.elapsed()
    }

    fn cpu_time(&self) -> Option<Duration> {
        resources::process_cpu_time()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    wall: Duration,
    cpu: Duration,
}

/// Caps process CPU utilization by pausing the calling loop.
///
/// `tick` is cheap to call on every row: it only samples the clocks once per
/// check interval. The first sample only establishes a baseline. A pause is
/// decided from the window that just closed and the next window opens after
/// the pause.
#[derive(Debug)]
pub struct CpuLimiter<C, T> {
    clock: C,
    throttle: T,
    interval: Duration,
    last: Option<Mark>,
    throttled: Duration,
}

impl<C: ProcessClock, T: Throttle> CpuLimiter<C, T> {
    pub fn new(clock: C, throttle: T, interval: Duration) -> Self {
        Self {
            clock,
            throttle,
            interval,
            last: None,
            throttled: Duration::ZERO,
        }
    }

    pub fn tick(&mut self) -> Duration {
        let wall = self.clock.wall();
        if let Some(last) = self.last {
            if wall.saturating_sub(last.wall) < self.interval {
                return Duration::ZERO;
            }
        }
        let Some(cpu) = self.clock.cpu_time() else {
            return Duration::ZERO;
        };

        let pause = match self.last {
            Some(last) => self.throttle.observe(UsageWindow {
                cpu: cpu.saturating_sub(last.cpu),
                wall: wall.saturating_sub(last.wall),
            }),
            None => Duration::ZERO,
        };

        if pause.is_zero() {
            self.last = Some(Mark { wall, cpu });
        } else {
            log::trace!("CPU over ceiling, pausing {:?}", pause);
            self.clock.sleep(pause);
            self.throttled += pause;
            self.last = Some(Mark {
                wall: self.clock.wall(),
                cpu: self.clock.cpu_time().unwrap_or(cpu),
            });
        }
        pause
    }

    /// Total time spent paused so far.
    pub fn throttled(&self) -> Duration {
        self.throttled
    }
}
