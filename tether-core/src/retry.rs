use std::time::Duration;

/// Upper bound of the backoff countdown, in seconds.
pub const MAX_COUNTDOWN_SECS: u32 = 10;

/// Offline retry bookkeeping.
///
/// `countdown_secs` always stays within `0..=start`, and `start` is at most
/// [`MAX_COUNTDOWN_SECS`]. Once the countdown reaches zero the next tick wraps
/// it back to `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u64,
    pub countdown_secs: u32,
    start: u32,
}

/// What one offline tick produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryTick {
    /// Attempt number to report to the UI
    pub attempt: u64,
    /// Countdown value reported to the UI, taken before advancing
    pub countdown: u32,
    /// Delay until the next launch attempt
    pub next_delay: Duration,
}

impl RetryState {
    pub fn new(start: u32) -> Self {
        let start = start.min(MAX_COUNTDOWN_SECS);
        Self {
            attempt_count: 0,
            countdown_secs: start,
            start,
        }
    }

    /// Record an offline attempt and advance the countdown.
    pub fn tick(&mut self) -> RetryTick {
        self.attempt_count += 1;
        let reported = self.countdown_secs;

        if self.countdown_secs > 0 {
            self.countdown_secs -= 1;
        } else {
            self.countdown_secs = self.start;
        }

        RetryTick {
            attempt: self.attempt_count,
            countdown: reported,
            next_delay: Duration::from_secs(u64::from(self.countdown_secs)),
        }
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.countdown_secs = self.start;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(MAX_COUNTDOWN_SECS)
    }
}
