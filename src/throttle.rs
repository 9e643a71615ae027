// Token-bucket rate limiting with a minimum inter-operation latency.
// Numan Thabit 2026

use std::time::{Duration, Instant};

/// Outcome of a throttle request: how many bytes may move now, and how long
/// to wait before retrying when fewer than requested were granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Bytes allowed immediately. Zero means the caller must back off.
    pub allowed: usize,
    /// Suggested wait before the next attempt. `None` when `allowed == size`.
    pub wait: Option<Duration>,
}

impl Grant {
    fn full(size: usize) -> Self {
        Self {
            allowed: size,
            wait: None,
        }
    }
}

/// A per-direction byte throttle.
///
/// Two independent knobs: `bandwidth` caps bytes per wall-clock second
/// (0 disables the cap), `latency` enforces a minimum gap between operations
/// in microseconds (0 disables the gap). The current-second counter resets on
/// every second boundary, so the invariant is per-calendar-second, not a
/// sliding window.
#[derive(Debug, Clone)]
pub struct Throttle {
    bandwidth: u64,
    latency_us: u64,
    second_start: Instant,
    bytes_this_second: u64,
    last_op: Option<Instant>,
    total: u64,
}

impl Throttle {
    /// Creates a disabled throttle (no bandwidth cap, no latency floor).
    pub fn new() -> Self {
        Self {
            bandwidth: 0,
            latency_us: 0,
            second_start: Instant::now(),
            bytes_this_second: 0,
            last_op: None,
            total: 0,
        }
    }

    /// Creates a throttle with the given caps.
    pub fn with_limits(bandwidth: u64, latency_us: u64) -> Self {
        let mut throttle = Self::new();
        throttle.bandwidth = bandwidth;
        throttle.latency_us = latency_us;
        throttle
    }

    /// Sets the bandwidth cap in bytes per second. Zero disables it.
    pub fn set_bandwidth(&mut self, bytes_per_second: u64) {
        self.bandwidth = bytes_per_second;
    }

    /// Sets the minimum gap between operations, in microseconds.
    pub fn set_latency(&mut self, micros: u64) {
        self.latency_us = micros;
    }

    /// Returns the configured bandwidth cap.
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    /// Returns true when neither knob constrains traffic.
    pub fn is_unlimited(&self) -> bool {
        self.bandwidth == 0 && self.latency_us == 0
    }

    /// Total bytes reported over the throttle's lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes reported within the current second; the actual observed rate.
    pub fn current_rate(&mut self) -> u64 {
        self.roll_second(Instant::now());
        self.bytes_this_second
    }

    fn roll_second(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.second_start);
        if elapsed >= Duration::from_secs(1) {
            // Align the window start to the most recent whole-second boundary.
            let whole = Duration::from_secs(elapsed.as_secs());
            self.second_start += whole;
            self.bytes_this_second = 0;
        }
    }

    /// Asks how many of `size` bytes may move right now.
    pub fn request(&mut self, size: usize) -> Grant {
        self.request_at(size, Instant::now())
    }

    fn request_at(&mut self, size: usize, now: Instant) -> Grant {
        self.roll_second(now);

        if self.latency_us > 0 {
            if let Some(last) = self.last_op {
                let elapsed = now.duration_since(last);
                let gap = Duration::from_micros(self.latency_us);
                if elapsed < gap {
                    return Grant {
                        allowed: 0,
                        wait: Some(gap - elapsed),
                    };
                }
            }
        }

        if self.bandwidth > 0 {
            let remaining = self.bandwidth.saturating_sub(self.bytes_this_second);
            let allowed = (remaining as usize).min(size);
            if allowed < size {
                let into_second = now.duration_since(self.second_start);
                let wait = Duration::from_secs(1)
                    .checked_sub(into_second)
                    .unwrap_or(Duration::from_millis(1))
                    .max(Duration::from_millis(1));
                return Grant {
                    allowed,
                    wait: Some(wait),
                };
            }
        }

        Grant::full(size)
    }

    /// Records `size` bytes as moved, updating the window and last-op stamp.
    pub fn report(&mut self, size: usize) {
        self.report_at(size, Instant::now());
    }

    fn report_at(&mut self, size: usize, now: Instant) {
        self.roll_second(now);
        self.bytes_this_second = self.bytes_this_second.saturating_add(size as u64);
        self.total = self.total.saturating_add(size as u64);
        self.last_op = Some(now);
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

/// Combines grants from a stack of throttles (e.g. per-socket plus group):
/// the allowance is the minimum, the wait hint the maximum.
pub fn request_stacked(throttles: &mut [&mut Throttle], size: usize) -> Grant {
    let mut grant = Grant::full(size);
    for throttle in throttles.iter_mut() {
        let g = throttle.request(size);
        grant.allowed = grant.allowed.min(g.allowed);
        grant.wait = match (grant.wait, g.wait) {
            (None, w) | (w, None) => w,
            (Some(a), Some(b)) => Some(a.max(b)),
        };
    }
    grant
}

/// Reports an operation against every throttle in the stack.
pub fn report_stacked(throttles: &mut [&mut Throttle], size: usize) {
    for throttle in throttles.iter_mut() {
        throttle.report(size);
    }
}
