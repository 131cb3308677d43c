//! Timer configuration for the RFC 3261 machines.
//!
//! T1 estimates the RTT, T2 caps retransmission intervals, T4 bounds
//! how long a message stays in the network. Every concrete timer
//! (A through K) derives from these three.

use std::time::Duration;

/// Durations for the base timers and the waits derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// RTT estimate, default 500 ms.
    pub t1: Duration,
    /// Retransmission cap, default 4 s.
    pub t2: Duration,
    /// Maximum message lifetime, default 5 s.
    pub t4: Duration,
    /// Timer D: wait for INVITE response retransmissions (unreliable
    /// transports), default 32 s.
    pub timer_d: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            timer_d: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// Short timers for tests, keeping the same ratios.
    pub fn fast() -> Self {
        TimerSettings {
            t1: Duration::from_millis(20),
            t2: Duration::from_millis(160),
            t4: Duration::from_millis(200),
            timer_d: Duration::from_millis(400),
        }
    }

    /// Timer B/F/H overall timeout: 64*T1.
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Next retransmission interval: double, capped at T2.
    pub fn next_retransmit(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }
}
