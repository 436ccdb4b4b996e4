//! Per-address back-off after failed passphrase proofs.
//!
//! Each failure within the rolling window doubles the cool-down (capped), so
//! the delay a given address sees never shrinks until it stays quiet for a
//! full window.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

pub const DEFAULT_BASE_COOLDOWN: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);
const MAX_TRACKED_ADDRESSES: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Entry {
    failures: u32,
    last_failure: Instant,
    blocked_until: Instant,
}

#[derive(Debug)]
pub struct AuthCooldown {
    base: Duration,
    max: Duration,
    window: Duration,
    entries: Mutex<HashMap<IpAddr, Entry>>,
}

impl Default for AuthCooldown {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_COOLDOWN, DEFAULT_MAX_COOLDOWN, DEFAULT_WINDOW)
    }
}

impl AuthCooldown {
    #[must_use]
    pub fn new(base: Duration, max: Duration, window: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Time left before `ip` may attempt again, if any.
    pub fn remaining(&self, ip: IpAddr) -> Option<Duration> {
        self.remaining_at(ip, Instant::now())
    }

    pub fn remaining_at(&self, ip: IpAddr, now: Instant) -> Option<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries.get(&ip)?;
        let left = entry.blocked_until.saturating_duration_since(now);
        (!left.is_zero()).then_some(left)
    }

    /// Registers a failure and returns the cool-down now in force.
    pub fn record_failure(&self, ip: IpAddr) -> Duration {
        self.record_failure_at(ip, Instant::now())
    }

    pub fn record_failure_at(&self, ip: IpAddr, now: Instant) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() >= MAX_TRACKED_ADDRESSES {
            let window = self.window;
            entries.retain(|_, e| now.saturating_duration_since(e.last_failure) < window);
        }

        let failures = match entries.get(&ip) {
            Some(entry) if now.saturating_duration_since(entry.last_failure) < self.window => {
                entry.failures.saturating_add(1)
            }
            _ => 1,
        };

        let shift = failures.saturating_sub(1).min(16);
        let cooldown = self.base.saturating_mul(1_u32 << shift).min(self.max);
        entries.insert(
            ip,
            Entry {
                failures,
                last_failure: now,
                blocked_until: now + cooldown,
            },
        );
        cooldown
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 51));

    fn tracker() -> AuthCooldown {
        AuthCooldown::new(
            Duration::from_secs(1),
            Duration::from_secs(8),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        let cd = tracker();
        let start = Instant::now();
        let mut seen = Vec::new();
        for step in 0..6 {
            seen.push(cd.record_failure_at(IP, start + Duration::from_secs(step)));
        }
        assert_eq!(
            seen,
            [1, 2, 4, 8, 8, 8].map(Duration::from_secs).to_vec()
        );
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn addresses_are_independent() {
        let cd = tracker();
        let now = Instant::now();
        cd.record_failure_at(IP, now);
        cd.record_failure_at(IP, now);
        assert!(cd.remaining_at(IP, now).is_some());
        assert!(cd.remaining_at(OTHER, now).is_none());
    }

    #[test]
    fn cooldown_expires_and_resets_after_quiet_window() {
        let cd = tracker();
        let start = Instant::now();
        cd.record_failure_at(IP, start);
        cd.record_failure_at(IP, start);
        assert_eq!(
            cd.remaining_at(IP, start + Duration::from_millis(500)),
            Some(Duration::from_millis(1500))
        );
        assert!(cd.remaining_at(IP, start + Duration::from_secs(3)).is_none());

        let later = start + Duration::from_secs(120);
        assert_eq!(cd.record_failure_at(IP, later), Duration::from_secs(1));
    }
}
