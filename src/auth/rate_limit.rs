use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Sliding-window failed-authentication limiter, keyed by client IP.
///
/// Only failures are recorded; a successful authentication does not reset
/// the window. State is in-memory and lost on restart.
pub struct RateLimiter {
    window: Duration,
    max_attempts: u32,
    attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            max_attempts: config.max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// True when the IP is still allowed to attempt authentication.
    /// Prunes expired entries as a side effect.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap();
        match attempts.get_mut(&ip) {
            None => true,
            Some(stamps) => {
                stamps.retain(|t| now.duration_since(*t) < self.window);
                if stamps.is_empty() {
                    attempts.remove(&ip);
                    return true;
                }
                (stamps.len() as u32) < self.max_attempts
            }
        }
    }

    /// Record a failed authentication attempt against the IP.
    pub fn record_failure(&self, ip: IpAddr) {
        if self.max_attempts == 0 {
            return;
        }
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap();
        let stamps = attempts.entry(ip).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);
        stamps.push(now);
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}
