use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window rate limiter on *failed* validation attempts per wallet.
/// Supplemental hardening (not named in the admission spec) that keeps a
/// malformed-token flood from pinning the single-flight ledger lookup.
pub struct FailureRateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: u32,
}

impl FailureRateLimiter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Returns `false` if this wallet has exceeded its failure budget for
    /// the current one-minute window.
    pub fn check(&self, wallet: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let entry = attempts.entry(wallet.to_string()).or_default();
        entry.retain(|t| t.elapsed() < Duration::from_secs(60));
        entry.len() < self.max_attempts as usize
    }

    pub fn record_failure(&self, wallet: &str) {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.entry(wallet.to_string()).or_default().push(Instant::now());
    }
}
