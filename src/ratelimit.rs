//! Progressive per-client throttle for the public API.
//!
//! Clients are never rejected. Their recent request volume inside a sliding window maps to an
//! artificial delay the route layer applies before answering.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Whitelist;

pub const WINDOW: Duration = Duration::from_secs(60);

/// Upper bound (exclusive) on requests in the window, and the delay below it.
const THRESHOLDS: [(usize, Duration); 4] = [
  (50, Duration::ZERO),
  (100, Duration::from_secs(1)),
  (200, Duration::from_secs(10)),
  (500, Duration::from_secs(60)),
];
const MAX_DELAY: Duration = Duration::from_secs(300);

fn delay_for(count: usize) -> Duration {
  THRESHOLDS
    .iter()
    .find(|(limit, _)| count < *limit)
    .map_or(MAX_DELAY, |(_, delay)| *delay)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
  pub active_clients: usize,
  pub total_requests_in_window: usize,
  pub whitelist_ips: usize,
  pub whitelist_networks: usize,
}

#[derive(Default)]
struct History {
  clients: HashMap<String, VecDeque<Instant>>,
  last_sweep: Option<Instant>,
}

impl History {
  /// Forget clients with nothing left in the window, at most once per window.
  fn sweep(&mut self, now: Instant) {
    let due = self
      .last_sweep
      .map_or(true, |at| now.saturating_duration_since(at) >= WINDOW);
    if due {
      self.clients.retain(|_, stamps| prune(stamps, now));
      self.last_sweep = Some(now);
    }
  }
}

pub struct RateLimiter {
  history: Mutex<History>,
  whitelist: Whitelist,
}

/// Drop timestamps that fell out of the window; returns whether anything is left.
fn prune(stamps: &mut VecDeque<Instant>, now: Instant) -> bool {
  while stamps
    .front()
    .is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW)
  {
    stamps.pop_front();
  }
  !stamps.is_empty()
}

impl RateLimiter {
  pub fn new(whitelist: Whitelist) -> Self {
    for entry in &whitelist.invalid {
      tracing::warn!(entry = %entry, "Ignoring invalid whitelist entry");
    }
    tracing::info!(
      ips = whitelist.ips.len(),
      networks = whitelist.networks.len(),
      "Initialized rate limiter"
    );
    Self {
      history: Mutex::new(History::default()),
      whitelist,
    }
  }

  fn history(&self) -> std::sync::MutexGuard<'_, History> {
    self.history.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Exact match first, then network ranges. Unparsable ids are never whitelisted.
  pub fn is_whitelisted(&self, client_id: &str) -> bool {
    let Ok(ip) = client_id.trim().parse::<IpAddr>() else {
      return false;
    };
    self.whitelist.ips.contains(&ip) || self.whitelist.networks.iter().any(|net| net.contains(ip))
  }

  /// Delay to apply to this client's next response.
  pub fn get_delay(&self, client_id: &str) -> Duration {
    self.get_delay_at(client_id, Instant::now())
  }

  fn get_delay_at(&self, client_id: &str, now: Instant) -> Duration {
    if self.is_whitelisted(client_id) {
      return Duration::ZERO;
    }

    let mut history = self.history();
    let count = match history.clients.get_mut(client_id) {
      Some(stamps) => {
        if prune(stamps, now) {
          stamps.len()
        } else {
          history.clients.remove(client_id);
          0
        }
      }
      None => 0,
    };
    delay_for(count)
  }

  pub fn record_request(&self, client_id: &str) {
    self.record_request_at(client_id, Instant::now());
  }

  fn record_request_at(&self, client_id: &str, now: Instant) {
    if self.is_whitelisted(client_id) {
      return;
    }
    let mut history = self.history();
    history.sweep(now);
    let stamps = history.clients.entry(client_id.to_string()).or_default();
    stamps.push_back(now);
    prune(stamps, now);
  }

  /// Record the request, then wait out whatever delay the client has earned.
  pub async fn throttle(&self, client_id: &str) -> Duration {
    self.record_request(client_id);
    let delay = self.get_delay(client_id);
    if !delay.is_zero() {
      tracing::debug!(client = client_id, delay_secs = delay.as_secs(), "Throttling client");
      tokio::time::sleep(delay).await;
    }
    delay
  }

  pub fn stats(&self) -> RateLimitStats {
    self.stats_at(Instant::now())
  }

  fn stats_at(&self, now: Instant) -> RateLimitStats {
    let mut history = self.history();
    history.clients.retain(|_, stamps| prune(stamps, now));
    RateLimitStats {
      active_clients: history.clients.len(),
      total_requests_in_window: history.clients.values().map(VecDeque::len).sum(),
      whitelist_ips: self.whitelist.ips.len(),
      whitelist_networks: self.whitelist.networks.len(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn limiter(whitelist: &[&str]) -> RateLimiter {
    RateLimiter::new(Whitelist::parse(whitelist))
  }

  #[test]
  fn test_threshold_boundaries() {
    let limiter = limiter(&[]);
    let now = Instant::now();
    let client = "203.0.113.9";

    for _ in 0..49 {
      limiter.record_request_at(client, now);
    }
    assert_eq!(limiter.get_delay_at(client, now), Duration::ZERO);

    limiter.record_request_at(client, now);
    // 50 requests reaches the first step
    assert_eq!(limiter.get_delay_at(client, now), Duration::from_secs(1));

    limiter.record_request_at(client, now);
    assert_eq!(limiter.get_delay_at(client, now), Duration::from_secs(1));
  }

  #[test]
  fn test_delay_table() {
    assert_eq!(delay_for(0), Duration::ZERO);
    assert_eq!(delay_for(99), Duration::from_secs(1));
    assert_eq!(delay_for(100), Duration::from_secs(10));
    assert_eq!(delay_for(499), Duration::from_secs(60));
    assert_eq!(delay_for(500), Duration::from_secs(300));
  }

  #[test]
  fn test_whitelist_exact_and_network() {
    let limiter = limiter(&["127.0.0.1", "10.0.0.0/8", "not-an-ip"]);
    let now = Instant::now();
    for client in ["127.0.0.1", "10.20.30.40"] {
      for _ in 0..1000 {
        limiter.record_request_at(client, now);
        assert_eq!(limiter.get_delay_at(client, now), Duration::ZERO);
      }
    }
    let stats = limiter.stats_at(now);
    assert_eq!(stats.active_clients, 0);
    assert_eq!(stats.whitelist_ips, 1);
    assert_eq!(stats.whitelist_networks, 1);
  }

  #[test]
  fn test_invalid_client_id_is_throttled_normally() {
    let limiter = limiter(&["10.0.0.0/8"]);
    assert!(!limiter.is_whitelisted("garbage"));
    let now = Instant::now();
    for _ in 0..100 {
      limiter.record_request_at("garbage", now);
    }
    assert_eq!(limiter.get_delay_at("garbage", now), Duration::from_secs(10));
  }

  #[test]
  fn test_requests_age_out_of_window() {
    let limiter = limiter(&[]);
    let start = Instant::now();
    for _ in 0..250 {
      limiter.record_request_at("198.51.100.1", start);
    }
    assert_eq!(limiter.get_delay_at("198.51.100.1", start), Duration::from_secs(60));

    let later = start + WINDOW + Duration::from_secs(1);
    assert_eq!(limiter.get_delay_at("198.51.100.1", later), Duration::ZERO);
    assert_eq!(limiter.stats_at(later).active_clients, 0);
  }

  #[test]
  fn test_delay_is_monotonic_in_request_count() {
    let limiter = limiter(&[]);
    let now = Instant::now();
    let mut previous = Duration::ZERO;
    for _ in 0..600 {
      limiter.record_request_at("192.0.2.7", now);
      let delay = limiter.get_delay_at("192.0.2.7", now);
      assert!(delay >= previous);
      previous = delay;
    }
    assert_eq!(previous, MAX_DELAY);
  }

  #[test]
  fn test_stats_counts_clients_in_window() {
    let limiter = limiter(&[]);
    let now = Instant::now();
    limiter.record_request_at("192.0.2.1", now);
    limiter.record_request_at("192.0.2.1", now);
    limiter.record_request_at("192.0.2.2", now);
    let stats = limiter.stats_at(now);
    assert_eq!(stats.active_clients, 2);
    assert_eq!(stats.total_requests_in_window, 3);
  }

  #[test]
  fn test_one_shot_clients_are_forgotten() {
    let limiter = limiter(&[]);
    let start = Instant::now();
    for i in 0..200 {
      limiter.record_request_at(&format!("198.51.100.{}", i), start);
    }
    assert_eq!(limiter.history().clients.len(), 200);

    // None of the old clients is ever asked about again
    let later = start + WINDOW + Duration::from_secs(1);
    limiter.record_request_at("192.0.2.99", later);
    let history = limiter.history();
    assert_eq!(history.clients.len(), 1);
    assert!(history.clients.contains_key("192.0.2.99"));
  }

  #[test]
  fn test_expired_client_is_dropped_on_lookup() {
    let limiter = limiter(&[]);
    let start = Instant::now();
    limiter.record_request_at("203.0.113.1", start);
    let later = start + WINDOW;
    assert_eq!(limiter.get_delay_at("203.0.113.1", later), Duration::ZERO);
    assert!(!limiter.history().clients.contains_key("203.0.113.1"));
  }

  #[tokio::test]
  async fn test_throttle_passes_quiet_client() {
    let limiter = limiter(&[]);
    assert_eq!(limiter.throttle("192.0.2.50").await, Duration::ZERO);
    assert_eq!(limiter.stats().total_requests_in_window, 1);
  }
}
