//! Per-provider circuit breaker — closed/open/half-open fault isolation,
//! lazily created on first use and keyed by provider name.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, opened_at: None }
    }
}

/// A registry of per-provider breakers, each with its own failure
/// threshold and reset timeout (defaults 5 failures / 60s).
pub struct CircuitBreakerRegistry {
    failure_threshold: u32,
    reset_timeout: Duration,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request to this provider should currently be allowed.
    /// A transition from `open` to `half_open` happens here when the
    /// reset timeout has elapsed.
    pub fn allow_request(&self, provider: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(provider.to_string()).or_insert_with(BreakerState::new);
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = breaker.opened_at.expect("open state always carries opened_at");
                if opened_at.elapsed() >= self.reset_timeout {
                    breaker.state = CircuitState::HalfOpen;
                    transition_metric(provider, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn on_success(&self, provider: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(provider.to_string()).or_insert_with(BreakerState::new);
        if breaker.state != CircuitState::Closed {
            breaker.state = CircuitState::Closed;
            transition_metric(provider, CircuitState::Closed);
        }
        breaker.failure_count = 0;
        breaker.opened_at = None;
    }

    pub fn on_failure(&self, provider: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(provider.to_string()).or_insert_with(BreakerState::new);
        breaker.failure_count += 1;
        if breaker.failure_count >= self.failure_threshold {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            transition_metric(provider, CircuitState::Open);
        }
    }
}

fn transition_metric(provider: &str, to_state: CircuitState) {
    metrics::counter!("lkg_breaker_transitions_total", "provider" => provider.to_string(), "to_state" => to_state.as_str())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_and_half_opens_after_timeout() {
        let breaker = CircuitBreakerRegistry::new(3, Duration::from_millis(10));
        assert!(breaker.allow_request("openai"));
        breaker.on_failure("openai");
        breaker.on_failure("openai");
        assert!(breaker.allow_request("openai"));
        breaker.on_failure("openai");
        assert!(!breaker.allow_request("openai"), "breaker should be open after 3 failures");

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request("openai"), "breaker should half-open after reset timeout");
    }

    #[test]
    fn success_resets_failure_count_from_any_state() {
        let breaker = CircuitBreakerRegistry::new(2, Duration::from_secs(60));
        breaker.on_failure("anthropic");
        breaker.on_success("anthropic");
        breaker.on_failure("anthropic");
        assert!(breaker.allow_request("anthropic"), "single post-reset failure should not reopen");
    }

    #[test]
    fn providers_have_independent_state() {
        let breaker = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        breaker.on_failure("openai");
        assert!(!breaker.allow_request("openai"));
        assert!(breaker.allow_request("anthropic"));
    }
}
