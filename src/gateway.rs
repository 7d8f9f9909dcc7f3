use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::error::{GatewayError, GenerationError};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// External generative text service.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub requests_per_day: u32,
}

impl RateLimits {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32, requests_per_day: u32) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1),
            tokens_per_minute: tokens_per_minute.max(1),
            requests_per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub requests_this_minute: u32,
    pub tokens_this_minute: u32,
    pub requests_today: u32,
    pub daily_exhausted: bool,
    pub limits: RateLimits,
}

#[derive(Default)]
struct BudgetState {
    minute: VecDeque<(Instant, u32)>,
    tokens_this_minute: u32,
    day: VecDeque<Instant>,
    exhausted_until: Option<Instant>,
}

impl BudgetState {
    fn prune(&mut self, now: Instant) {
        while let Some(&(at, tokens)) = self.minute.front() {
            if now.duration_since(at) < MINUTE {
                break;
            }
            self.tokens_this_minute = self.tokens_this_minute.saturating_sub(tokens);
            self.minute.pop_front();
        }
        while let Some(&at) = self.day.front() {
            if now.duration_since(at) < DAY {
                break;
            }
            self.day.pop_front();
        }
        if self.exhausted_until.is_some_and(|until| now >= until) {
            self.exhausted_until = None;
        }
    }

    fn daily_exhausted(&self, limits: &RateLimits) -> bool {
        self.exhausted_until.is_some() || self.day.len() >= limits.requests_per_day as usize
    }

    /// How long until a request of `tokens` fits the minute window, if it does not now.
    fn minute_wait(&self, now: Instant, tokens: u32, limits: &RateLimits) -> Option<Duration> {
        let fits = |requests: usize, used: u32| {
            requests < limits.requests_per_minute as usize
                && used.saturating_add(tokens) <= limits.tokens_per_minute
        };

        if fits(self.minute.len(), self.tokens_this_minute) {
            return None;
        }

        let mut requests = self.minute.len();
        let mut used = self.tokens_this_minute;
        for &(at, spent) in &self.minute {
            requests -= 1;
            used = used.saturating_sub(spent);
            if fits(requests, used) {
                return Some((at + MINUTE).saturating_duration_since(now));
            }
        }
        Some(MINUTE)
    }

    fn record(&mut self, now: Instant, tokens: u32) {
        self.minute.push_back((now, tokens));
        self.tokens_this_minute = self.tokens_this_minute.saturating_add(tokens);
        self.day.push_back(now);
    }
}

/// Shared by every concurrent query. The one-minute request and token windows
/// block until there is room; the one-day request window fails fast.
pub struct RateBudget {
    limits: RateLimits,
    state: Mutex<BudgetState>,
}

impl RateBudget {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Reserves one request of `tokens`, waiting for minute-window capacity.
    /// Reservations are never refunded.
    pub async fn acquire(&self, tokens: u32) -> Result<(), GatewayError> {
        if tokens > self.limits.tokens_per_minute {
            return Err(GatewayError::InvalidRequest(format!(
                "request needs {tokens} tokens but the per-minute cap is {}",
                self.limits.tokens_per_minute
            )));
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.prune(now);
                if state.daily_exhausted(&self.limits) {
                    return Err(GatewayError::RateLimitedDaily);
                }
                match state.minute_wait(now, tokens, &self.limits) {
                    None => {
                        state.record(now, tokens);
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };

            tracing::debug!(wait_ms = wait.as_millis() as u64, tokens, "waiting for rate window");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn ensure_daily_capacity(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        if state.daily_exhausted(&self.limits) {
            return Err(GatewayError::RateLimitedDaily);
        }
        Ok(())
    }

    /// Used when the service itself reports its quota gone.
    pub async fn mark_daily_exhausted(&self) {
        let mut state = self.state.lock().await;
        state.exhausted_until = Some(Instant::now() + DAY);
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        BudgetSnapshot {
            requests_this_minute: state.minute.len() as u32,
            tokens_this_minute: state.tokens_this_minute,
            requests_today: state.day.len() as u32,
            daily_exhausted: state.daily_exhausted(&self.limits),
            limits: self.limits,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: base_delay.max(Duration::from_millis(1)),
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(500), Duration::from_secs(8))
    }
}

pub struct CallGateway {
    generator: Arc<dyn Generator>,
    budget: Arc<RateBudget>,
    retry: RetryPolicy,
    in_flight: Semaphore,
    max_output_tokens: usize,
}

impl CallGateway {
    pub fn new(
        generator: Arc<dyn Generator>,
        budget: Arc<RateBudget>,
        retry: RetryPolicy,
        max_concurrent: usize,
        max_output_tokens: usize,
    ) -> Self {
        Self {
            generator,
            budget,
            retry,
            in_flight: Semaphore::new(max_concurrent.max(1)),
            max_output_tokens,
        }
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    /// Sends `prompt` once the budget admits it, retrying transient failures
    /// with exponential backoff. Each attempt is charged prompt plus output tokens.
    pub async fn dispatch(&self, prompt: &str, estimated_tokens: usize) -> Result<String, GatewayError> {
        let charge = u32::try_from(estimated_tokens.saturating_add(self.max_output_tokens))
            .unwrap_or(u32::MAX);

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            self.budget.acquire(charge).await?;

            let result = {
                let _permit = self
                    .in_flight
                    .acquire()
                    .await
                    .map_err(|err| GatewayError::Transient(err.to_string()))?;
                self.generator.generate(prompt, self.max_output_tokens).await
            };

            let err = match result {
                Ok(text) => return Ok(text),
                Err(GenerationError::QuotaExceeded) => {
                    tracing::error!("generation service reported quota exhausted");
                    self.budget.mark_daily_exhausted().await;
                    return Err(GatewayError::RateLimitedDaily);
                }
                Err(GenerationError::InvalidRequest(message)) => {
                    return Err(GatewayError::InvalidRequest(message));
                }
                Err(err) => err,
            };

            if attempt >= self.retry.max_attempts {
                tracing::warn!(attempt, error = %err, "generation retries exhausted");
                return Err(GatewayError::Transient(err.to_string()));
            }

            let mut delay = self.retry.delay_for_attempt(attempt);
            if let GenerationError::RateLimited {
                retry_after: Some(after),
            } = &err
            {
                delay = delay.max(*after);
            }
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "generation failed; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    fn gateway(generator: Arc<ScriptedGenerator>, limits: RateLimits) -> CallGateway {
        CallGateway::new(
            generator,
            Arc::new(RateBudget::new(limits)),
            RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
            2,
            10,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn minute_request_cap_blocks_until_window_rolls() {
        let budget = RateBudget::new(RateLimits::new(2, 10_000, 100));
        let started = Instant::now();

        budget.acquire(10).await.unwrap();
        budget.acquire(10).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        budget.acquire(10).await.unwrap();
        assert!(started.elapsed() >= MINUTE);

        let snapshot = budget.snapshot().await;
        assert_eq!(snapshot.requests_this_minute, 1);
        assert_eq!(snapshot.requests_today, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn token_volume_cap_blocks_until_window_rolls() {
        let budget = RateBudget::new(RateLimits::new(100, 100, 100));
        let started = Instant::now();

        budget.acquire(60).await.unwrap();
        budget.acquire(60).await.unwrap();

        assert!(started.elapsed() >= MINUTE);
        assert_eq!(budget.snapshot().await.tokens_this_minute, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn request_larger_than_token_cap_is_rejected() {
        let budget = RateBudget::new(RateLimits::new(10, 100, 100));
        let err = budget.acquire(101).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(budget.snapshot().await.requests_today, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_cap_fails_fast_without_calling_service() {
        let generator = Arc::new(ScriptedGenerator::always("text"));
        let gateway = gateway(generator.clone(), RateLimits::new(100, 100_000, 2));

        gateway.dispatch("one", 5).await.unwrap();
        gateway.dispatch("two", 5).await.unwrap();
        let started = Instant::now();
        let err = gateway.dispatch("three", 5).await.unwrap_err();

        assert_eq!(err, GatewayError::RateLimitedDaily);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(generator.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_dispatch_never_exceeds_caps() {
        let limits = RateLimits::new(3, 200, 50);
        let budget = Arc::new(RateBudget::new(limits));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let budget = budget.clone();
            handles.push(tokio::spawn(async move {
                budget.acquire(40).await.unwrap();
                budget.snapshot().await
            }));
        }

        for handle in handles {
            let snapshot = handle.await.unwrap();
            assert!(snapshot.requests_this_minute <= limits.requests_per_minute);
            assert!(snapshot.tokens_this_minute <= limits.tokens_per_minute);
            assert!(snapshot.requests_today <= limits.requests_per_day);
        }
        assert_eq!(budget.snapshot().await.requests_today, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let generator = Arc::new(ScriptedGenerator::sequence(vec![
            Err(GenerationError::Transient("503".to_string())),
            Err(GenerationError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            }),
            Ok("recovered".to_string()),
        ]));
        let gateway = gateway(generator.clone(), RateLimits::new(100, 100_000, 100));
        let started = Instant::now();

        let text = gateway.dispatch("prompt", 5).await.unwrap();

        assert_eq!(text, "recovered");
        assert_eq!(generator.call_count(), 3);
        // 100ms backoff, then the 5s retry-after hint outranks the 200ms backoff.
        assert!(started.elapsed() >= Duration::from_millis(5_100));
        assert_eq!(gateway.budget().snapshot().await.requests_today, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_transient() {
        let generator = Arc::new(ScriptedGenerator::failing(GenerationError::Transient(
            "unavailable".to_string(),
        )));
        let gateway = gateway(generator.clone(), RateLimits::new(100, 100_000, 100));

        let err = gateway.dispatch("prompt", 5).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transient(_)));
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_is_not_retried() {
        let generator = Arc::new(ScriptedGenerator::failing(GenerationError::InvalidRequest(
            "bad model".to_string(),
        )));
        let gateway = gateway(generator.clone(), RateLimits::new(100, 100_000, 100));

        let err = gateway.dispatch("prompt", 5).await.unwrap_err();
        assert_eq!(err, GatewayError::InvalidRequest("bad model".to_string()));
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn service_quota_marks_budget_exhausted() {
        let generator = Arc::new(ScriptedGenerator::failing(GenerationError::QuotaExceeded));
        let gateway = gateway(generator.clone(), RateLimits::new(100, 100_000, 100));

        assert_eq!(
            gateway.dispatch("prompt", 5).await.unwrap_err(),
            GatewayError::RateLimitedDaily
        );
        assert_eq!(
            gateway.budget().ensure_daily_capacity().await.unwrap_err(),
            GatewayError::RateLimitedDaily
        );
        assert_eq!(generator.call_count(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(1));
    }
}
