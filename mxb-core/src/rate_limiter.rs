//! # Rate Limiter
//!
//! Per-operation-class admission control for outbound homeserver calls.
//!
//! ## Features
//!
//! - Token bucket algorithm for smooth rate limiting with bursts
//! - Fixed-interval algorithm for operations that must be spaced out
//! - One independent limiter per operation class
//! - Blocking admission that sleeps exactly as long as needed and honours a
//!   deadline and a cancellation token
//!
//! ## Usage
//!
//! ```rust
//! use mxb_core::config::RateLimitConfig;
//! use mxb_core::rate_limiter::{OperationClass, RateLimiters};
//!
//! let limiters = RateLimiters::new(&RateLimitConfig::default());
//!
//! if limiters.get(OperationClass::Message).admit() {
//!     println!("send now");
//! }
//! ```
//!
//! All timing uses the `tokio::time` clock so tests can pause it.

use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{LimitConfig, RateLimitConfig};
use crate::error::BridgeError;

/// Outbound operation class; each has its own limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Message,
    RoomCreation,
    Invite,
    Registration,
    Join,
}

impl OperationClass {
    pub const ALL: [OperationClass; 5] = [
        OperationClass::Message,
        OperationClass::RoomCreation,
        OperationClass::Invite,
        OperationClass::Registration,
        OperationClass::Join,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Message => "message",
            OperationClass::RoomCreation => "room_creation",
            OperationClass::Invite => "invite",
            OperationClass::Registration => "registration",
            OperationClass::Join => "join",
        }
    }

    fn config<'a>(&self, config: &'a RateLimitConfig) -> &'a LimitConfig {
        match self {
            OperationClass::Message => &config.message,
            OperationClass::RoomCreation => &config.room_creation,
            OperationClass::Invite => &config.invite,
            OperationClass::Registration => &config.registration,
            OperationClass::Join => &config.join,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a blocking admission gave up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("rate limit wait for {class} would exceed the deadline (needed {needed:?})")]
    DeadlineExceeded {
        class: OperationClass,
        needed: Duration,
    },

    #[error("rate limit wait for {class} was cancelled")]
    Cancelled { class: OperationClass },
}

impl From<WaitError> for BridgeError {
    fn from(e: WaitError) -> Self {
        BridgeError::Cancelled(e.to_string())
    }
}

/// Which algorithm a limiter runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    Disabled,
    TokenBucket,
    Interval,
}

/// Token bucket state
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// tokens per second
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        // a bucket that can never hold one token would never admit
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate).min(self.capacity)
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        self.last_refill = now;
    }

    fn delay_for(&self, tokens: f64) -> Duration {
        let missing = (1.0 - tokens).max(0.0);
        Duration::from_nanos((missing / self.rate * 1e9).ceil() as u64)
    }

    fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.delay_for(self.tokens))
        }
    }
}

/// Fixed-interval state
#[derive(Debug)]
struct IntervalGate {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl IntervalGate {
    fn remaining_at(&self, now: Instant) -> Duration {
        match self.last_admitted {
            None => Duration::ZERO,
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
        }
    }

    fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        let remaining = self.remaining_at(now);
        if remaining.is_zero() {
            self.last_admitted = Some(now);
            Ok(())
        } else {
            Err(remaining)
        }
    }
}

#[derive(Debug)]
enum Algorithm {
    Disabled,
    TokenBucket(TokenBucket),
    Interval(IntervalGate),
}

/// Admission control for one operation class
#[derive(Debug)]
pub struct Limiter {
    class: OperationClass,
    state: RwLock<Algorithm>,
}

impl Limiter {
    pub fn new(class: OperationClass, config: &LimitConfig) -> Self {
        let algorithm = if config.interval_ms > 0 {
            Algorithm::Interval(IntervalGate {
                interval: Duration::from_millis(config.interval_ms),
                last_admitted: None,
            })
        } else if config.rate_per_second() > 0.0 {
            Algorithm::TokenBucket(TokenBucket::new(config.rate_per_second(), config.burst))
        } else {
            Algorithm::Disabled
        };

        Self {
            class,
            state: RwLock::new(algorithm),
        }
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn kind(&self) -> LimiterKind {
        match &*self.state.read() {
            Algorithm::Disabled => LimiterKind::Disabled,
            Algorithm::TokenBucket(_) => LimiterKind::TokenBucket,
            Algorithm::Interval(_) => LimiterKind::Interval,
        }
    }

    /// Non-blocking check-and-consume
    pub fn admit(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Consume one unit, or report how long until one is available
    fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.write();
        match &mut *state {
            Algorithm::Disabled => Ok(()),
            Algorithm::TokenBucket(bucket) => bucket.try_consume(now),
            Algorithm::Interval(gate) => gate.try_consume(now),
        }
    }

    /// Delay until the next admission would succeed, without consuming
    pub fn time_until_available(&self) -> Duration {
        let now = Instant::now();
        match &*self.state.read() {
            Algorithm::Disabled => Duration::ZERO,
            Algorithm::TokenBucket(bucket) => bucket.delay_for(bucket.tokens_at(now)),
            Algorithm::Interval(gate) => gate.remaining_at(now),
        }
    }

    /// Current token count for bucket limiters
    pub fn available_tokens(&self) -> Option<f64> {
        match &*self.state.read() {
            Algorithm::TokenBucket(bucket) => Some(bucket.tokens_at(Instant::now())),
            _ => None,
        }
    }

    /// Block until admitted or `deadline` cannot be met
    pub async fn wait(&self, deadline: Instant) -> Result<(), WaitError> {
        self.wait_with_cancel(deadline, &CancellationToken::new()).await
    }

    /// Block until admitted, `deadline` cannot be met, or `cancel` fires.
    ///
    /// Sleeps for the exact computed delay and then retries; another caller
    /// may win the unit in between, in which case the delay is recomputed.
    pub async fn wait_with_cancel(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled { class: self.class });
            }

            let delay = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };

            if Instant::now() + delay > deadline {
                debug!(
                    "Rate limit wait for {} abandoned: needs {:?}, deadline too close",
                    self.class, delay
                );
                return Err(WaitError::DeadlineExceeded {
                    class: self.class,
                    needed: delay,
                });
            }

            trace!("Rate limited on {}, sleeping {:?}", self.class, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled { class: self.class });
                }
            }
        }
    }
}

/// One limiter per operation class
#[derive(Debug)]
pub struct RateLimiters {
    message: Limiter,
    room_creation: Limiter,
    invite: Limiter,
    registration: Limiter,
    join: Limiter,
}

impl RateLimiters {
    pub fn new(config: &RateLimitConfig) -> Self {
        let build = |class: OperationClass| Limiter::new(class, class.config(config));
        Self {
            message: build(OperationClass::Message),
            room_creation: build(OperationClass::RoomCreation),
            invite: build(OperationClass::Invite),
            registration: build(OperationClass::Registration),
            join: build(OperationClass::Join),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&RateLimitConfig::unlimited())
    }

    pub fn get(&self, class: OperationClass) -> &Limiter {
        match class {
            OperationClass::Message => &self.message,
            OperationClass::RoomCreation => &self.room_creation,
            OperationClass::Invite => &self.invite,
            OperationClass::Registration => &self.registration,
            OperationClass::Join => &self.join,
        }
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    fn bucket(rate: f64, burst: u32) -> Limiter {
        Limiter::new(
            OperationClass::Message,
            &LimitConfig::token_bucket(rate, 1.0, burst),
        )
    }

    fn interval(ms: u64) -> Limiter {
        Limiter::new(
            OperationClass::RoomCreation,
            &LimitConfig::interval(Duration::from_millis(ms)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_basic() {
        let limiter = bucket(2.0, 3);
        assert_eq!(limiter.kind(), LimiterKind::TokenBucket);

        assert!(limiter.admit());
        assert!(limiter.admit());
        assert!(limiter.admit());
        assert!(!limiter.admit());
        assert_eq!(limiter.time_until_available(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refill_capped() {
        let limiter = bucket(2.0, 3);
        while limiter.admit() {}

        advance(Duration::from_millis(500)).await;
        assert!(limiter.admit());
        assert!(!limiter.admit());

        // long idle never accumulates past capacity
        advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available_tokens(), Some(3.0));
        let admitted = (0..10).filter(|_| limiter.admit()).count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_window_bound() {
        let rate = 4.0;
        let burst = 5;
        let limiter = bucket(rate, burst);
        let start = Instant::now();
        let mut admitted_at = Vec::new();

        for _ in 0..1000 {
            if limiter.admit() {
                admitted_at.push(Instant::now() - start);
            }
            advance(Duration::from_millis(7)).await;
        }

        let window = Duration::from_millis(1500);
        let bound = burst as usize + (rate * window.as_secs_f64()).ceil() as usize;
        for (i, t) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|other| **other - *t <= window)
                .count();
            assert!(in_window <= bound, "{} admissions in window > {}", in_window, bound);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_spacing() {
        let limiter = interval(200);
        assert_eq!(limiter.kind(), LimiterKind::Interval);

        let mut last: Option<Instant> = None;
        for _ in 0..200 {
            if limiter.admit() {
                let now = Instant::now();
                if let Some(prev) = last {
                    assert!(now - prev >= Duration::from_millis(200));
                }
                last = Some(now);
            }
            advance(Duration::from_millis(30)).await;
        }
        assert!(last.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_first_call_admitted() {
        let limiter = interval(1000);
        assert!(limiter.admit());
        assert!(!limiter.admit());
        advance(Duration::from_millis(999)).await;
        assert!(!limiter.admit());
        advance(Duration::from_millis(1)).await;
        assert!(limiter.admit());
    }

    #[test]
    fn test_disabled_always_admits() {
        let limiter = Limiter::new(OperationClass::Join, &LimitConfig::disabled());
        assert_eq!(limiter.kind(), LimiterKind::Disabled);
        for _ in 0..1000 {
            assert!(limiter.admit());
        }
        assert_eq!(limiter.time_until_available(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_exact_delay() {
        let limiter = bucket(2.0, 3);
        let start = Instant::now();
        let deadline = start + Duration::from_secs(5);

        for _ in 0..3 {
            limiter.wait(deadline).await.unwrap();
        }
        assert_eq!(Instant::now() - start, Duration::ZERO);

        limiter.wait(deadline).await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline_exceeded() {
        let limiter = bucket(0.1, 1);
        assert!(limiter.admit());

        let start = Instant::now();
        let err = limiter
            .wait(start + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::DeadlineExceeded { .. }));
        // gave up without sleeping until the deadline
        assert!(Instant::now() - start < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let limiter = Arc::new(interval(10_000));
        assert!(limiter.admit());

        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                limiter
                    .wait_with_cancel(Instant::now() + Duration::from_secs(60), &cancel)
                    .await
            })
        };

        advance(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert_eq!(
            result,
            Err(WaitError::Cancelled {
                class: OperationClass::RoomCreation
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_classes_are_independent() {
        let config = RateLimitConfig {
            message: LimitConfig::token_bucket(1.0, 1.0, 2),
            invite: LimitConfig::token_bucket(1.0, 1.0, 1),
            ..RateLimitConfig::unlimited()
        };
        let limiters = RateLimiters::new(&config);

        assert!(limiters.get(OperationClass::Message).admit());
        assert!(limiters.get(OperationClass::Message).admit());
        assert!(!limiters.get(OperationClass::Message).admit());

        assert!(limiters.get(OperationClass::Invite).admit());
        assert!(!limiters.get(OperationClass::Invite).admit());

        assert!(limiters.get(OperationClass::Join).admit());
        assert_eq!(limiters.get(OperationClass::Join).class(), OperationClass::Join);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_never_overshoots() {
        let limiter = Arc::new(bucket(0.001, 5));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.admit() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_wait_error_converts_to_cancelled() {
        let err: BridgeError = WaitError::Cancelled {
            class: OperationClass::Join,
        }
        .into();
        assert!(matches!(err, BridgeError::Cancelled(_)));
    }
}
