//! Core rate limiter implementation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::RateLimiterConfig;
use crate::error::{RateLimitError, Result};

use super::backend::{build_backend, StorageBackend};
use super::clock::{Clock, SystemClock};
use super::counter::WindowCounter;
use super::key::{ClientRequest, KeyGenerator};
use super::record::{RateLimitDecision, RateLimitRecord};

/// Result of counting a request against the store.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The store counted the request
    Counted(RateLimitDecision),
    /// The store failed; the request is let through
    FailedOpen {
        decision: RateLimitDecision,
        error: RateLimitError,
    },
}

impl CheckOutcome {
    pub fn decision(&self) -> &RateLimitDecision {
        match self {
            CheckOutcome::Counted(decision) | CheckOutcome::FailedOpen { decision, .. } => decision,
        }
    }

    pub fn into_decision(self) -> RateLimitDecision {
        match self {
            CheckOutcome::Counted(decision) | CheckOutcome::FailedOpen { decision, .. } => decision,
        }
    }

    /// Whether the decision was made without consulting the store.
    pub fn is_degraded(&self) -> bool {
        matches!(self, CheckOutcome::FailedOpen { .. })
    }
}

/// What an adapter sends back when a request is over the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub status_code: u16,
    pub body: RejectionBody,
}

/// JSON body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: String,
}

/// The rate limiting engine.
///
/// Owns the configuration and the storage backend. The backend connects on
/// first use and reconnects on demand after [`close`](Self::close). The engine
/// holds no locks of its own, so it can be shared across any number of tasks;
/// same-key consistency comes from the backend's atomic increment.
pub struct RateLimiter {
    config: RateLimiterConfig,
    counter: WindowCounter,
    backend: Arc<dyn StorageBackend>,
    key_generator: KeyGenerator,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the backend named in `config`.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter whose backend reads time from `clock`.
    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let backend = build_backend(&config, clock.clone())?;
        Self::assemble(config, backend, clock)
    }

    /// Create a rate limiter over an already constructed backend.
    ///
    /// The backend section of `config` is still validated but not used to
    /// build anything; this is the seam for storage implementations outside
    /// this crate.
    pub fn with_backend(
        config: RateLimiterConfig,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, backend, clock)
    }

    fn assemble(
        config: RateLimiterConfig,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        debug!(
            backend = backend.name(),
            max_requests = config.max_requests,
            window_seconds = config.window_seconds,
            "Creating rate limiter"
        );

        Ok(Self {
            counter: WindowCounter::new(config.max_requests, config.window_seconds),
            config,
            backend,
            key_generator: KeyGenerator::default(),
            clock,
        })
    }

    /// Replace the key generator.
    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    /// Connect the backend now instead of on first use.
    pub async fn initialize(&self) -> Result<()> {
        self.backend.initialize().await
    }

    /// Key the request would be counted under.
    pub fn key_for(&self, request: &dyn ClientRequest) -> String {
        self.key_generator.generate(request)
    }

    /// Count a request and decide whether it may proceed.
    ///
    /// Fails only when the backend cannot be connected; store errors after
    /// that produce an allowed decision.
    pub async fn check_limit(&self, request: &dyn ClientRequest) -> Result<RateLimitDecision> {
        self.check_limit_outcome(request)
            .await
            .map(CheckOutcome::into_decision)
    }

    /// Like [`check_limit`](Self::check_limit), keeping the degraded branch visible.
    pub async fn check_limit_outcome(&self, request: &dyn ClientRequest) -> Result<CheckOutcome> {
        let key = self.key_for(request);
        self.check_key_outcome(&key).await
    }

    /// Count a request for an already derived key.
    pub async fn check_key(&self, key: &str) -> Result<RateLimitDecision> {
        self.check_key_outcome(key)
            .await
            .map(CheckOutcome::into_decision)
    }

    pub async fn check_key_outcome(&self, key: &str) -> Result<CheckOutcome> {
        self.backend.initialize().await?;

        let result = self
            .backend
            .check_and_increment(key, self.config.max_requests, self.config.window_seconds)
            .await;

        let outcome = match result {
            Ok(decision) => CheckOutcome::Counted(decision),
            Err(error) => {
                warn!(
                    key = %key,
                    backend = self.backend.name(),
                    error = %error,
                    "Rate limit check failed, allowing request"
                );
                CheckOutcome::FailedOpen {
                    decision: self.counter.fail_open(self.clock.now()),
                    error,
                }
            }
        };

        let decision = outcome.decision();
        trace!(
            key = %key,
            current = decision.current,
            remaining = decision.remaining,
            allowed = decision.allowed,
            "Rate limit checked"
        );
        if !decision.allowed {
            debug!(
                key = %key,
                current = decision.current,
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }

        Ok(outcome)
    }

    /// Forget everything counted for `key`.
    pub async fn reset_limit(&self, key: &str) -> Result<()> {
        self.backend.initialize().await?;
        self.backend.reset_limit(key).await?;
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// Current record for `key`, if any, without counting a request.
    pub async fn get_limit_info(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        self.backend.initialize().await?;
        self.backend.get_limit_info(key).await
    }

    /// Release backend resources. Safe to call when never connected.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    /// The resolved configuration.
    pub fn config(&self) -> RateLimiterConfig {
        self.config.clone()
    }

    /// Headers an adapter should attach, honouring `include_headers`.
    pub fn response_headers(&self, decision: &RateLimitDecision) -> Vec<(&'static str, String)> {
        if self.config.include_headers {
            decision.headers()
        } else {
            Vec::new()
        }
    }

    /// Response an adapter should send instead of handling the request.
    ///
    /// `None` when the request is allowed.
    pub fn rejection(&self, decision: &RateLimitDecision) -> Option<Rejection> {
        if decision.allowed {
            return None;
        }

        Some(Rejection {
            status_code: self.config.status_code,
            body: RejectionBody {
                error: self.config.error_message.clone(),
                limit: decision.limit,
                remaining: decision.remaining,
                reset_time: decision.reset_at_iso(),
            },
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}
