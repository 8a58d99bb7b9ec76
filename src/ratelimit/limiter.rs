//! Core rate limiter implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::{LimiterConfig, LimiterSettings};

use super::clock::{Clock, SystemClock};
use super::key::{LimitKey, RequestContext};
use super::policy::{AuthAction, LimitLayer, PolicyRegistry};
use super::store::{AttemptOutcome, CounterStore, KeyInfo};

/// Responses with a status below this threshold count as successful for the
/// clear-on-success hook.
const CLIENT_ERROR_THRESHOLD: u16 = 400;

/// The outcome of an admission check.
///
/// Always a value, never an error: the calling middleware translates it
/// into a protocol response.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is within budget and may proceed.
    Allowed {
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    /// The budget is exhausted; reject with a 429-equivalent.
    Denied {
        /// Seconds until the window resets, rounded up
        retry_after_secs: u64,
        limit: u32,
        reset_at: DateTime<Utc>,
        message: String,
        action: AuthAction,
        layer: LimitLayer,
    },
    /// No policy covers this (action, layer) pair; proceed with no metadata.
    Unregulated,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied { .. })
    }

    /// Suggested response headers for this decision.
    ///
    /// `X-RateLimit-Reset` carries the window reset as unix seconds;
    /// `Retry-After` is added on denial.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Decision::Allowed {
                limit,
                remaining,
                reset_at,
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", remaining.to_string()),
                ("X-RateLimit-Reset", reset_at.timestamp().to_string()),
            ],
            Decision::Denied {
                retry_after_secs,
                limit,
                reset_at,
                ..
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", reset_at.timestamp().to_string()),
                ("Retry-After", retry_after_secs.to_string()),
            ],
            Decision::Unregulated => Vec::new(),
        }
    }

    /// The structured payload for a 429-equivalent response, if denied.
    pub fn denial_body(&self) -> Option<DenialBody> {
        match self {
            Decision::Denied {
                retry_after_secs,
                limit,
                reset_at,
                message,
                action,
                layer,
            } => Some(DenialBody {
                message: message.clone(),
                retry_after: *retry_after_secs,
                limit: *limit,
                remaining: 0,
                action: *action,
                layer: *layer,
                reset_time: *reset_at,
            }),
            _ => None,
        }
    }
}

/// Body of a denial response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub message: String,
    /// Seconds until the window resets, rounded up
    pub retry_after: u64,
    pub limit: u32,
    pub remaining: u32,
    #[serde(rename = "type")]
    pub action: AuthAction,
    pub layer: LimitLayer,
    pub reset_time: DateTime<Utc>,
}

/// Non-expired entries grouped by action, then layer.
pub type StatsReport = BTreeMap<AuthAction, BTreeMap<LimitLayer, Vec<EntrySnapshot>>>;

/// One entry in a stats report.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    /// The identifier portion of the key (IP, email, or token)
    pub identifier: String,
    pub count: u32,
    pub reset_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Result of probing a key from the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct KeyProbe {
    /// Serialized key the probe addressed
    pub key: String,
    /// Current entry state, if one exists
    pub info: Option<KeyInfo>,
}

/// The multi-layer rate limiter.
///
/// Owns the counter store for its lifetime; construct one per process and
/// pass it to request handlers. This struct is thread-safe and can be
/// shared across tasks.
pub struct RateLimiter {
    store: CounterStore,
    registry: PolicyRegistry,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    /// Gate for the amortized sweep
    last_sweep: Mutex<DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a limiter with the given registry and settings.
    pub fn new(registry: PolicyRegistry, settings: LimiterSettings) -> Self {
        Self::with_clock(registry, settings, Arc::new(SystemClock::new()))
    }

    /// Create a limiter with an explicit clock.
    pub fn with_clock(
        registry: PolicyRegistry,
        settings: LimiterSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            store: CounterStore::new(),
            registry,
            settings,
            clock,
            last_sweep: Mutex::new(now),
        }
    }

    /// Create a limiter from a loaded configuration.
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(config.registry(), config.general.clone())
    }

    /// Check the rate limit for a request.
    ///
    /// Fixed-window counting: the window reset is pinned when the entry is
    /// created and the counter resets entirely once it elapses. The
    /// check-then-increment is atomic per key, so concurrent requests on
    /// one key cannot both take the final slot.
    pub async fn check(
        &self,
        action: AuthAction,
        layer: LimitLayer,
        ctx: &RequestContext,
    ) -> Decision {
        let Some(policy) = self.registry.policy_for(action, layer) else {
            return Decision::Unregulated;
        };

        if self.settings.is_bypassed(&ctx.ip) {
            trace!(ip = %ctx.ip, "Client on bypass list, skipping rate limit");
            return Decision::Unregulated;
        }

        let now = self.clock.now();
        self.maybe_sweep(now);

        let key = LimitKey::derive(action, layer, ctx);

        trace!(key = %key, "Checking rate limit");

        match self
            .store
            .attempt(&key, policy.max_attempts, policy.window, now)
        {
            AttemptOutcome::Admitted { count, reset_at } => {
                if count == 1 {
                    debug!(
                        key = %key,
                        limit = policy.max_attempts,
                        window_secs = policy.window.num_seconds(),
                        "Created rate limit entry"
                    );
                }
                Decision::Allowed {
                    limit: policy.max_attempts,
                    remaining: policy.max_attempts.saturating_sub(count),
                    reset_at,
                }
            }
            AttemptOutcome::Refused { reset_at } => {
                warn!(
                    key = %key,
                    limit = policy.max_attempts,
                    "Rate limit exceeded"
                );
                Decision::Denied {
                    retry_after_secs: seconds_until(reset_at, now),
                    limit: policy.max_attempts,
                    reset_at,
                    message: policy.message.clone(),
                    action,
                    layer,
                }
            }
        }
    }

    /// Post-request hook: for policies with `clear_on_success`, a response
    /// below the client-error threshold deletes the counter so a
    /// successful authentication forgives prior failed attempts.
    pub fn record_response(
        &self,
        action: AuthAction,
        layer: LimitLayer,
        ctx: &RequestContext,
        status: u16,
    ) {
        if status >= CLIENT_ERROR_THRESHOLD {
            return;
        }
        let Some(policy) = self.registry.policy_for(action, layer) else {
            return;
        };
        if !policy.clear_on_success {
            return;
        }

        let key = LimitKey::derive(action, layer, ctx);
        if self.store.remove(&key) {
            debug!(key = %key, "Cleared rate limit entry after successful response");
        }
    }

    /// Run both maintenance passes now, regardless of the amortized gate.
    /// Idempotent and safe to call from any path.
    pub fn sweep(&self) {
        let now = self.clock.now();
        *self.last_sweep.lock() = now;
        self.sweep_at(now);
    }

    /// Amortized sweep: runs at most once per cleanup interval, piggybacked
    /// on request traffic. Correctness does not depend on it; expired
    /// entries are also replaced lazily on access.
    fn maybe_sweep(&self, now: DateTime<Utc>) {
        {
            let mut last = self.last_sweep.lock();
            if now - *last < self.settings.cleanup_interval() {
                return;
            }
            *last = now;
        }
        self.sweep_at(now);
    }

    fn sweep_at(&self, now: DateTime<Utc>) {
        let expired = self.store.evict_expired(now);
        let trimmed = self.store.trim_to(self.settings.max_store_size);
        if expired > 0 || trimmed > 0 {
            debug!(expired, trimmed, "Swept rate limit store");
        }
    }

    /// Non-expired entries grouped by action, then layer.
    pub fn stats(&self) -> StatsReport {
        let now = self.clock.now();
        let mut report = StatsReport::new();

        for (key, entry) in self.store.snapshot() {
            if entry.is_expired(now) {
                continue;
            }
            report
                .entry(key.action)
                .or_default()
                .entry(key.layer)
                .or_default()
                .push(EntrySnapshot {
                    identifier: key.identifier,
                    count: entry.count,
                    reset_at: entry.window_reset_at,
                    last_attempt_at: entry.last_attempt_at,
                });
        }

        report
    }

    /// Empty the store unconditionally.
    pub fn clear_all(&self) {
        self.store.clear();
        info!("Cleared all rate limit entries");
    }

    /// Remove every entry whose serialized key contains `needle`.
    ///
    /// This is a substring match, not an exact key match: an identifier
    /// that is a substring of another will over-match.
    pub fn clear_matching(&self, needle: &str) -> usize {
        let removed = self.store.remove_matching(needle);
        info!(needle = %needle, removed, "Cleared rate limit entries by identifier");
        removed
    }

    /// Remove every entry whose key contains the given IP.
    pub fn clear_for_ip(&self, ip: &str) -> usize {
        self.clear_matching(ip)
    }

    /// Remove every entry whose key contains the given email, case-folded.
    pub fn clear_for_email(&self, email: &str) -> usize {
        self.clear_matching(&email.to_lowercase())
    }

    /// Point lookup by serialized key, for diagnostics.
    ///
    /// Returns `None` for unknown or unparseable keys.
    pub fn key_info(&self, serialized: &str) -> Option<KeyInfo> {
        let key: LimitKey = serialized.parse().ok()?;
        self.key_info_for(&key)
    }

    /// Probe the counter for an (action, layer, identifier) triple without
    /// recording an attempt.
    pub fn probe(&self, action: AuthAction, layer: LimitLayer, identifier: &str) -> KeyProbe {
        let key = LimitKey::new(action, layer, identifier);
        KeyProbe {
            key: key.to_string(),
            info: self.key_info_for(&key),
        }
    }

    fn key_info_for(&self, key: &LimitKey) -> Option<KeyInfo> {
        let entry = self.store.get(key)?;
        Some(KeyInfo {
            count: entry.count,
            reset_at: entry.window_reset_at,
            last_attempt_at: entry.last_attempt_at,
            is_expired: entry.is_expired(self.clock.now()),
        })
    }

    /// Number of entries currently in the store, expired or not.
    pub fn entry_count(&self) -> usize {
        self.store.len()
    }
}

/// Seconds from `now` until `reset_at`, rounded up.
fn seconds_until(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0);
    ((millis + 999) / 1000) as u64
}
