use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::RetryConfig;
use crate::transport::retry_policy::backoff_delay;

const QUOTA_MAP_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct QuotaState {
    backoff_level: u32,
    resets_at: Instant,
}

/// Per-(account, model) quota cooldowns with exponential escalation.
///
/// An entry whose cooldown has ended counts as fresh; a recorded success
/// removes it.
pub struct QuotaRegistry {
    entries: RwLock<FxHashMap<(String, String), QuotaState>>,
    base: Duration,
    max: Duration,
}

impl QuotaRegistry {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            base: Duration::from_millis(config.quota_backoff_base_ms),
            max: Duration::from_millis(config.quota_backoff_max_ms),
        }
    }

    /// Record a quota failure and return the cooldown to apply: `base *
    /// 2^level` capped at the configured max, replaced by `server_delay`
    /// when that is longer.
    pub fn record_failure(
        &self,
        account_id: &str,
        model: &str,
        now: Instant,
        server_delay: Option<Duration>,
    ) -> Duration {
        let mut entries = self.entries.write();
        if entries.len() > QUOTA_MAP_PRUNE_THRESHOLD {
            entries.retain(|_, state| state.resets_at > now);
        }
        let state = entries
            .entry((account_id.to_string(), model.to_string()))
            .or_insert(QuotaState {
                backoff_level: 0,
                resets_at: now,
            });
        if state.resets_at <= now {
            state.backoff_level = 0;
        }
        let computed = backoff_delay(self.base, self.max, state.backoff_level);
        let cooldown = match server_delay {
            Some(delay) if delay > computed => delay,
            _ => computed,
        };
        state.backoff_level = state.backoff_level.saturating_add(1);
        state.resets_at = now + cooldown;
        tracing::debug!(
            account = %account_id,
            model = %model,
            level = state.backoff_level,
            cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
            "quota cooldown recorded"
        );
        cooldown
    }

    pub fn record_success(&self, account_id: &str, model: &str) {
        let key = (account_id.to_string(), model.to_string());
        if self.entries.read().contains_key(&key) {
            self.entries.write().remove(&key);
        }
    }

    /// Time left before (account, model) may be tried again.
    #[must_use]
    pub fn cooldown_remaining(&self, account_id: &str, model: &str, now: Instant) -> Option<Duration> {
        let entries = self.entries.read();
        let state = entries.get(&(account_id.to_string(), model.to_string()))?;
        let remaining = state.resets_at.saturating_duration_since(now);
        (!remaining.is_zero()).then_some(remaining)
    }

    #[must_use]
    pub fn is_cooling(&self, account_id: &str, model: &str, now: Instant) -> bool {
        self.cooldown_remaining(account_id, model, now).is_some()
    }
}
