use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::auth::{AccountCandidate, AccountStatus};
use crate::state::QuotaRegistry;

pub type AccountOrder = SmallVec<[AccountCandidate; 4]>;

/// Orders account candidates for one request.
///
/// The lead is the last account that succeeded for the provider, else the
/// default account, else the first active one. Quota-limited and
/// cooling-down accounts always go last, soonest-available first.
pub struct AccountRouter {
    load_distribution: bool,
    last_success: RwLock<FxHashMap<String, String>>,
    cursor: AtomicUsize,
}

impl AccountRouter {
    #[must_use]
    pub fn new(load_distribution: bool) -> Self {
        Self {
            load_distribution,
            last_success: RwLock::new(FxHashMap::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn order(
        &self,
        provider_key: &str,
        model: &str,
        candidates: Vec<AccountCandidate>,
        quota: &QuotaRegistry,
        now: Instant,
    ) -> AccountOrder {
        let mut usable: AccountOrder = SmallVec::with_capacity(candidates.len());
        let mut deferred: SmallVec<[(Duration, AccountCandidate); 4]> = SmallVec::new();
        for candidate in candidates {
            let cooling = quota.cooldown_remaining(&candidate.id, model, now);
            if candidate.status == AccountStatus::QuotaLimited || cooling.is_some() {
                deferred.push((cooling.unwrap_or_default(), candidate));
            } else {
                usable.push(candidate);
            }
        }

        let remembered = self.last_success.read().get(provider_key).cloned();
        let lead_index = remembered
            .and_then(|id| usable.iter().position(|c| c.id == id))
            .or_else(|| usable.iter().position(|c| c.is_default))
            .or_else(|| usable.iter().position(|c| c.status == AccountStatus::Active))
            .or(if usable.is_empty() { None } else { Some(0) });

        let mut ordered: AccountOrder = SmallVec::with_capacity(usable.len() + deferred.len());
        if let Some(index) = lead_index {
            ordered.push(usable.remove(index));
        }
        if self.load_distribution && usable.len() > 1 {
            let shift = self.cursor.fetch_add(1, Ordering::Relaxed) % usable.len();
            usable.rotate_left(shift);
        }
        ordered.extend(usable);

        deferred.sort_by_key(|(remaining, _)| *remaining);
        ordered.extend(deferred.into_iter().map(|(_, candidate)| candidate));
        ordered
    }

    pub fn remember_success(&self, provider_key: &str, account_id: &str) {
        let mut last = self.last_success.write();
        if last.get(provider_key).map(String::as_str) != Some(account_id) {
            last.insert(provider_key.to_string(), account_id.to_string());
        }
    }
}
