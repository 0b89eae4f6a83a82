use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Placeholder sent when no real continuation signature is known. The
/// backend accepts it in place of a real signature.
pub const PLACEHOLDER_SIGNATURE: &str = "skip_thought_signature_validator";

const SIGNATURE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const SIGNATURE_CACHE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignatureKey {
    session_id: Option<String>,
    call_id: String,
}

impl SignatureKey {
    fn new(call_id: &str, session_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            call_id: call_id.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    signature: String,
    stored_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > SIGNATURE_TTL
    }
}

#[must_use]
pub fn is_placeholder(signature: &str) -> bool {
    signature == PLACEHOLDER_SIGNATURE
}

/// Continuation signatures keyed by tool call id, optionally scoped to a
/// session. Shared across requests; every operation touches one key.
pub struct SignatureCache {
    entries: RwLock<FxHashMap<SignatureKey, CacheEntry>>,
}

impl SignatureCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Store a signature. A real signature is never replaced by the
    /// placeholder; a placeholder is overwritten once a real one arrives.
    /// Returns whether the entry changed.
    pub fn store(&self, call_id: &str, session_id: Option<&str>, signature: &str) -> bool {
        self.store_at(call_id, session_id, signature, Instant::now())
    }

    pub(crate) fn store_at(
        &self,
        call_id: &str,
        session_id: Option<&str>,
        signature: &str,
        now: Instant,
    ) -> bool {
        if call_id.is_empty() || signature.is_empty() {
            return false;
        }
        let key = SignatureKey::new(call_id, session_id);
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if !existing.is_expired(now) {
                if existing.signature == signature {
                    return false;
                }
                if is_placeholder(signature) && !is_placeholder(&existing.signature) {
                    return false;
                }
            }
        }
        tracing::debug!(
            call_id = %call_id,
            placeholder = is_placeholder(signature),
            "caching continuation signature"
        );
        entries.insert(
            key,
            CacheEntry {
                signature: signature.to_string(),
                stored_at: now,
            },
        );
        if entries.len() > SIGNATURE_CACHE_LIMIT {
            enforce_limit(&mut entries, now);
        }
        true
    }

    /// Look up a signature, preferring the session-scoped entry and falling
    /// back to the unscoped one.
    #[must_use]
    pub fn lookup(&self, call_id: &str, session_id: Option<&str>) -> Option<String> {
        self.lookup_at(call_id, session_id, Instant::now())
    }

    pub(crate) fn lookup_at(
        &self,
        call_id: &str,
        session_id: Option<&str>,
        now: Instant,
    ) -> Option<String> {
        let entries = self.entries.read();
        let scoped = session_id.and_then(|session| {
            entries
                .get(&SignatureKey::new(call_id, Some(session)))
                .filter(|entry| !entry.is_expired(now))
        });
        scoped
            .or_else(|| {
                entries
                    .get(&SignatureKey::new(call_id, None))
                    .filter(|entry| !entry.is_expired(now))
            })
            .map(|entry| entry.signature.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}

fn enforce_limit(entries: &mut FxHashMap<SignatureKey, CacheEntry>, now: Instant) {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    if entries.len() > SIGNATURE_CACHE_LIMIT {
        let mut oldest_first: Vec<(SignatureKey, Instant)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.stored_at))
            .collect();
        oldest_first.sort_by_key(|(_, stored_at)| *stored_at);
        let to_remove = entries.len() - SIGNATURE_CACHE_LIMIT;
        for (key, _) in oldest_first.into_iter().take(to_remove) {
            entries.remove(&key);
        }
    }
    tracing::debug!(
        before,
        after = entries.len(),
        limit = SIGNATURE_CACHE_LIMIT,
        "signature cache cleanup"
    );
}
