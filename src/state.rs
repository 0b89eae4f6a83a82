mod quota;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::fc::signature_cache::SignatureCache;
use crate::routing::AccountRouter;

pub use quota::QuotaRegistry;

/// State shared by every request a relay serves.
pub struct RelayState {
    pub signatures: Arc<SignatureCache>,
    pub quota: QuotaRegistry,
    pub router: AccountRouter,
}

impl RelayState {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            signatures: Arc::new(SignatureCache::new()),
            quota: QuotaRegistry::new(&config.retry),
            router: AccountRouter::new(config.features.load_distribution),
        }
    }
}
