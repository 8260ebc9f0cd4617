//! Process-wide interception configuration

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::info;

use crate::filter::FilterConfig;

static GLOBAL: OnceLock<Arc<InterceptorRegistry>> = OnceLock::new();

/// Holds the filter consulted on every interception decision.
///
/// Writes replace the whole [`FilterConfig`] snapshot; readers get an
/// `Arc` and never observe a half-applied update.
#[derive(Debug, Default)]
pub struct InterceptorRegistry {
    filter: RwLock<Arc<FilterConfig>>,
}

impl InterceptorRegistry {
    /// Create a registry with empty lists
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from an existing filter
    #[must_use]
    pub fn with_filter(filter: FilterConfig) -> Self {
        Self {
            filter: RwLock::new(Arc::new(filter)),
        }
    }

    /// The process-wide registry, created empty on first use
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Current filter snapshot
    pub fn filter(&self) -> Arc<FilterConfig> {
        Arc::clone(&self.filter.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the blacklist
    pub fn set_blacklist<I>(&self, hosts: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let hosts: Vec<String> = hosts.into_iter().map(Into::into).collect();
        info!("Blacklist set to {} host suffixes", hosts.len());
        self.update(|filter| filter.blacklist = hosts);
    }

    /// Replace the whitelist
    pub fn set_whitelist<I>(&self, hosts: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let hosts: Vec<String> = hosts.into_iter().map(Into::into).collect();
        info!("Whitelist set to {} host suffixes", hosts.len());
        self.update(|filter| filter.whitelist = hosts);
    }

    /// Replace both lists at once
    pub fn replace(&self, filter: FilterConfig) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(filter);
    }

    fn update(&self, apply: impl FnOnce(&mut FilterConfig)) {
        let mut guard = self.filter.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = FilterConfig::clone(&guard);
        apply(&mut next);
        *guard = Arc::new(next);
    }
}
