//! Name-based provider lookup.

use std::sync::Arc;

use super::AiProvider;

/// Fixed set of providers, resolved by name.
///
/// Built once at startup and shared by reference; the set never changes while
/// requests are in flight. Lookup is case-insensitive so settings values like
/// `"cloud"` and `"Cloud"` resolve identically.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn AiProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn AiProvider>>) -> Self {
        Self { providers }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn AiProvider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Registered provider names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}
