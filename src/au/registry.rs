//! Registry of known archival units, indexed by id and by base URL

use crate::au::{ArchivalUnit, ConfiguredAu};
use crate::rate::RateLimiterInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<String, Arc<dyn ArchivalUnit>>,
    by_base_url: HashMap<String, String>,
}

/// Thread-safe set of AUs shared by every crawl
#[derive(Debug, Default)]
pub struct AuRegistry {
    inner: Mutex<RegistryInner>,
    synthetic_rate_limits: RateLimiterInfo,
}

impl AuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose synthetic AUs get the given fetch limits
    pub fn with_synthetic_rate_limits(rate_limits: RateLimiterInfo) -> Self {
        Self {
            inner: Mutex::default(),
            synthetic_rate_limits: rate_limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, au: Arc<dyn ArchivalUnit>) {
        let mut inner = self.lock();
        for base in au.base_urls() {
            inner
                .by_base_url
                .insert(base.clone(), au.id().to_string());
        }
        inner.by_id.insert(au.id().to_string(), au);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ArchivalUnit>> {
        self.lock().by_id.get(id).cloned()
    }

    pub fn find_by_base_url(&self, base_url: &str) -> Option<Arc<dyn ArchivalUnit>> {
        let inner = self.lock();
        inner
            .by_base_url
            .get(base_url)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Returns the AU owning `base_url`, creating a never-crawl synthetic AU
    /// if none exists. The flag is true when a new AU was created.
    pub fn get_or_create_synthetic(
        &self,
        base_url: &str,
    ) -> Result<(Arc<dyn ArchivalUnit>, bool), regex::Error> {
        let mut inner = self.lock();
        if let Some(au) = inner
            .by_base_url
            .get(base_url)
            .and_then(|id| inner.by_id.get(id))
        {
            return Ok((au.clone(), false));
        }

        let au: Arc<dyn ArchivalUnit> = Arc::new(ConfiguredAu::synthetic(
            base_url,
            self.synthetic_rate_limits.clone(),
        )?);
        tracing::info!("Created synthetic AU {} for {}", au.id(), base_url);
        inner
            .by_base_url
            .insert(base_url.to_string(), au.id().to_string());
        inner.by_id.insert(au.id().to_string(), au.clone());
        Ok((au, true))
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_created_once() {
        let registry = AuRegistry::new();
        let (first, created) = registry
            .get_or_create_synthetic("http://content.example/j/")
            .unwrap();
        assert!(created);
        assert!(first.is_never_crawl());

        let (second, created) = registry
            .get_or_create_synthetic("http://content.example/j/")
            .unwrap();
        assert!(!created);
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_existing_au_owns_base_url() {
        let registry = AuRegistry::new();
        let au = ConfiguredAu::synthetic("http://pub.example/", RateLimiterInfo::default()).unwrap();
        let id = au.id().to_string();
        registry.register(Arc::new(au));

        let (found, created) = registry
            .get_or_create_synthetic("http://pub.example/")
            .unwrap();
        assert!(!created);
        assert_eq!(found.id(), id);
        assert!(registry.find_by_base_url("http://nope.example/").is_none());
        assert!(registry.get(&id).is_some());
    }
}
