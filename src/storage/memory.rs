//! In-memory repository, for tests and dry runs

use crate::storage::traits::{Repository, StorageResult, StoredContent};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryRepository {
    contents: Mutex<BTreeMap<(String, String), StoredContent>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), StoredContent>> {
        self.contents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored URLs across all AUs
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Repository for MemoryRepository {
    fn store(&self, au_id: &str, content: &StoredContent) -> StorageResult<()> {
        self.lock()
            .insert((au_id.to_string(), content.url.clone()), content.clone());
        Ok(())
    }

    fn has_content(&self, au_id: &str, url: &str) -> StorageResult<bool> {
        Ok(self
            .lock()
            .contains_key(&(au_id.to_string(), url.to_string())))
    }

    fn get(&self, au_id: &str, url: &str) -> StorageResult<Option<StoredContent>> {
        Ok(self
            .lock()
            .get(&(au_id.to_string(), url.to_string()))
            .cloned())
    }

    fn urls(&self, au_id: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .lock()
            .keys()
            .filter(|(au, _)| au == au_id)
            .map(|(_, url)| url.clone())
            .collect())
    }

    fn au_size(&self, au_id: &str) -> StorageResult<u64> {
        Ok(self
            .lock()
            .iter()
            .filter(|((au, _), _)| au == au_id)
            .map(|(_, content)| content.body.len() as u64)
            .sum())
    }
}
