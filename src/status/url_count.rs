use crate::status::{StatusError, StatusResult};
use serde::Deserialize;
use std::collections::BTreeSet;

/// What a `UrlCount` retains besides its count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeepMode {
    /// Count only
    Count,
    /// Count plus a deduplicated set
    Set,
    /// Count plus an order-preserving list; the caller guarantees no duplicates
    List,
}

/// Status categories whose URLs may be retained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCategory {
    Fetched,
    Excluded,
    NotModified,
    Parsed,
    Pending,
}

#[derive(Debug, Clone)]
enum Retained {
    Nothing,
    Set(BTreeSet<String>),
    List(Vec<String>),
}

/// A monotonic counter of URLs, optionally retaining them
#[derive(Debug, Clone)]
pub struct UrlCount {
    count: usize,
    retained: Retained,
    sealed: bool,
}

impl UrlCount {
    pub fn new(mode: KeepMode) -> Self {
        let retained = match mode {
            KeepMode::Count => Retained::Nothing,
            KeepMode::Set => Retained::Set(BTreeSet::new()),
            KeepMode::List => Retained::List(Vec::new()),
        };
        Self {
            count: 0,
            retained,
            sealed: false,
        }
    }

    fn check_open(&self, operation: &'static str) -> StatusResult<()> {
        if self.sealed {
            return Err(StatusError::Sealed(operation));
        }
        Ok(())
    }

    /// Records a URL; in set mode a repeat is not counted again
    pub fn add(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("add url")?;
        match &mut self.retained {
            Retained::Nothing => self.count += 1,
            Retained::Set(set) => {
                if set.insert(url.to_string()) {
                    self.count += 1;
                }
            }
            Retained::List(list) => {
                list.push(url.to_string());
                self.count += 1;
            }
        }
        Ok(())
    }

    /// Counts a URL without retaining it
    pub fn add_count_only(&mut self) -> StatusResult<()> {
        self.check_open("add count")?;
        self.count += 1;
        Ok(())
    }

    /// Removes a URL, for counters that track a live set such as pending
    pub fn remove(&mut self, url: &str) -> StatusResult<bool> {
        self.check_open("remove url")?;
        let removed = match &mut self.retained {
            Retained::Nothing => self.count > 0,
            Retained::Set(set) => set.remove(url),
            Retained::List(list) => match list.iter().position(|u| u == url) {
                Some(index) => {
                    list.remove(index);
                    true
                }
                None => false,
            },
        };
        if removed {
            self.count -= 1;
        }
        Ok(removed)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether the URL was retained; always false in count mode
    pub fn contains(&self, url: &str) -> bool {
        match &self.retained {
            Retained::Nothing => false,
            Retained::Set(set) => set.contains(url),
            Retained::List(list) => list.iter().any(|u| u == url),
        }
    }

    /// Retained URLs, in insertion order for list mode
    pub fn urls(&self) -> Vec<&str> {
        match &self.retained {
            Retained::Nothing => Vec::new(),
            Retained::Set(set) => set.iter().map(String::as_str).collect(),
            Retained::List(list) => list.iter().map(String::as_str).collect(),
        }
    }

    /// Freezes the counter, dropping retained URLs unless `keep_urls`
    pub fn seal(&mut self, keep_urls: bool) {
        if !keep_urls {
            self.retained = Retained::Nothing;
        }
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes() {
        let mut count = UrlCount::new(KeepMode::Count);
        let mut set = UrlCount::new(KeepMode::Set);
        let mut list = UrlCount::new(KeepMode::List);
        for url in ["a", "b", "a"] {
            count.add(url).unwrap();
            set.add(url).unwrap();
            list.add(url).unwrap();
        }
        assert_eq!(count.count(), 3);
        assert!(count.urls().is_empty());
        assert_eq!(set.count(), 2);
        assert_eq!(set.urls(), vec!["a", "b"]);
        assert_eq!(list.count(), 3);
        assert_eq!(list.urls(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_remove() {
        let mut pending = UrlCount::new(KeepMode::Set);
        pending.add("a").unwrap();
        pending.add("b").unwrap();
        assert!(pending.remove("a").unwrap());
        assert!(!pending.remove("a").unwrap());
        assert_eq!(pending.count(), 1);
    }

    #[test]
    fn test_sealed_counter_rejects_mutation() {
        let mut fetched = UrlCount::new(KeepMode::List);
        fetched.add("a").unwrap();
        fetched.add("b").unwrap();
        fetched.seal(false);

        assert!(matches!(fetched.add("c"), Err(StatusError::Sealed(_))));
        assert!(fetched.remove("a").is_err());
        assert_eq!(fetched.count(), 2);
        assert!(fetched.urls().is_empty());
    }

    #[test]
    fn test_seal_can_keep_urls() {
        let mut excluded = UrlCount::new(KeepMode::Set);
        excluded.add("x").unwrap();
        excluded.seal(true);
        assert!(excluded.contains("x"));
    }
}
