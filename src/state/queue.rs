//! Priority frontier of URLs waiting to be fetched

use crate::state::{CrawlGraph, CrawlUrl, NodeId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("URL already queued: {0}")]
    Duplicate(String),

    /// The ordering cannot tell two distinct URLs apart
    #[error("URL comparator error: {0} and {1} compare equal")]
    ComparatorTie(String, String),
}

/// Ordering of the frontier; `Less` means fetched sooner
pub trait UrlOrder: Send + Sync + fmt::Debug {
    fn compare(&self, a: &CrawlUrl, b: &CrawlUrl) -> Ordering;
}

/// Shallower depth first, then by URL
#[derive(Debug, Default, Clone, Copy)]
pub struct BreadthFirst;

impl UrlOrder for BreadthFirst {
    fn compare(&self, a: &CrawlUrl, b: &CrawlUrl) -> Ordering {
        a.depth()
            .cmp(&b.depth())
            .then_with(|| a.url().cmp(b.url()))
    }
}

/// By URL only, ignoring depth
#[derive(Debug, Default, Clone, Copy)]
pub struct Alphabetic;

impl UrlOrder for Alphabetic {
    fn compare(&self, a: &CrawlUrl, b: &CrawlUrl) -> Ordering {
        a.url().cmp(b.url())
    }
}

/// Frontier of queued graph nodes, ordered by a [`UrlOrder`]
///
/// Each node is ordered by a snapshot taken when it was queued, so a node
/// can still be found by binary search after its depth drops in the graph.
/// The lookup map, the snapshots and the ordered list are always updated
/// together.
#[derive(Debug)]
pub struct CrawlQueue {
    order: Box<dyn UrlOrder>,
    // Highest priority last
    sorted: Vec<NodeId>,
    keys: HashMap<NodeId, CrawlUrl>,
    by_url: HashMap<String, NodeId>,
}

impl CrawlQueue {
    pub fn new(order: Box<dyn UrlOrder>) -> Self {
        Self {
            order,
            sorted: Vec::new(),
            keys: HashMap::new(),
            by_url: HashMap::new(),
        }
    }

    pub fn breadth_first() -> Self {
        Self::new(Box::new(BreadthFirst))
    }

    /// Position of `key` in `sorted`: `Ok` if an entry compares equal
    fn search(&self, key: &CrawlUrl) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.order.compare(key, &self.keys[probe]))
    }

    /// Queues a node. Fails if its URL is already queued or the ordering
    /// ties it with another queued URL.
    pub fn add(&mut self, graph: &CrawlGraph, id: NodeId) -> Result<(), QueueError> {
        let key = graph.node(id).ordering_key();
        if self.by_url.contains_key(key.url()) {
            return Err(QueueError::Duplicate(key.url().to_string()));
        }

        match self.search(&key) {
            Ok(index) => Err(QueueError::ComparatorTie(
                key.url().to_string(),
                self.keys[&self.sorted[index]].url().to_string(),
            )),
            Err(index) => {
                self.sorted.insert(index, id);
                self.by_url.insert(key.url().to_string(), id);
                self.keys.insert(id, key);
                Ok(())
            }
        }
    }

    /// Pops the highest-priority node
    pub fn pop(&mut self, graph: &CrawlGraph) -> Option<NodeId> {
        let id = self.sorted.pop()?;
        self.keys.remove(&id);
        self.by_url.remove(graph.node(id).url());
        Some(id)
    }

    pub fn peek(&self) -> Option<NodeId> {
        self.sorted.last().copied()
    }

    pub fn get(&self, url: &str) -> Option<NodeId> {
        self.by_url.get(url).copied()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.by_url.contains_key(url)
    }

    pub fn remove(&mut self, url: &str) -> Option<NodeId> {
        let id = self.by_url.remove(url)?;
        let found = self
            .keys
            .get(&id)
            .and_then(|key| self.search(key).ok())
            .filter(|&index| self.sorted[index] == id);
        match found {
            Some(index) => {
                self.sorted.remove(index);
            }
            None => self.sorted.retain(|queued| *queued != id),
        }
        self.keys.remove(&id);
        Some(id)
    }

    /// Re-sorts a node after its depth changed
    pub fn reprioritize(&mut self, graph: &CrawlGraph, id: NodeId) -> Result<(), QueueError> {
        if self.remove(graph.node(id).url()).is_some() {
            self.add(graph, id)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}
