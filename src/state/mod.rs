//! Traversal state of a single crawl
//!
//! # Components
//!
//! - `CrawlGraph`: arena of discovered URLs with minimum-depth relaxation
//! - `CrawlQueue`: priority frontier over graph nodes, ordered by a `UrlOrder`

mod crawl_url;
mod queue;

pub use crawl_url::{CrawlGraph, CrawlUrl, NodeId, NoopObserver, ReducedDepthObserver};
pub use queue::{Alphabetic, BreadthFirst, CrawlQueue, QueueError, UrlOrder};
