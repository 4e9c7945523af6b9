//! Arena of discovered URLs and their child links
//!
//! Nodes are addressed by [`NodeId`]; child lists hold ids, so cycles in the
//! link graph never become ownership cycles. A node's depth is the minimum
//! over every path seen so far and only ever decreases.

use std::collections::HashMap;

/// Handle to a node of a [`CrawlGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// A discovered URL and the shallowest depth it was reached at
#[derive(Debug, Clone)]
pub struct CrawlUrl {
    url: String,
    depth: u32,
    children: Vec<NodeId>,
    pub fetched: bool,
    pub failed_fetch: bool,
    pub failed_parse: bool,
    pub start_url: bool,
}

impl CrawlUrl {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// A childless copy, enough for ordering comparisons
    pub(crate) fn ordering_key(&self) -> CrawlUrl {
        CrawlUrl {
            url: self.url.clone(),
            depth: self.depth,
            children: Vec::new(),
            fetched: self.fetched,
            failed_fetch: self.failed_fetch,
            failed_parse: self.failed_parse,
            start_url: self.start_url,
        }
    }
}

/// Notified for every node whose depth is lowered
pub trait ReducedDepthObserver {
    fn depth_reduced(&mut self, id: NodeId, node: &CrawlUrl, old_depth: u32, new_depth: u32);
}

impl<F> ReducedDepthObserver for F
where
    F: FnMut(NodeId, &CrawlUrl, u32, u32),
{
    fn depth_reduced(&mut self, id: NodeId, node: &CrawlUrl, old_depth: u32, new_depth: u32) {
        self(id, node, old_depth, new_depth)
    }
}

/// Observer that ignores depth changes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ReducedDepthObserver for NoopObserver {
    fn depth_reduced(&mut self, _: NodeId, _: &CrawlUrl, _: u32, _: u32) {}
}

#[derive(Debug, Default)]
pub struct CrawlGraph {
    nodes: Vec<CrawlUrl>,
    index: HashMap<String, NodeId>,
}

impl CrawlGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for `url`, creating it at `depth` if new. The flag
    /// is true when the node was created. An existing node keeps its depth.
    pub fn get_or_insert(&mut self, url: &str, depth: u32) -> (NodeId, bool) {
        if let Some(&id) = self.index.get(url) {
            return (id, false);
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(CrawlUrl {
            url: url.to_string(),
            depth,
            children: Vec::new(),
            fetched: false,
            failed_fetch: false,
            failed_parse: false,
            start_url: false,
        });
        self.index.insert(url.to_string(), id);
        (id, true)
    }

    pub fn find(&self, url: &str) -> Option<NodeId> {
        self.index.get(url).copied()
    }

    pub fn node(&self, id: NodeId) -> &CrawlUrl {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CrawlUrl {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Links `child` under `parent` and relaxes the child's depth to
    /// `parent.depth + 1`. Returns false for a self-link or a link the
    /// parent already has.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        observer: &mut dyn ReducedDepthObserver,
    ) -> bool {
        if parent == child || self.nodes[parent.0].children.contains(&child) {
            return false;
        }
        self.nodes[parent.0].children.push(child);
        let depth = self.nodes[parent.0].depth.saturating_add(1);
        self.encountered_at_depth(child, depth, observer);
        true
    }

    pub fn clear_children(&mut self, id: NodeId) {
        self.nodes[id.0].children.clear();
    }

    /// Shrinks the child list once a page is fully parsed
    pub fn trim_children(&mut self, id: NodeId) {
        self.nodes[id.0].children.shrink_to_fit();
    }

    /// Records that `id` was reached at `depth`. If that is shallower than
    /// its recorded depth, the reduction propagates to every descendant
    /// whose depth it lowers, and `observer` fires once per lowered node,
    /// children before their parent.
    pub fn encountered_at_depth(
        &mut self,
        id: NodeId,
        depth: u32,
        observer: &mut dyn ReducedDepthObserver,
    ) {
        struct Frame {
            id: NodeId,
            old_depth: u32,
            next_child: usize,
        }

        let Some(old_depth) = self.lower(id, depth) else {
            return;
        };
        let mut stack = vec![Frame {
            id,
            old_depth,
            next_child: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            let node = &self.nodes[frame.id.0];
            if let Some(&child) = node.children.get(frame.next_child) {
                frame.next_child += 1;
                let child_depth = node.depth.saturating_add(1);
                if let Some(child_old) = self.lower(child, child_depth) {
                    stack.push(Frame {
                        id: child,
                        old_depth: child_old,
                        next_child: 0,
                    });
                }
                continue;
            }

            let (done, old) = (frame.id, frame.old_depth);
            stack.pop();
            let node = &self.nodes[done.0];
            observer.depth_reduced(done, node, old, node.depth);
        }
    }

    /// Lowers the depth of `id`, returning the previous depth if it changed
    fn lower(&mut self, id: NodeId, depth: u32) -> Option<u32> {
        let node = &mut self.nodes[id.0];
        if depth < node.depth {
            let old = node.depth;
            node.depth = depth;
            Some(old)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_get_or_insert_keeps_first_depth() {
        let mut graph = CrawlGraph::new();
        let (a, created) = graph.get_or_insert("http://a/", 3);
        assert!(created);
        let (again, created) = graph.get_or_insert("http://a/", 1);
        assert!(!created);
        assert_eq!(a, again);
        assert_eq!(graph.node(a).depth(), 3);
    }

    #[test]
    fn test_add_child_rejects_duplicates_and_self_links() {
        let mut graph = CrawlGraph::new();
        let (p, _) = graph.get_or_insert("http://p/", 1);
        let (c, _) = graph.get_or_insert("http://c/", 9);
        assert!(graph.add_child(p, c, &mut NoopObserver));
        assert!(!graph.add_child(p, c, &mut NoopObserver));
        assert!(!graph.add_child(p, p, &mut NoopObserver));
        assert_eq!(graph.node(p).children(), &[c]);
        assert_eq!(graph.node(c).depth(), 2);
    }

    #[test]
    fn test_depth_reduction_propagates_to_descendants() {
        let mut graph = CrawlGraph::new();
        let (p, _) = graph.get_or_insert("http://p/", 5);
        let (c, _) = graph.get_or_insert("http://c/", 6);
        let (g, _) = graph.get_or_insert("http://g/", 7);
        let (r, _) = graph.get_or_insert("http://r/", 0);
        graph.add_child(p, c, &mut NoopObserver);
        graph.add_child(c, g, &mut NoopObserver);

        let mut seen = Vec::new();
        let mut observer = |id: NodeId, _: &CrawlUrl, old: u32, new: u32| seen.push((id, old, new));
        graph.add_child(r, p, &mut observer);

        assert_eq!(graph.node(p).depth(), 1);
        assert_eq!(graph.node(c).depth(), 2);
        assert_eq!(graph.node(g).depth(), 3);
        assert_eq!(seen, vec![(g, 7, 3), (c, 6, 2), (p, 5, 1)]);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut graph = CrawlGraph::new();
        let (a, _) = graph.get_or_insert("http://a/", 4);
        let (b, _) = graph.get_or_insert("http://b/", 5);
        graph.add_child(a, b, &mut NoopObserver);
        graph.add_child(b, a, &mut NoopObserver);

        let mut fired = 0;
        let mut observer = |_: NodeId, _: &CrawlUrl, _: u32, _: u32| fired += 1;
        graph.encountered_at_depth(a, 1, &mut observer);

        assert_eq!(graph.node(a).depth(), 1);
        assert_eq!(graph.node(b).depth(), 2);
        assert_eq!(fired, 2);
    }

    #[test]
    fn test_no_change_no_notification() {
        let mut graph = CrawlGraph::new();
        let (a, _) = graph.get_or_insert("http://a/", 2);
        let mut fired = false;
        let mut observer = |_: NodeId, _: &CrawlUrl, _: u32, _: u32| fired = true;
        graph.encountered_at_depth(a, 2, &mut observer);
        graph.encountered_at_depth(a, 3, &mut observer);
        assert!(!fired);
    }

    /// Shortest distance from the root over the recorded edges
    fn bfs_depths(graph: &CrawlGraph, root: NodeId, root_depth: u32) -> Vec<Option<u32>> {
        let mut depths = vec![None; graph.len()];
        depths[root.0] = Some(root_depth);
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let depth = depths[id.0].unwrap_or(0);
            for &child in graph.node(id).children() {
                if depths[child.0].is_none() {
                    depths[child.0] = Some(depth + 1);
                    queue.push_back(child);
                }
            }
        }
        depths
    }

    #[test]
    fn test_depth_is_minimum_over_paths() {
        // Deterministic pseudo-random edge insertion order
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = |bound: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % bound as u64) as usize
        };

        let mut graph = CrawlGraph::new();
        let (root, _) = graph.get_or_insert("http://n/0", 1);
        let ids: Vec<NodeId> = (1..40)
            .map(|i| graph.get_or_insert(&format!("http://n/{}", i), u32::MAX).0)
            .collect();
        let mut reachable = vec![root];

        for _ in 0..150 {
            let parent = reachable[next(reachable.len())];
            let child = ids[next(ids.len())];
            if graph.add_child(parent, child, &mut NoopObserver) && !reachable.contains(&child) {
                reachable.push(child);
            }
        }

        let expected = bfs_depths(&graph, root, 1);
        for id in reachable {
            assert_eq!(Some(graph.node(id).depth()), expected[id.0]);
        }
    }
}
