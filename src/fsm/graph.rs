//! Intrusive labeled multigraph.
//!
//! Adjacency is stored as intrusive singly linked chains threaded through
//! the edge records: each node keeps its first out-edge and first in-edge
//! id, each edge keeps the next out-edge of its source and the next in-edge
//! of its destination. New edges are pushed at the front, so iteration
//! order over a node's edges is LIFO with respect to insertion; the FSM
//! printer and `simplify` preserve that order.
//!
//! Removal unlinks an edge from both chains but keeps the record in place
//! (ids stay stable); `simplify` rebuilds the graph densely.

use serde::{Deserialize, Serialize};

pub(crate) const NO_EDGE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GraphEdge<L> {
    pub(crate) label: L,
    pub(crate) src: i32,
    pub(crate) dst: i32,
    pub(crate) next_out: i32,
    pub(crate) next_in: i32,
}

/// Labeled directed multigraph with O(degree) edge removal and node
/// coalescing. Monomorphized per label type; the FSM instantiates it with
/// its edge label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Graph<L> {
    pub(crate) edges: Vec<GraphEdge<L>>,
    /// Per node: (first out-edge id, first in-edge id).
    pub(crate) adj_heads: Vec<(i32, i32)>,
    /// Per node: (out-degree, in-degree).
    pub(crate) out_in_degrees: Vec<(i32, i32)>,
}

impl<L: Copy + PartialEq> Graph<L> {
    pub(crate) fn new() -> Self {
        Self {
            edges: Vec::new(),
            adj_heads: Vec::new(),
            out_in_degrees: Vec::new(),
        }
    }

    pub(crate) fn num_nodes(&self) -> usize {
        self.adj_heads.len()
    }

    pub(crate) fn add_node(&mut self) -> u32 {
        self.adj_heads.push((NO_EDGE, NO_EDGE));
        self.out_in_degrees.push((0, 0));
        (self.adj_heads.len() - 1) as u32
    }

    pub(crate) fn add_edge(&mut self, src: u32, dst: u32, label: L) -> u32 {
        let id = self.edges.len() as i32;
        self.edges.push(GraphEdge {
            label,
            src: src as i32,
            dst: dst as i32,
            next_out: self.adj_heads[src as usize].0,
            next_in: self.adj_heads[dst as usize].1,
        });
        self.adj_heads[src as usize].0 = id;
        self.adj_heads[dst as usize].1 = id;
        self.out_in_degrees[src as usize].0 += 1;
        self.out_in_degrees[dst as usize].1 += 1;
        id as u32
    }

    pub(crate) fn out_degree(&self, node: u32) -> i32 {
        self.out_in_degrees[node as usize].0
    }

    pub(crate) fn in_degree(&self, node: u32) -> i32 {
        self.out_in_degrees[node as usize].1
    }

    /// Iterate the out-edges of `node` as `(label, dst)` in LIFO order.
    pub(crate) fn out_edges(&self, node: u32) -> OutEdges<'_, L> {
        OutEdges {
            graph: self,
            next: self.adj_heads[node as usize].0,
        }
    }

    /// Unlink an edge from both adjacency chains. O(in/out-degree).
    pub(crate) fn remove_edge(&mut self, edge_id: u32) {
        let (src, dst) = {
            let e = &self.edges[edge_id as usize];
            (e.src, e.dst)
        };
        self.unlink_out(src, edge_id as i32);
        self.unlink_in(dst, edge_id as i32);
    }

    fn unlink_out(&mut self, src: i32, edge_id: i32) {
        let mut prev = NO_EDGE;
        let mut cur = self.adj_heads[src as usize].0;
        while cur != NO_EDGE {
            if cur == edge_id {
                let next = self.edges[cur as usize].next_out;
                if prev == NO_EDGE {
                    self.adj_heads[src as usize].0 = next;
                } else {
                    self.edges[prev as usize].next_out = next;
                }
                break;
            }
            prev = cur;
            cur = self.edges[cur as usize].next_out;
        }
        self.out_in_degrees[src as usize].0 -= 1;
    }

    fn unlink_in(&mut self, dst: i32, edge_id: i32) {
        let mut prev = NO_EDGE;
        let mut cur = self.adj_heads[dst as usize].1;
        while cur != NO_EDGE {
            if cur == edge_id {
                let next = self.edges[cur as usize].next_in;
                if prev == NO_EDGE {
                    self.adj_heads[dst as usize].1 = next;
                } else {
                    self.edges[prev as usize].next_in = next;
                }
                break;
            }
            prev = cur;
            cur = self.edges[cur as usize].next_in;
        }
        self.out_in_degrees[dst as usize].1 -= 1;
    }

    /// Merge node `b` into node `a`: every edge incident to `b` is
    /// re-pointed at `a`; edges that would become `a → a` self-loops via
    /// the merge of an `a`↔`b` edge are dropped. `b` is left isolated.
    pub(crate) fn coalesce(&mut self, a: u32, b: u32) {
        debug_assert_ne!(a, b, "cannot coalesce a node into itself");

        let in_ids: Vec<i32> = self.in_edge_ids(b).collect();
        for eid in in_ids {
            let (src, label) = {
                let e = &self.edges[eid as usize];
                (e.src, e.label)
            };
            self.unlink_out(src, eid);
            if src != a as i32 && src != b as i32 {
                self.add_edge(src as u32, a, label);
            }
        }
        let out_ids: Vec<i32> = self.out_edge_ids(b).collect();
        for eid in out_ids {
            let (dst, label) = {
                let e = &self.edges[eid as usize];
                (e.dst, e.label)
            };
            self.unlink_in(dst, eid);
            if dst != a as i32 && dst != b as i32 {
                self.add_edge(a, dst as u32, label);
            }
        }
        self.adj_heads[b as usize] = (NO_EDGE, NO_EDGE);
        self.out_in_degrees[b as usize] = (0, 0);
        debug_assert!(self.well_formed());
    }

    fn out_edge_ids(&self, node: u32) -> impl Iterator<Item = i32> + '_ {
        let mut cur = self.adj_heads[node as usize].0;
        std::iter::from_fn(move || {
            if cur == NO_EDGE {
                return None;
            }
            let id = cur;
            cur = self.edges[cur as usize].next_out;
            Some(id)
        })
    }

    fn in_edge_ids(&self, node: u32) -> impl Iterator<Item = i32> + '_ {
        let mut cur = self.adj_heads[node as usize].1;
        std::iter::from_fn(move || {
            if cur == NO_EDGE {
                return None;
            }
            let id = cur;
            cur = self.edges[cur as usize].next_in;
            Some(id)
        })
    }

    /// Drop nodes unreachable from `starts` (BFS over out-edges) and
    /// compact ids. Returns the rebuilt graph, the new id of each start
    /// node, and the full old→new node map (`u32::MAX` for dropped nodes).
    /// Surviving nodes keep their out-edge iteration order.
    pub(crate) fn simplify(&self, starts: &[u32]) -> (Graph<L>, Vec<u32>, Vec<u32>) {
        let n = self.num_nodes();
        let mut new_id = vec![u32::MAX; n];
        let mut order: Vec<u32> = Vec::new();
        let mut queue: std::collections::VecDeque<u32> = std::collections::VecDeque::new();
        for &s in starts {
            if new_id[s as usize] == u32::MAX {
                new_id[s as usize] = order.len() as u32;
                order.push(s);
                queue.push_back(s);
            }
        }
        while let Some(node) = queue.pop_front() {
            for (_, dst) in self.out_edges(node) {
                if new_id[dst as usize] == u32::MAX {
                    new_id[dst as usize] = order.len() as u32;
                    order.push(dst);
                    queue.push_back(dst);
                }
            }
        }

        let mut out = Graph::new();
        for _ in &order {
            out.add_node();
        }
        for &old in &order {
            // Re-add in reverse chain order so push-front reproduces the
            // original LIFO iteration order.
            let edges: Vec<(L, u32)> = self.out_edges(old).collect();
            for &(label, dst) in edges.iter().rev() {
                out.add_edge(new_id[old as usize], new_id[dst as usize], label);
            }
        }
        let start_map = starts.iter().map(|&s| new_id[s as usize]).collect();
        (out, start_map, new_id)
    }

    /// Audit the intrusive structure: every out-edge must appear in its
    /// destination's in-chain and vice versa, and the degree counters must
    /// match the chains.
    pub(crate) fn well_formed(&self) -> bool {
        for node in 0..self.num_nodes() as u32 {
            let mut out_count = 0;
            for eid in self.out_edge_ids(node) {
                let e = &self.edges[eid as usize];
                if e.src != node as i32 {
                    return false;
                }
                out_count += 1;
                if !self.in_edge_ids(e.dst as u32).any(|other| other == eid) {
                    return false;
                }
            }
            if out_count != self.out_degree(node) {
                return false;
            }

            let mut in_count = 0;
            for eid in self.in_edge_ids(node) {
                let e = &self.edges[eid as usize];
                if e.dst != node as i32 {
                    return false;
                }
                in_count += 1;
                if !self.out_edge_ids(e.src as u32).any(|other| other == eid) {
                    return false;
                }
            }
            if in_count != self.in_degree(node) {
                return false;
            }
        }
        true
    }
}

pub(crate) struct OutEdges<'a, L> {
    graph: &'a Graph<L>,
    next: i32,
}

impl<L: Copy> Iterator for OutEdges<'_, L> {
    type Item = (L, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NO_EDGE {
            return None;
        }
        let e = &self.graph.edges[self.next as usize];
        self.next = e.next_out;
        Some((e.label, e.dst as u32))
    }
}
