// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The d2d-planner Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dinic max-flow on small integer capacities.
//!
//! The planner parameterizes a unit-capacity assignment graph by the peak
//! load bound `K` and asks for the max flow; the residual graph left behind
//! by [`MaxFlow::solve`] is then inspected through [`MaxFlow::edges`] to
//! recover which forward edges carried flow.
//!
//! Adjacency order equals insertion order and both BFS and DFS walk edges in
//! that order, so identical inputs leave identical residual graphs.

use std::collections::VecDeque;

/// One directed residual edge.
///
/// `rev` is the index of the paired edge in `adj[to]`: pushing flow here
/// decrements `cap` and increments the paired edge's `cap`.
#[derive(Debug, Clone, Copy)]
pub struct FlowEdge {
    pub to: usize,
    pub rev: usize,
    pub cap: u32,
}

/// A directed flow network with a fixed node count.
#[derive(Debug)]
pub struct MaxFlow {
    adj: Vec<Vec<FlowEdge>>,
    level: Vec<i32>,
    iter: Vec<usize>,
    source: usize,
    sink: usize,
}

impl MaxFlow {
    pub fn new(nodes: usize, source: usize, sink: usize) -> Self {
        debug_assert!(source < nodes && sink < nodes);
        Self {
            adj: vec![Vec::new(); nodes],
            level: vec![-1; nodes],
            iter: vec![0; nodes],
            source,
            sink,
        }
    }

    /// Install a forward edge `u -> v` of capacity `cap` plus its zero-capacity
    /// reverse residual.
    pub fn add_edge(&mut self, u: usize, v: usize, cap: u32) {
        let rev_u = self.adj[v].len();
        let rev_v = self.adj[u].len();
        self.adj[u].push(FlowEdge { to: v, rev: rev_u, cap });
        self.adj[v].push(FlowEdge {
            to: u,
            rev: rev_v,
            cap: 0,
        });
    }

    /// Residual adjacency of `u`, for plan extraction after [`solve`](Self::solve).
    pub fn edges(&self, u: usize) -> &[FlowEdge] {
        &self.adj[u]
    }

    /// Run Dinic to completion and return the max flow from source to sink.
    pub fn solve(&mut self) -> u32 {
        let mut flow = 0;
        while self.bfs() {
            self.iter.fill(0);
            loop {
                let pushed = self.dfs(self.source, u32::MAX);
                if pushed == 0 {
                    break;
                }
                flow += pushed;
            }
        }
        flow
    }

    /// Level the residual graph from the source. Returns false once the sink
    /// is unreachable, which terminates the phase loop.
    fn bfs(&mut self) -> bool {
        self.level.fill(-1);
        let mut queue = VecDeque::with_capacity(self.adj.len());
        self.level[self.source] = 0;
        queue.push_back(self.source);
        while let Some(v) = queue.pop_front() {
            for e in &self.adj[v] {
                if e.cap > 0 && self.level[e.to] < 0 {
                    self.level[e.to] = self.level[v] + 1;
                    queue.push_back(e.to);
                }
            }
        }
        self.level[self.sink] >= 0
    }

    /// Push one augmenting path of bottleneck `limit` along strictly
    /// increasing levels. The per-node `iter` cursor never rewinds within a
    /// phase, so exhausted edges are not revisited.
    fn dfs(&mut self, v: usize, limit: u32) -> u32 {
        if v == self.sink {
            return limit;
        }
        while self.iter[v] < self.adj[v].len() {
            let FlowEdge { to, rev, cap } = self.adj[v][self.iter[v]];
            if cap > 0 && self.level[v] < self.level[to] {
                let pushed = self.dfs(to, limit.min(cap));
                if pushed > 0 {
                    self.adj[v][self.iter[v]].cap -= pushed;
                    self.adj[to][rev].cap += pushed;
                    return pushed;
                }
            }
            self.iter[v] += 1;
        }
        0
    }
}
