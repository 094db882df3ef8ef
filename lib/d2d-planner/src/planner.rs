// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The d2d-planner Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Expert transfer planning for a layer.
//!
//! When a fresh instance joins the fleet, every expert its NPUs need must be
//! pulled from exactly one replica somewhere in the fleet. The planner picks
//! the sources so that no single NPU is asked to send more experts than
//! necessary: it binary-searches the smallest per-source bound `K` for which
//! a complete assignment exists, checking each candidate with a max-flow
//! feasibility test.
//!
//! # Graph shape
//!
//! For a bound `K`: source -> each distinct replica NPU with capacity `K`,
//! NPU -> each required-expert slot it can serve with capacity 1, slot ->
//! sink with capacity 1. The bound is feasible iff the max flow equals the
//! number of required slots. The plan is read back out of the residual graph
//! of the best feasible solve.

use std::collections::HashMap;

use crate::max_flow::MaxFlow;
use crate::protocols::{ExpertId, ExpertReplicaMap, GlobalNpu, Step};

/// Planning failures. Malformed input is reported before any graph is built;
/// residual inconsistencies indicate a bug in the flow engine and are
/// surfaced rather than papered over.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("expert {expert_id} has no source replica to transfer from")]
    UnassignedExpert { expert_id: ExpertId },

    #[error("residual graph inconsistency: {0}")]
    ResidualInconsistency(String),
}

// Node layout shared by every feasibility probe.
const SOURCE: usize = 0;
const NPU_OFFSET: usize = 1;

/// Plan one layer's expert transfers.
///
/// Returns one [`Step`] per element of `required`, in input order. Duplicate
/// expert ids are independent demands and each consumes a source slot. The
/// peak number of steps sharing one source NPU is the minimum achievable
/// over all valid assignments.
pub fn optimize_layer(
    required: &[ExpertId],
    replicas: &ExpertReplicaMap,
) -> Result<Vec<Step>, PlanError> {
    if required.is_empty() {
        return Ok(Vec::new());
    }

    for &expert_id in required {
        match replicas.get(&expert_id) {
            Some(sources) if !sources.is_empty() => {}
            _ => return Err(PlanError::UnassignedExpert { expert_id }),
        }
    }

    // Number the distinct source NPUs by first appearance in required order
    // (not map order) so identical inputs produce identical graphs and plans.
    let mut npu_to_idx: HashMap<&GlobalNpu, usize> = HashMap::new();
    let mut npu_index_map: Vec<&GlobalNpu> = Vec::new();
    for &expert_id in required {
        for npu in &replicas[&expert_id] {
            if !npu_to_idx.contains_key(npu) {
                npu_to_idx.insert(npu, npu_index_map.len());
                npu_index_map.push(npu);
            }
        }
    }

    let total = required.len() as u32;
    let mut low = 1u32;
    let mut high = total;
    let mut best: Option<(u32, MaxFlow)> = None;

    while low <= high {
        let k = low + (high - low) / 2;
        let mut mf = build_graph(k, required, replicas, &npu_to_idx, npu_index_map.len());
        let flow = mf.solve();
        if flow > total {
            return Err(PlanError::ResidualInconsistency(format!(
                "max flow {flow} exceeds demand {total}"
            )));
        }
        let feasible = flow == total;
        tracing::debug!(k, flow, feasible, "probed peak source load bound");
        if feasible {
            best = Some((k, mf));
            high = k - 1;
        } else {
            low = k + 1;
        }
    }

    // Every required expert has a replica, so K = |required| always admits a
    // full assignment; an empty best means the engine lost flow somewhere.
    let (peak, mf) = best.ok_or_else(|| {
        PlanError::ResidualInconsistency(format!("no feasible bound up to {total}"))
    })?;

    let plan = extract_plan(&mf, &npu_index_map, required)?;
    tracing::info!(
        transfers = plan.len(),
        peak,
        sources = npu_index_map.len(),
        "expert transfer plan balanced"
    );
    Ok(plan)
}

/// Peak number of transfers any single source NPU serves in `plan` — the
/// quantity [`optimize_layer`] minimizes. Zero for an empty plan.
pub fn peak_source_load(plan: &[Step]) -> u32 {
    let mut counts: HashMap<&GlobalNpu, u32> = HashMap::new();
    let mut peak = 0;
    for step in plan {
        let count = counts.entry(&step.src).or_insert(0);
        *count += 1;
        peak = peak.max(*count);
    }
    peak
}

fn build_graph(
    k: u32,
    required: &[ExpertId],
    replicas: &ExpertReplicaMap,
    npu_to_idx: &HashMap<&GlobalNpu, usize>,
    npu_count: usize,
) -> MaxFlow {
    let req_offset = NPU_OFFSET + npu_count;
    let sink = req_offset + required.len();
    let mut mf = MaxFlow::new(sink + 1, SOURCE, sink);

    for i in 0..npu_count {
        mf.add_edge(SOURCE, NPU_OFFSET + i, k);
    }
    for (slot, &expert_id) in required.iter().enumerate() {
        let req_node = req_offset + slot;
        for npu in &replicas[&expert_id] {
            mf.add_edge(NPU_OFFSET + npu_to_idx[npu], req_node, 1);
        }
        mf.add_edge(req_node, sink, 1);
    }
    mf
}

/// Read the assignment out of the residual graph: the reverse edge at a
/// request node with positive residual points back at the NPU whose forward
/// unit edge carried the flow.
fn extract_plan(
    mf: &MaxFlow,
    npu_index_map: &[&GlobalNpu],
    required: &[ExpertId],
) -> Result<Vec<Step>, PlanError> {
    let req_offset = NPU_OFFSET + npu_index_map.len();
    let npu_range = NPU_OFFSET..req_offset;

    let mut plan = Vec::with_capacity(required.len());
    for (slot, &expert_id) in required.iter().enumerate() {
        let src = mf
            .edges(req_offset + slot)
            .iter()
            .find(|back| npu_range.contains(&back.to) && back.cap > 0)
            .map(|back| npu_index_map[back.to - NPU_OFFSET]);
        let Some(src) = src else {
            return Err(PlanError::ResidualInconsistency(format!(
                "no flow into request slot {slot} (expert {expert_id})"
            )));
        };
        plan.push(Step {
            src: src.clone(),
            expert_id,
        });
    }
    Ok(plan)
}
