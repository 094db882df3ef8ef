// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The d2d-planner Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Non-expert weight source selection.
//!
//! Non-expert weights (attention, router, embeddings, norms) are replicated
//! per DP group, so any single group anywhere in the fleet can serve them.
//! The selector aggregates the expert plan into per-NPU transfer counts and
//! picks the group whose busiest NPU is least busy, keeping the non-expert
//! pull off the D2D critical path. Idle instances aggregate to all-zero
//! loads and therefore win outright.
//!
//! `instance_configs` is unordered, so instances are visited in ascending
//! name order and groups in ascending index; the first strict improvement
//! wins. That makes the tie-break rule stable across runs.

use std::collections::HashMap;

use crate::protocols::{InstanceConfig, NonExpertStep, Step};

/// Per-instance per-NPU expert transfer counts implied by `expert_plan`.
///
/// Steps naming an instance absent from `instance_configs`, or a local NPU
/// index outside its `device_size`, are ignored. Instances with no steps get
/// an all-zero vector.
pub fn aggregate_npu_loads(
    expert_plan: &[Step],
    instance_configs: &HashMap<String, InstanceConfig>,
) -> HashMap<String, Vec<u32>> {
    let mut loads: HashMap<String, Vec<u32>> = instance_configs
        .iter()
        .map(|(name, config)| (name.clone(), vec![0; config.device_size as usize]))
        .collect();

    for step in expert_plan {
        if let Some(per_npu) = loads.get_mut(&step.src.instance)
            && let Some(slot) = per_npu.get_mut(step.src.local_npu as usize)
        {
            *slot += 1;
        }
    }
    loads
}

/// Peak load within one DP group's slice of the per-NPU load vector.
pub fn dp_group_peak(loads: &[u32], start: usize, len: usize) -> u32 {
    let end = (start + len).min(loads.len());
    loads[start.min(end)..end].iter().copied().max().unwrap_or(0)
}

/// Choose the `(instance, DP group)` to pull non-expert weights from.
///
/// Malformed configs (zero sizes or non-divisible `device_size`) are skipped;
/// if nothing viable remains the sentinel step is returned.
pub fn optimize_non_expert(
    expert_plan: &[Step],
    instance_configs: &HashMap<String, InstanceConfig>,
) -> NonExpertStep {
    let loads = aggregate_npu_loads(expert_plan, instance_configs);

    let mut names: Vec<&String> = instance_configs.keys().collect();
    names.sort();

    let mut best: Option<(NonExpertStep, u32)> = None;
    for name in names {
        let config = &instance_configs[name];
        if !config.is_valid() {
            tracing::warn!(
                instance = %name,
                device_size = config.device_size,
                dp_size = config.dp_size,
                "skipping malformed instance config"
            );
            continue;
        }

        let npus_per_group = config.npus_per_group();
        let per_npu = &loads[name];
        for group in 0..config.dp_size {
            let start = (group * npus_per_group) as usize;
            let peak = dp_group_peak(per_npu, start, npus_per_group as usize);
            if best.as_ref().is_none_or(|&(_, best_peak)| peak < best_peak) {
                best = Some((
                    NonExpertStep {
                        src_instance: name.clone(),
                        dp_group_index: group as i32,
                        start_npu_index: start as i32,
                        dp_size: config.dp_size,
                    },
                    peak,
                ));
            }
        }
    }

    match best {
        Some((step, peak)) => {
            tracing::info!(
                instance = %step.src_instance,
                dp_group = step.dp_group_index,
                start_npu = step.start_npu_index,
                peak,
                "selected non-expert weight source"
            );
            step
        }
        None => {
            tracing::warn!("no viable instance config for non-expert weights");
            NonExpertStep::unassigned()
        }
    }
}
