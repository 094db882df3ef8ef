// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The d2d-planner Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end layer planning: expert transfer assignment followed by
//! non-expert source selection, on fleet-shaped topologies.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use d2d_planner::{
    ExpertId, ExpertReplicaMap, GlobalNpu, InstanceConfig, NonExpertStep, Step,
    aggregate_npu_loads, dp_group_peak, optimize_layer, optimize_non_expert, peak_source_load,
};

const TOTAL_EXPERTS: u32 = 256;
const NPUS_PER_INSTANCE: u32 = 16;
const EXPERTS_PER_NPU: u32 = TOTAL_EXPERTS / NPUS_PER_INSTANCE;

/// Standard fleet layout: expert `e` lives on `local_npu = e / EXPERTS_PER_NPU`
/// of every instance, optionally with extra randomly placed replicas.
fn build_fleet(
    instances: usize,
    dp_size: u32,
    redundancy_per_npu: usize,
    seed: u64,
) -> (ExpertReplicaMap, HashMap<String, InstanceConfig>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut replicas = ExpertReplicaMap::new();
    let mut configs = HashMap::new();

    for inst_idx in 0..instances {
        let name = format!("inst-{inst_idx}");
        configs.insert(name.clone(), InstanceConfig::new(NPUS_PER_INSTANCE, dp_size));

        for npu_idx in 0..NPUS_PER_INSTANCE {
            let npu = GlobalNpu::new(&name, npu_idx);
            for e in 0..EXPERTS_PER_NPU {
                let expert_id = npu_idx * EXPERTS_PER_NPU + e;
                replicas.entry(expert_id).or_default().push(npu.clone());
            }
            for _ in 0..redundancy_per_npu {
                let expert_id: ExpertId = rng.random_range(0..TOTAL_EXPERTS);
                replicas.entry(expert_id).or_default().push(npu.clone());
            }
        }
    }
    (replicas, configs)
}

fn assert_plan_shape(plan: &[Step], required: &[ExpertId], replicas: &ExpertReplicaMap) {
    assert_eq!(plan.len(), required.len());
    for (step, &expert_id) in plan.iter().zip(required) {
        assert_eq!(step.expert_id, expert_id, "plan must preserve input order");
        assert!(
            replicas[&expert_id].contains(&step.src),
            "expert {expert_id} planned from non-replica {}",
            step.src
        );
    }
}

/// The chosen group's internal peak must not exceed that of any other valid
/// group in the fleet.
fn assert_group_is_optimal(
    chosen: &NonExpertStep,
    plan: &[Step],
    configs: &HashMap<String, InstanceConfig>,
) {
    assert!(chosen.is_assigned());
    let loads = aggregate_npu_loads(plan, configs);
    let per_group = configs[&chosen.src_instance].npus_per_group() as usize;
    let chosen_peak = dp_group_peak(
        &loads[&chosen.src_instance],
        chosen.start_npu_index as usize,
        per_group,
    );

    for (name, config) in configs {
        if !config.is_valid() {
            continue;
        }
        let len = config.npus_per_group() as usize;
        for group in 0..config.dp_size as usize {
            let peak = dp_group_peak(&loads[name], group * len, len);
            assert!(
                chosen_peak <= peak,
                "group {group} of {name} has peak {peak} < chosen {chosen_peak}"
            );
        }
    }
}

#[test]
fn five_instance_fleet_balances_and_picks_idle_group() {
    let (replicas, configs) = build_fleet(5, 4, 0, 0);
    let required: Vec<ExpertId> = (0..TOTAL_EXPERTS).collect();

    let plan = optimize_layer(&required, &replicas).unwrap();
    assert_plan_shape(&plan, &required, &replicas);
    // 16 experts per NPU column shared by 5 replicas: ceil(16 / 5) = 4.
    assert_eq!(peak_source_load(&plan), 4);

    let chosen = optimize_non_expert(&plan, &configs);
    assert_group_is_optimal(&chosen, &plan, &configs);
    assert_eq!(
        chosen.start_npu_index,
        chosen.dp_group_index * (NPUS_PER_INSTANCE / 4) as i32
    );
    assert_eq!(chosen.dp_size, 4);
}

#[test]
fn single_instance_fleet_has_no_slack() {
    let (replicas, configs) = build_fleet(1, 4, 0, 0);
    let required: Vec<ExpertId> = (0..TOTAL_EXPERTS).collect();

    let plan = optimize_layer(&required, &replicas).unwrap();
    assert_plan_shape(&plan, &required, &replicas);
    assert_eq!(peak_source_load(&plan), EXPERTS_PER_NPU);

    // Every NPU carries exactly EXPERTS_PER_NPU transfers, so every group
    // peaks at the same value and the chosen one is no exception.
    let chosen = optimize_non_expert(&plan, &configs);
    assert_group_is_optimal(&chosen, &plan, &configs);
    let loads = aggregate_npu_loads(&plan, &configs);
    assert_eq!(
        dp_group_peak(&loads["inst-0"], chosen.start_npu_index as usize, 4),
        EXPERTS_PER_NPU
    );
}

#[test]
fn redundant_replicas_only_lower_the_peak() {
    let (replicas, configs) = build_fleet(3, 8, 20, 42);
    let required: Vec<ExpertId> = (0..TOTAL_EXPERTS).collect();

    let plan = optimize_layer(&required, &replicas).unwrap();
    assert_plan_shape(&plan, &required, &replicas);
    // The base layout alone admits ceil(16 / 3) = 6 per source NPU; extra
    // replicas add edges and can only improve on that.
    assert!(
        peak_source_load(&plan) <= 6,
        "peak {} exceeds the base-layout bound",
        peak_source_load(&plan)
    );

    let chosen = optimize_non_expert(&plan, &configs);
    assert_group_is_optimal(&chosen, &plan, &configs);
}

#[test]
fn planning_is_deterministic_end_to_end() {
    let required: Vec<ExpertId> = (0..TOTAL_EXPERTS).collect();

    let (replicas_a, configs_a) = build_fleet(3, 4, 10, 7);
    let (replicas_b, configs_b) = build_fleet(3, 4, 10, 7);
    assert_eq!(replicas_a, replicas_b);

    let plan_a = optimize_layer(&required, &replicas_a).unwrap();
    let plan_b = optimize_layer(&required, &replicas_b).unwrap();
    assert_eq!(plan_a, plan_b);

    let chosen_a = optimize_non_expert(&plan_a, &configs_a);
    let chosen_b = optimize_non_expert(&plan_b, &configs_b);
    assert_eq!(chosen_a, chosen_b);
}

#[test]
fn idle_instance_serves_non_expert_weights() {
    // Only inst-0 holds experts; inst-1 is registered but idle.
    let mut replicas = ExpertReplicaMap::new();
    for expert_id in 0..NPUS_PER_INSTANCE {
        replicas.insert(expert_id, vec![GlobalNpu::new("inst-0", expert_id)]);
    }
    let configs = HashMap::from([
        ("inst-0".to_string(), InstanceConfig::new(NPUS_PER_INSTANCE, 4)),
        ("inst-1".to_string(), InstanceConfig::new(NPUS_PER_INSTANCE, 4)),
    ]);

    let required: Vec<ExpertId> = (0..NPUS_PER_INSTANCE).collect();
    let plan = optimize_layer(&required, &replicas).unwrap();
    assert_eq!(peak_source_load(&plan), 1);

    let chosen = optimize_non_expert(&plan, &configs);
    assert_eq!(chosen.src_instance, "inst-1");
    assert_eq!(chosen.dp_group_index, 0);
    let loads = aggregate_npu_loads(&plan, &configs);
    assert_eq!(dp_group_peak(&loads["inst-1"], 0, 4), 0);
}
