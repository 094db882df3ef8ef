// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The d2d-planner Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared value types for D2D transmission planning.
//!
//! Everything here is a plain request-scoped value: the planner owns nothing
//! between calls, and the returned plan structures transfer ownership to the
//! caller (typically the transport executor).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one MoE expert tensor within a layer.
pub type ExpertId = u32;

/// Which NPUs hold a replica of each expert, as published by the fleet's
/// expert-placement tables. Replica order is preserved for determinism but
/// carries no preference.
pub type ExpertReplicaMap = HashMap<ExpertId, Vec<GlobalNpu>>;

/// A single accelerator device, addressed fleet-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalNpu {
    /// Instance identifier, unique across the fleet.
    pub instance: String,
    /// Device index within that instance.
    pub local_npu: u32,
}

impl GlobalNpu {
    pub fn new(instance: impl Into<String>, local_npu: u32) -> Self {
        Self {
            instance: instance.into(),
            local_npu,
        }
    }
}

impl fmt::Display for GlobalNpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.local_npu)
    }
}

/// One element of an expert transfer plan: pull `expert_id` from `src`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub src: GlobalNpu,
    pub expert_id: ExpertId,
}

/// Per-instance shape used for non-expert weight sourcing.
///
/// Each DP group owns a contiguous slice of `device_size / dp_size` local NPU
/// indices and holds a complete replica of the non-expert weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Total NPUs on the instance.
    pub device_size: u32,
    /// Number of DP groups. Must divide `device_size`.
    pub dp_size: u32,
}

impl InstanceConfig {
    pub fn new(device_size: u32, dp_size: u32) -> Self {
        Self {
            device_size,
            dp_size,
        }
    }

    /// Whether the shape is usable as a non-expert source.
    pub fn is_valid(&self) -> bool {
        self.device_size > 0 && self.dp_size > 0 && self.device_size % self.dp_size == 0
    }

    /// NPUs per DP group. Callers must check [`is_valid`](Self::is_valid) first.
    pub fn npus_per_group(&self) -> u32 {
        self.device_size / self.dp_size
    }
}

/// Chosen source for the non-expert weights of one layer.
///
/// `dp_group_index == -1` is the sentinel for "no viable group": the config
/// set was empty or every entry was malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonExpertStep {
    pub src_instance: String,
    pub dp_group_index: i32,
    pub start_npu_index: i32,
    pub dp_size: u32,
}

impl NonExpertStep {
    /// The sentinel form returned when no DP group is viable.
    pub fn unassigned() -> Self {
        Self {
            src_instance: String::new(),
            dp_group_index: -1,
            start_npu_index: -1,
            dp_size: 0,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.dp_group_index >= 0
    }
}
