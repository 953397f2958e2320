// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Versioned on-disk envelope shared by the file backend.

use corynth_core::state::ExecutionState;
use serde::{Deserialize, Serialize};

pub const STATE_VERSION: u32 = 1;

/// `{"version": 1, "executions": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub version: u32,
    #[serde(default)]
    pub executions: Vec<ExecutionState>,
}

impl Default for StateEnvelope {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            executions: Vec::new(),
        }
    }
}
