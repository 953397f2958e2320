// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Corynth core: a declarative workflow orchestration engine.
//!
//! Workflows are authored in HCL, parsed into a typed model, validated into
//! a DAG and executed with bounded parallelism. Steps invoke out-of-process
//! plugins through the [`plugin::PluginRuntime`] seam; execution records
//! persist through the [`state::StateStore`] seam; the
//! [`orchestrator::ChainOrchestrator`] composes whole-workflow chains.

pub mod config;
pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod expr;
pub mod orchestrator;
pub mod parser;
pub mod plugin;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod value;
pub mod workflow;

pub use config::Config;
pub use context::{ExecutionContext, LoopBinding, Scope};
pub use dag::WorkflowDag;
pub use engine::WorkflowEngine;
pub use error::{EngineError, PluginError, Result, StateError};
pub use orchestrator::{ChainOrchestrator, ChainResult};
pub use parser::WorkflowParser;
pub use plugin::{ActionSpec, PluginMetadata, PluginRuntime, PluginRuntimeRef};
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{SchedulerOptions, StepScheduler, SubworkflowRunner};
pub use state::{
    ExecutionMode, ExecutionState, ExecutionStatus, MemoryStateStore, StateStore, StateStoreRef,
    StepExecution, WorkflowOutput,
};
pub use value::Value;
pub use workflow::{Step, StepTarget, Workflow};
