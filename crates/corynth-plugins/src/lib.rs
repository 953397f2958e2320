// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin transports and lifecycle management for Corynth.
//!
//! Plugins are out-of-process capability providers. Two transports exist:
//! JSON-on-stdio (one process per invocation, the primary) and a gRPC
//! serve transport (one long-lived process per plugin). The
//! [`manager::PluginManager`] implements the engine's
//! [`corynth_core::PluginRuntime`] seam: registry, local discovery, remote
//! installation, health checks.

pub mod grpc;
pub mod install;
pub mod manager;
pub mod security;
pub mod shell;
pub mod transport;

pub use grpc::GrpcPlugin;
pub use install::PluginInstaller;
pub use manager::{LoadedPlugin, PluginManager};
pub use security::{RegistryCatalog, SecurityPolicy, TrustLevel};
pub use shell::{ShellPlugin, SHELL_PLUGIN_NAME};
pub use transport::StdioPlugin;
