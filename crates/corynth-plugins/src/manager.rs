// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin registry and lifecycle manager.
//!
//! Keeps a thread-safe map of loaded plugins (the built-in `shell` is
//! always present), discovers `corynth-plugin-*` executables in the local
//! plugins directory, installs unknown names from remote repositories when
//! `auto_install` is on, and serializes concurrent loads of the same name
//! on a per-name latch.

use crate::grpc::GrpcPlugin;
use crate::install::PluginInstaller;
use crate::shell::{ShellPlugin, SHELL_PLUGIN_NAME};
use crate::transport::StdioPlugin;
use corynth_core::plugin::{ActionSpec, PluginMetadata, PluginRuntime};
use corynth_core::config::PluginsConfig;
use corynth_core::{PluginError, Value};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// The concrete transport behind a loaded plugin.
enum PluginHandle {
    Builtin(ShellPlugin),
    Stdio(StdioPlugin),
    Grpc(GrpcPlugin),
}

/// A resolved plugin with probed introspection data.
pub struct LoadedPlugin {
    pub name: String,
    pub metadata: PluginMetadata,
    pub actions: HashMap<String, ActionSpec>,
    handle: PluginHandle,
}

impl LoadedPlugin {
    /// Transport name for display.
    pub fn transport(&self) -> &'static str {
        match self.handle {
            PluginHandle::Builtin(_) => "builtin",
            PluginHandle::Stdio(_) => "stdio",
            PluginHandle::Grpc(_) => "grpc",
        }
    }
}

/// Registry of loaded plugins; implements the engine's `PluginRuntime`
/// seam.
pub struct PluginManager {
    config: PluginsConfig,
    registry: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    latches: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    installer: PluginInstaller,
}

impl PluginManager {
    pub fn new(config: PluginsConfig) -> Arc<Self> {
        let shell = ShellPlugin;
        let builtin = LoadedPlugin {
            name: SHELL_PLUGIN_NAME.to_string(),
            metadata: shell.metadata(),
            actions: shell.actions(),
            handle: PluginHandle::Builtin(shell),
        };

        let mut registry = HashMap::new();
        registry.insert(SHELL_PLUGIN_NAME.to_string(), Arc::new(builtin));

        Arc::new(Self {
            installer: PluginInstaller::new(&config),
            config,
            registry: RwLock::new(registry),
            latches: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a loaded plugin handle, loading lazily. Concurrent calls
    /// for the same name serialize; at most one load attempt is in flight
    /// per name.
    pub async fn get(&self, name: &str) -> Result<Arc<LoadedPlugin>, PluginError> {
        if let Some(found) = self.registry.read().get(name) {
            return Ok(found.clone());
        }

        let latch = {
            let mut latches = self.latches.lock().await;
            latches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = latch.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(found) = self.registry.read().get(name) {
            return Ok(found.clone());
        }

        let loaded = self.load(name).await?;
        let loaded = Arc::new(loaded);
        self.registry
            .write()
            .insert(name.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Every currently loaded plugin.
    pub fn loaded(&self) -> Vec<Arc<LoadedPlugin>> {
        self.registry.read().values().cloned().collect()
    }

    /// Scans the plugins directory and loads everything discoverable.
    /// Used by the CLI listing; failures are logged per entry.
    pub async fn discover_all(&self) -> Vec<Arc<LoadedPlugin>> {
        for name in discoverable_names(&self.config.local_path) {
            if let Err(err) = self.get(&name).await {
                warn!(plugin = %name, error = %err, "discovered plugin failed to load");
            }
        }
        self.loaded()
    }

    /// Loads one plugin: local discovery first, then remote installation
    /// when enabled.
    async fn load(&self, name: &str) -> Result<LoadedPlugin, PluginError> {
        if let Some(binary) = find_local_binary(&self.config.local_path, name) {
            return self.probe(name, &binary).await;
        }

        if self.config.auto_install {
            info!(plugin = %name, "plugin not present locally, installing");
            let binary = self.installer.install(name).await?;
            return self.probe(name, &binary).await;
        }

        Err(PluginError::NotFound(name.to_string()))
    }

    /// Probes a binary: the stdio metadata call first, then the serve
    /// handshake. The first responsive protocol wins.
    async fn probe(&self, name: &str, binary: &Path) -> Result<LoadedPlugin, PluginError> {
        let stdio = StdioPlugin::new(name, binary);
        match stdio.metadata().await {
            Ok(metadata) => {
                let actions = stdio.actions().await.unwrap_or_default();
                debug!(plugin = %name, "loaded via stdio transport");
                return Ok(LoadedPlugin {
                    name: name.to_string(),
                    metadata,
                    actions,
                    handle: PluginHandle::Stdio(stdio),
                });
            }
            Err(stdio_err) => {
                debug!(plugin = %name, error = %stdio_err, "stdio probe failed, trying serve");
                match GrpcPlugin::launch(name, binary).await {
                    Ok(grpc) => {
                        let metadata = grpc.metadata().await?;
                        let actions = grpc.actions().await.unwrap_or_default();
                        debug!(plugin = %name, address = %grpc.address(), "loaded via grpc transport");
                        Ok(LoadedPlugin {
                            name: name.to_string(),
                            metadata,
                            actions,
                            handle: PluginHandle::Grpc(grpc),
                        })
                    }
                    Err(grpc_err) => Err(PluginError::ProtocolError {
                        name: name.to_string(),
                        reason: format!(
                            "no transport responded (stdio: {stdio_err}; serve: {grpc_err})"
                        ),
                    }),
                }
            }
        }
    }

    /// Re-probes a plugin's metadata as a health check.
    pub async fn health_check(&self, name: &str) -> Result<(), PluginError> {
        let plugin = self.get(name).await?;
        match &plugin.handle {
            PluginHandle::Builtin(_) => Ok(()),
            PluginHandle::Stdio(stdio) => stdio.metadata().await.map(|_| ()),
            PluginHandle::Grpc(grpc) => grpc.health().await,
        }
    }

    /// Terminates serve-transport processes. Called on engine shutdown.
    pub async fn shutdown(&self) {
        let plugins = self.loaded();
        for plugin in plugins {
            if let PluginHandle::Grpc(grpc) = &plugin.handle {
                grpc.shutdown().await;
            }
        }
    }

    fn check_inputs(
        plugin: &LoadedPlugin,
        action: &str,
        params: &mut HashMap<String, Value>,
    ) -> Result<(), PluginError> {
        match plugin.actions.get(action) {
            Some(spec) => spec.check_inputs(action, &plugin.name, params),
            // Plugins without declared actions accept anything.
            None if plugin.actions.is_empty() => Ok(()),
            None => Err(PluginError::ValidationFailed {
                name: plugin.name.clone(),
                action: action.to_string(),
                reason: "unknown action".to_string(),
            }),
        }
    }
}

#[async_trait]
impl PluginRuntime for PluginManager {
    async fn ensure(&self, name: &str) -> Result<(), PluginError> {
        self.get(name).await.map(|_| ())
    }

    async fn metadata(&self, name: &str) -> Result<PluginMetadata, PluginError> {
        Ok(self.get(name).await?.metadata.clone())
    }

    async fn actions(&self, name: &str) -> Result<HashMap<String, ActionSpec>, PluginError> {
        Ok(self.get(name).await?.actions.clone())
    }

    async fn invoke(
        &self,
        plugin: &str,
        action: &str,
        mut params: HashMap<String, Value>,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>, PluginError> {
        let loaded = self.get(plugin).await?;
        Self::check_inputs(&loaded, action, &mut params)?;

        match &loaded.handle {
            PluginHandle::Builtin(shell) => shell.invoke(action, &params, timeout, cancel).await,
            PluginHandle::Stdio(stdio) => stdio.invoke(action, &params, timeout, cancel).await,
            PluginHandle::Grpc(grpc) => grpc.execute(action, &params, timeout, cancel).await,
        }
    }

    async fn validate(
        &self,
        plugin: &str,
        action: &str,
        mut params: HashMap<String, Value>,
    ) -> Result<(), PluginError> {
        let loaded = self.get(plugin).await?;
        Self::check_inputs(&loaded, action, &mut params)?;

        // The serve transport has a dedicated validation call; stdio
        // plugins are only checked against their declared inputs.
        if let PluginHandle::Grpc(grpc) = &loaded.handle {
            grpc.validate(action, &params).await?;
        }
        Ok(())
    }
}

/// `corynth-plugin-<name>` files and `<dir>/plugin` executables under the
/// plugins directory.
fn discoverable_names(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return names;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() {
            if let Some(name) = file_name.strip_prefix("corynth-plugin-") {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        } else if path.is_dir() && path.join("plugin").is_file() {
            names.push(file_name.to_string());
        }
    }

    names.sort();
    names
}

fn find_local_binary(dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = dir.join(format!("corynth-plugin-{name}"));
    if direct.is_file() {
        return Some(direct);
    }
    let nested = dir.join(name).join("plugin");
    if nested.is_file() {
        return Some(nested);
    }
    None
}
