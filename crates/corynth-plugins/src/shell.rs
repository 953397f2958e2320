// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in `shell` plugin.
//!
//! Always present in the registry. Commands still run out of process (via
//! the OS shell); only the protocol plumbing is in-process.

use corynth_core::plugin::{ActionSpec, OutputFieldSpec, ParamSpec, PluginMetadata};
use corynth_core::{PluginError, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

pub const SHELL_PLUGIN_NAME: &str = "shell";

/// The built-in shell executor.
#[derive(Debug, Default)]
pub struct ShellPlugin;

impl ShellPlugin {
    pub fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: SHELL_PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Execute shell commands".to_string(),
            author: "corynth".to_string(),
            tags: vec!["system".to_string(), "builtin".to_string()],
            repository: None,
            license: None,
        }
    }

    pub fn actions(&self) -> HashMap<String, ActionSpec> {
        let mut inputs = HashMap::new();
        inputs.insert(
            "command".to_string(),
            ParamSpec {
                param_type: "string".to_string(),
                description: "Command line passed to `sh -c`".to_string(),
                required: true,
                default: None,
            },
        );
        inputs.insert(
            "working_dir".to_string(),
            ParamSpec {
                param_type: "string".to_string(),
                description: "Directory the command runs in".to_string(),
                required: false,
                default: None,
            },
        );

        let mut outputs = HashMap::new();
        outputs.insert(
            "stdout".to_string(),
            OutputFieldSpec {
                output_type: "string".to_string(),
                description: "Captured standard output".to_string(),
            },
        );
        outputs.insert(
            "stderr".to_string(),
            OutputFieldSpec {
                output_type: "string".to_string(),
                description: "Captured standard error".to_string(),
            },
        );
        outputs.insert(
            "exit_code".to_string(),
            OutputFieldSpec {
                output_type: "number".to_string(),
                description: "Process exit code".to_string(),
            },
        );

        HashMap::from([(
            "exec".to_string(),
            ActionSpec {
                description: "Run a shell command and capture its output".to_string(),
                inputs,
                outputs,
            },
        )])
    }

    pub async fn invoke(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>, PluginError> {
        if action != "exec" {
            return Err(PluginError::ValidationFailed {
                name: SHELL_PLUGIN_NAME.to_string(),
                action: action.to_string(),
                reason: "shell offers only the 'exec' action".to_string(),
            });
        }

        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::ValidationFailed {
                name: SHELL_PLUGIN_NAME.to_string(),
                action: action.to_string(),
                reason: "missing required input 'command'".to_string(),
            })?;

        debug!(command, "running shell command");
        let mut builder = Command::new("sh");
        builder
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = params.get("working_dir").and_then(Value::as_str) {
            builder.current_dir(dir);
        }

        let child = builder.spawn().map_err(|err| PluginError::ProtocolError {
            name: SHELL_PLUGIN_NAME.to_string(),
            reason: format!("cannot spawn shell: {err}"),
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|err| PluginError::ProtocolError {
                    name: SHELL_PLUGIN_NAME.to_string(),
                    reason: format!("wait failed: {err}"),
                })?
            }
            _ = tokio::time::sleep(timeout) => {
                return Err(PluginError::Timeout {
                    name: SHELL_PLUGIN_NAME.to_string(),
                    timeout,
                });
            }
            _ = wait_cancelled(&mut cancel) => {
                return Err(PluginError::ActionFailed {
                    name: SHELL_PLUGIN_NAME.to_string(),
                    action: action.to_string(),
                    message: "invocation cancelled".to_string(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(PluginError::ActionFailed {
                name: SHELL_PLUGIN_NAME.to_string(),
                action: action.to_string(),
                message: format!(
                    "command exited with status {exit_code}: {}",
                    stderr.trim()
                ),
            });
        }

        Ok(HashMap::from([
            ("stdout".to_string(), Value::String(stdout)),
            ("stderr".to_string(), Value::String(stderr)),
            ("exit_code".to_string(), Value::Number(exit_code as f64)),
        ]))
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
