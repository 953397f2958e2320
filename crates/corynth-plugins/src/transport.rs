// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON-on-stdio plugin transport (the primary one).
//!
//! A plugin is an executable invoked as `plugin-binary <verb>` with
//! `<verb>` one of `metadata`, `actions` or an action name. Action
//! parameters arrive as one UTF-8 JSON object on stdin; the plugin writes
//! exactly one JSON value to stdout and exits. Stderr is captured for
//! diagnostics. The caller enforces the deadline and kills the process on
//! timeout or cancellation.

use corynth_core::plugin::{ActionSpec, PluginMetadata};
use corynth_core::{PluginError, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Deadline for the metadata / actions probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to an executable speaking the stdio protocol. One process is
/// spawned per invocation.
#[derive(Debug, Clone)]
pub struct StdioPlugin {
    name: String,
    binary: PathBuf,
}

impl StdioPlugin {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Runs the `metadata` probe.
    pub async fn metadata(&self) -> Result<PluginMetadata, PluginError> {
        let json = self
            .run_verb("metadata", None, PROBE_TIMEOUT, never_cancelled())
            .await?;
        serde_json::from_value(json).map_err(|err| PluginError::ProtocolError {
            name: self.name.clone(),
            reason: format!("malformed metadata: {err}"),
        })
    }

    /// Runs the `actions` probe. Accepts the map form and the array form
    /// (objects carrying a `name` field).
    pub async fn actions(&self) -> Result<HashMap<String, ActionSpec>, PluginError> {
        let json = self
            .run_verb("actions", None, PROBE_TIMEOUT, never_cancelled())
            .await?;

        match json {
            serde_json::Value::Object(_) => {
                serde_json::from_value(json).map_err(|err| PluginError::ProtocolError {
                    name: self.name.clone(),
                    reason: format!("malformed actions map: {err}"),
                })
            }
            serde_json::Value::Array(items) => {
                let mut actions = HashMap::with_capacity(items.len());
                for item in items {
                    let name = item
                        .get("name")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| PluginError::ProtocolError {
                            name: self.name.clone(),
                            reason: "actions array entry without a name".into(),
                        })?
                        .to_string();
                    let spec: ActionSpec = serde_json::from_value(item).map_err(|err| {
                        PluginError::ProtocolError {
                            name: self.name.clone(),
                            reason: format!("malformed action spec '{name}': {err}"),
                        }
                    })?;
                    actions.insert(name, spec);
                }
                Ok(actions)
            }
            other => Err(PluginError::ProtocolError {
                name: self.name.clone(),
                reason: format!("actions returned {other}"),
            }),
        }
    }

    /// Invokes an action with parameters on stdin, returning the output
    /// map. A top-level `error` field denotes a plugin-level failure.
    pub async fn invoke(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>, PluginError> {
        let stdin = serde_json::to_string(&Value::map_to_json(params)).map_err(|err| {
            PluginError::ProtocolError {
                name: self.name.clone(),
                reason: format!("cannot encode parameters: {err}"),
            }
        })?;

        let json = self
            .run_verb(action, Some(stdin), timeout, cancel)
            .await?;

        if let Some(error) = json.get("error").and_then(serde_json::Value::as_str) {
            return Err(PluginError::ActionFailed {
                name: self.name.clone(),
                action: action.to_string(),
                message: error.to_string(),
            });
        }

        Value::map_from_json(json).map_err(|err| PluginError::ProtocolError {
            name: self.name.clone(),
            reason: format!("outputs are not a JSON object: {err}"),
        })
    }

    /// Spawns the binary with one verb, feeding stdin and collecting one
    /// JSON value from stdout. The child is killed when the deadline or
    /// the cancellation signal fires.
    async fn run_verb(
        &self,
        verb: &str,
        stdin: Option<String>,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<serde_json::Value, PluginError> {
        trace!(plugin = %self.name, verb, "spawning plugin process");

        let mut child = Command::new(&self.binary)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PluginError::ProtocolError {
                name: self.name.clone(),
                reason: format!("cannot spawn '{}': {err}", self.binary.display()),
            })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|err| PluginError::ProtocolError {
                        name: self.name.clone(),
                        reason: format!("cannot write parameters: {err}"),
                    })?;
                // Closing stdin signals end of input.
                drop(pipe);
            }
        } else {
            drop(child.stdin.take());
        }

        // Dropping the child on the timeout / cancel branches kills the
        // process (kill_on_drop).
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|err| PluginError::ProtocolError {
                    name: self.name.clone(),
                    reason: format!("wait failed: {err}"),
                })?
            }
            _ = tokio::time::sleep(timeout) => {
                debug!(plugin = %self.name, verb, ?timeout, "plugin timed out, killing");
                return Err(PluginError::Timeout {
                    name: self.name.clone(),
                    timeout,
                });
            }
            _ = wait_cancelled(&mut cancel) => {
                debug!(plugin = %self.name, verb, "invocation cancelled, killing");
                return Err(PluginError::ActionFailed {
                    name: self.name.clone(),
                    action: verb.to_string(),
                    message: "invocation cancelled".into(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let parsed: Result<serde_json::Value, _> = serde_json::from_str(stdout.trim());
        match parsed {
            Ok(json) => {
                // A failed exit with JSON-shaped stdout may still carry an
                // error field worth surfacing.
                if !output.status.success() {
                    if let Some(error) = json.get("error").and_then(serde_json::Value::as_str) {
                        return Err(PluginError::ActionFailed {
                            name: self.name.clone(),
                            action: verb.to_string(),
                            message: error.to_string(),
                        });
                    }
                    return Err(PluginError::ProtocolError {
                        name: self.name.clone(),
                        reason: format!(
                            "exit status {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ),
                    });
                }
                Ok(json)
            }
            Err(err) => Err(PluginError::ProtocolError {
                name: self.name.clone(),
                reason: if stderr.trim().is_empty() {
                    format!("invalid JSON on stdout: {err}")
                } else {
                    format!("invalid JSON on stdout: {err}; stderr: {}", stderr.trim())
                },
            }),
        }
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone; stay pending so the other branches decide.
            std::future::pending::<()>().await;
        }
    }
}

fn never_cancelled() -> watch::Receiver<bool> {
    // The sender drops immediately; `wait_cancelled` treats a closed
    // channel as never-firing.
    let (_tx, rx) = watch::channel(false);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script_plugin(dir: &std::path::Path, name: &str, body: &str) -> StdioPlugin {
        let path = dir.join(format!("corynth-plugin-{name}"));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        file.write_all(body.as_bytes()).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        StdioPlugin::new(name, path)
    }

    const ECHO_PLUGIN: &str = r#"
case "$1" in
  metadata)
    echo '{"name":"echo","version":"1.0.0","description":"Echo plugin","author":"tests","tags":[]}'
    ;;
  actions)
    echo '{"say":{"description":"Echo text","inputs":{"text":{"type":"string","required":true}},"outputs":{"text":{"type":"string"}}}}'
    ;;
  say)
    input=$(cat)
    echo "{\"text\":$(echo "$input" | sed 's/.*"text":\([^,}]*\).*/\1/')}"
    ;;
  fail)
    echo '{"error":"deliberate failure"}'
    ;;
  garbage)
    echo 'not json at all'
    ;;
  slow)
    sleep 5
    echo '{}'
    ;;
  *)
    echo '{"error":"unknown verb"}' >&2
    exit 2
    ;;
esac
"#;

    #[tokio::test]
    async fn test_metadata_probe() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let metadata = plugin.metadata().await.unwrap();
        assert_eq!(metadata.name, "echo");
        assert_eq!(metadata.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_actions_probe() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let actions = plugin.actions().await.unwrap();
        let say = &actions["say"];
        assert!(say.inputs["text"].required);
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let params = HashMap::from([("text".to_string(), Value::String("hello".into()))]);
        let outputs = plugin
            .invoke("say", &params, Duration::from_secs(5), never_cancelled())
            .await
            .unwrap();
        assert_eq!(outputs["text"], Value::String("hello".into()));
    }

    #[tokio::test]
    async fn test_error_field_is_action_failure() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let err = plugin
            .invoke(
                "fail",
                &HashMap::new(),
                Duration::from_secs(5),
                never_cancelled(),
            )
            .await
            .unwrap_err();
        match err {
            PluginError::ActionFailed { message, .. } => {
                assert_eq!(message, "deliberate failure")
            }
            other => panic!("expected ActionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let err = plugin
            .invoke(
                "garbage",
                &HashMap::new(),
                Duration::from_secs(5),
                never_cancelled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let started = std::time::Instant::now();
        let err = plugin
            .invoke(
                "slow",
                &HashMap::new(),
                Duration::from_millis(200),
                never_cancelled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(dir.path(), "echo", ECHO_PLUGIN);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let plugin = plugin.clone();
            async move {
                plugin
                    .invoke("slow", &HashMap::new(), Duration::from_secs(30), rx)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, PluginError::ActionFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let plugin = StdioPlugin::new("ghost", "/nonexistent/corynth-plugin-ghost");
        let err = plugin.metadata().await.unwrap_err();
        assert!(matches!(err, PluginError::ProtocolError { .. }));
    }
}
