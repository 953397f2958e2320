// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! gRPC plugin transport (serve handshake).
//!
//! The plugin is launched once with the verb `serve`, prints a single
//! handshake line `1|1|tcp|<host>:<port>|grpc` and keeps serving on that
//! address for its process lifetime. The caller terminates the process on
//! shutdown and on health failure.

use corynth_core::plugin::{ActionSpec, PluginMetadata};
use corynth_core::{PluginError, Value};
use corynth_protocol::{proto, PluginServiceClient};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tonic::transport::Channel;
use tracing::{debug, warn};

/// Deadline for the handshake line and the dial.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol version this engine speaks.
const PROTOCOL_VERSION: u32 = 1;

/// A running serve-transport plugin process and its client channel.
pub struct GrpcPlugin {
    name: String,
    binary: PathBuf,
    address: String,
    child: Mutex<Option<Child>>,
    client: Mutex<PluginServiceClient<Channel>>,
}

impl GrpcPlugin {
    /// Launches `<binary> serve`, reads the handshake and dials the
    /// announced address.
    pub async fn launch(name: &str, binary: &Path) -> Result<Self, PluginError> {
        let mut child = Command::new(binary)
            .arg("serve")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PluginError::HandshakeFailed {
                name: name.to_string(),
                reason: format!("cannot spawn '{}': {err}", binary.display()),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| PluginError::HandshakeFailed {
            name: name.to_string(),
            reason: "no stdout pipe".into(),
        })?;

        let mut lines = BufReader::new(stdout).lines();
        let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| PluginError::HandshakeFailed {
                name: name.to_string(),
                reason: format!("no handshake within {HANDSHAKE_TIMEOUT:?}"),
            })?
            .map_err(|err| PluginError::HandshakeFailed {
                name: name.to_string(),
                reason: format!("cannot read handshake: {err}"),
            })?
            .ok_or_else(|| PluginError::HandshakeFailed {
                name: name.to_string(),
                reason: "plugin exited before the handshake".into(),
            })?;

        let address = parse_handshake(name, line.trim())?;
        debug!(plugin = %name, address = %address, "plugin handshake complete");

        let endpoint = format!("http://{address}");
        let client = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            PluginServiceClient::connect(endpoint),
        )
        .await
        .map_err(|_| PluginError::HandshakeFailed {
            name: name.to_string(),
            reason: format!("dial timed out after {HANDSHAKE_TIMEOUT:?}"),
        })?
        .map_err(|err| PluginError::HandshakeFailed {
            name: name.to_string(),
            reason: format!("cannot dial {address}: {err}"),
        })?;

        Ok(Self {
            name: name.to_string(),
            binary: binary.to_path_buf(),
            address,
            child: Mutex::new(Some(child)),
            client: Mutex::new(client),
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn metadata(&self) -> Result<PluginMetadata, PluginError> {
        let mut client = self.client.lock().await;
        let response = client
            .get_metadata(proto::Empty {})
            .await
            .map_err(|status| self.rpc_error("GetMetadata", status))?;
        Ok(corynth_protocol::proto_to_metadata(response.into_inner()))
    }

    pub async fn actions(&self) -> Result<HashMap<String, ActionSpec>, PluginError> {
        let mut client = self.client.lock().await;
        let response = client
            .get_actions(proto::Empty {})
            .await
            .map_err(|status| self.rpc_error("GetActions", status))?;
        Ok(corynth_protocol::proto_to_actions(response.into_inner()))
    }

    pub async fn validate(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> Result<(), PluginError> {
        let request = proto::ValidateRequest {
            action: action.to_string(),
            params: Some(corynth_protocol::params_to_proto(params)),
        };
        let mut client = self.client.lock().await;
        let response = client
            .validate_params(request)
            .await
            .map_err(|status| self.rpc_error("ValidateParams", status))?
            .into_inner();
        if response.valid {
            Ok(())
        } else {
            Err(PluginError::ValidationFailed {
                name: self.name.clone(),
                action: action.to_string(),
                reason: response.error,
            })
        }
    }

    /// Executes an action. On timeout or cancellation the RPC is aborted
    /// and the process killed, per the serve contract.
    pub async fn execute(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>, PluginError> {
        let request = proto::ExecuteRequest {
            action: action.to_string(),
            params: Some(corynth_protocol::params_to_proto(params)),
        };

        let response = {
            let mut client = self.client.lock().await;
            tokio::select! {
                response = client.execute(request) => {
                    response.map_err(|status| self.rpc_error("Execute", status))?
                }
                _ = tokio::time::sleep(timeout) => {
                    drop(client);
                    self.shutdown().await;
                    return Err(PluginError::Timeout {
                        name: self.name.clone(),
                        timeout,
                    });
                }
                _ = wait_cancelled(&mut cancel) => {
                    drop(client);
                    self.shutdown().await;
                    return Err(PluginError::ActionFailed {
                        name: self.name.clone(),
                        action: action.to_string(),
                        message: "invocation cancelled".into(),
                    });
                }
            }
        };

        let response = response.into_inner();
        if !response.error.is_empty() {
            return Err(PluginError::ActionFailed {
                name: self.name.clone(),
                action: action.to_string(),
                message: response.error,
            });
        }
        Ok(response
            .outputs
            .as_ref()
            .map(corynth_protocol::proto_to_params)
            .unwrap_or_default())
    }

    pub async fn health(&self) -> Result<(), PluginError> {
        let mut client = self.client.lock().await;
        let response = client
            .health(proto::Empty {})
            .await
            .map_err(|status| self.rpc_error("Health", status))?
            .into_inner();
        if response.healthy {
            Ok(())
        } else {
            Err(PluginError::HealthCheckFailed {
                name: self.name.clone(),
                reason: response.message,
            })
        }
    }

    /// Terminates the serving process.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.start_kill() {
                warn!(plugin = %self.name, error = %err, "failed to kill plugin process");
            }
            let _ = child.wait().await;
        }
    }

    fn rpc_error(&self, method: &str, status: tonic::Status) -> PluginError {
        PluginError::ProtocolError {
            name: self.name.clone(),
            reason: format!("{method} failed: {status}"),
        }
    }
}

impl Drop for GrpcPlugin {
    fn drop(&mut self) {
        // kill_on_drop on the child covers the non-graceful path.
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
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

/// Parses `<proto>|<plugin>|tcp|<host>:<port>|grpc`.
fn parse_handshake(name: &str, line: &str) -> Result<String, PluginError> {
    let fail = |reason: String| PluginError::HandshakeFailed {
        name: name.to_string(),
        reason,
    };

    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 5 {
        return Err(fail(format!("malformed handshake '{line}'")));
    }

    let protocol: u32 = parts[0]
        .parse()
        .map_err(|_| fail(format!("bad protocol version '{}'", parts[0])))?;
    if protocol != PROTOCOL_VERSION {
        return Err(fail(format!(
            "unsupported protocol version {protocol} (expected {PROTOCOL_VERSION})"
        )));
    }
    parts[1]
        .parse::<u32>()
        .map_err(|_| fail(format!("bad plugin version '{}'", parts[1])))?;
    if parts[2] != "tcp" {
        return Err(fail(format!("unsupported network '{}'", parts[2])));
    }
    if parts[4] != "grpc" {
        return Err(fail(format!("unsupported protocol '{}'", parts[4])));
    }

    let address = parts[3];
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| fail(format!("address '{address}' is not host:port")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(fail(format!("address '{address}' is not host:port")));
    }

    Ok(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_handshake() {
        let address = parse_handshake("x", "1|1|tcp|127.0.0.1:54321|grpc").unwrap();
        assert_eq!(address, "127.0.0.1:54321");
    }

    #[test]
    fn test_reject_wrong_protocol_version() {
        let err = parse_handshake("x", "2|1|tcp|127.0.0.1:54321|grpc").unwrap_err();
        assert!(err.to_string().contains("protocol version"));
    }

    #[test]
    fn test_reject_malformed_lines() {
        for line in [
            "",
            "1|1|tcp|127.0.0.1:54321",
            "1|1|udp|127.0.0.1:54321|grpc",
            "1|1|tcp|127.0.0.1:54321|http",
            "1|1|tcp|nocolon|grpc",
            "1|1|tcp|:99|grpc",
            "one|1|tcp|127.0.0.1:1|grpc",
        ] {
            assert!(
                parse_handshake("x", line).is_err(),
                "should reject '{line}'"
            );
        }
    }

    #[test]
    fn test_high_port_parses() {
        assert!(parse_handshake("x", "1|1|tcp|localhost:65535|grpc").is_ok());
        assert!(parse_handshake("x", "1|1|tcp|localhost:65536|grpc").is_err());
    }
}
