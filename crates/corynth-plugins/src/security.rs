// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Artifact verification for installed plugins: size bounds, SHA-256
//! checksums and trust levels from an optional `registry.json` catalog.

use corynth_core::PluginError;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Smallest plausible plugin artifact.
pub const MIN_ARTIFACT_SIZE: u64 = 1024;
/// Largest accepted plugin artifact.
pub const MAX_ARTIFACT_SIZE: u64 = 100 * 1024 * 1024;

/// Trust levels a catalog may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Official,
    Verified,
    Community,
}

/// One catalog entry for a plugin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogEntry {
    pub trust_level: Option<TrustLevel>,
    /// Hex-encoded SHA-256 of the artifact.
    pub sha256: Option<String>,
    /// Set by repository scans; a flagged plugin is rejected outright.
    #[serde(default)]
    pub threat: bool,
}

/// Parsed `registry.json` plugin catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryCatalog {
    #[serde(default)]
    pub plugins: HashMap<String, CatalogEntry>,
}

impl RegistryCatalog {
    /// Loads a catalog from a repository checkout, if present.
    pub fn load(repo_dir: &Path) -> Option<Self> {
        let path = repo_dir.join("registry.json");
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(catalog) => Some(catalog),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed registry.json");
                None
            }
        }
    }
}

/// Verification policy applied to every fetched artifact.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    pub catalog: Option<RegistryCatalog>,
}

impl SecurityPolicy {
    pub fn with_catalog(catalog: Option<RegistryCatalog>) -> Self {
        Self { catalog }
    }

    /// Verifies an artifact before it is installed. Size bounds and threat
    /// markers are hard failures; checksum mismatch is a hard failure;
    /// unknown or unverified plugins proceed with a warning.
    pub fn verify(&self, name: &str, artifact: &Path) -> Result<(), PluginError> {
        let size = std::fs::metadata(artifact)
            .map_err(|err| PluginError::InstallFailed {
                name: name.to_string(),
                reason: format!("cannot stat artifact: {err}"),
            })?
            .len();

        if size < MIN_ARTIFACT_SIZE {
            return Err(PluginError::InstallFailed {
                name: name.to_string(),
                reason: format!("artifact is {size} bytes, below the {MIN_ARTIFACT_SIZE} byte minimum"),
            });
        }
        if size > MAX_ARTIFACT_SIZE {
            return Err(PluginError::InstallFailed {
                name: name.to_string(),
                reason: format!("artifact is {size} bytes, above the {MAX_ARTIFACT_SIZE} byte maximum"),
            });
        }

        let entry = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.plugins.get(name));

        match entry {
            Some(entry) => {
                if entry.threat {
                    return Err(PluginError::InstallFailed {
                        name: name.to_string(),
                        reason: "catalog marks this plugin as a threat".to_string(),
                    });
                }
                if let Some(expected) = &entry.sha256 {
                    let actual = sha256_file(name, artifact)?;
                    if !actual.eq_ignore_ascii_case(expected) {
                        return Err(PluginError::InstallFailed {
                            name: name.to_string(),
                            reason: format!(
                                "checksum mismatch: expected {expected}, computed {actual}"
                            ),
                        });
                    }
                }
                match entry.trust_level {
                    Some(TrustLevel::Official) | Some(TrustLevel::Verified) => {}
                    Some(TrustLevel::Community) => {
                        warn!(plugin = %name, "installing community plugin");
                    }
                    None => {
                        warn!(plugin = %name, "catalog entry has no trust level");
                    }
                }
            }
            None => {
                warn!(plugin = %name, "plugin not present in any catalog, proceeding unverified");
            }
        }

        Ok(())
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(name: &str, path: &Path) -> Result<String, PluginError> {
    let bytes = std::fs::read(path).map_err(|err| PluginError::InstallFailed {
        name: name.to_string(),
        reason: format!("cannot read artifact for hashing: {err}"),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact(dir: &Path, size: usize) -> std::path::PathBuf {
        let path = dir.join("corynth-plugin-test");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0x42u8; size]).unwrap();
        path
    }

    #[test]
    fn test_size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SecurityPolicy::default();

        let small = artifact(dir.path(), 10);
        assert!(policy.verify("test", &small).is_err());

        let fine = artifact(dir.path(), 4096);
        assert!(policy.verify("test", &fine).is_ok());
    }

    #[test]
    fn test_checksum_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), 2048);
        let good = sha256_file("test", &path).unwrap();

        let mut catalog = RegistryCatalog::default();
        catalog.plugins.insert(
            "test".to_string(),
            CatalogEntry {
                trust_level: Some(TrustLevel::Official),
                sha256: Some(good.clone()),
                threat: false,
            },
        );
        let policy = SecurityPolicy::with_catalog(Some(catalog.clone()));
        assert!(policy.verify("test", &path).is_ok());

        catalog.plugins.get_mut("test").unwrap().sha256 =
            Some("deadbeef".repeat(8));
        let policy = SecurityPolicy::with_catalog(Some(catalog));
        let err = policy.verify("test", &path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_threat_marker_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), 2048);

        let mut catalog = RegistryCatalog::default();
        catalog.plugins.insert(
            "test".to_string(),
            CatalogEntry {
                trust_level: Some(TrustLevel::Community),
                sha256: None,
                threat: true,
            },
        );
        let policy = SecurityPolicy::with_catalog(Some(catalog));
        assert!(policy.verify("test", &path).is_err());
    }

    #[test]
    fn test_catalog_parse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("registry.json"),
            r#"{"plugins":{"http":{"trust_level":"official","sha256":"abc123"}}}"#,
        )
        .unwrap();

        let catalog = RegistryCatalog::load(dir.path()).unwrap();
        assert_eq!(
            catalog.plugins["http"].trust_level,
            Some(TrustLevel::Official)
        );
        assert!(RegistryCatalog::load(&dir.path().join("nope")).is_none());
    }
}
