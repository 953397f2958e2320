// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! State persistence backends for Corynth executions.
//!
//! Implements the `corynth_core::StateStore` seam twice: a local
//! single-file backend with atomic rewrites, and (behind the `s3`
//! feature) a remote object store backend with advisory locking.

mod envelope;
pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

pub use envelope::{StateEnvelope, STATE_VERSION};
pub use local::{LocalStateStore, MAX_EXECUTIONS, STATE_FILE};
#[cfg(feature = "s3")]
pub use s3::{S3Config, S3StateStore};

use corynth_core::config::{Config, StateBackend};
use corynth_core::{StateError, StateStoreRef};
use std::sync::Arc;

/// Builds the configured state store.
pub async fn open_store(config: &Config) -> Result<StateStoreRef, StateError> {
    match config.state.backend {
        StateBackend::Local => Ok(Arc::new(LocalStateStore::new(&config.state.state_dir)?)),
        #[cfg(feature = "s3")]
        StateBackend::S3 => {
            let s3_config = S3Config::from_map(&config.state.backend_config)?;
            Ok(Arc::new(S3StateStore::connect(s3_config).await))
        }
        #[cfg(not(feature = "s3"))]
        StateBackend::S3 => Err(StateError::Backend(
            "this build does not include the s3 backend (enable the `s3` feature)".into(),
        )),
    }
}
