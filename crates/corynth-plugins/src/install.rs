// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remote plugin installation.
//!
//! Unknown plugin names are fetched from a ranked list of Git repositories.
//! Each repository is cloned (or fast-forwarded) into the cache, searched
//! for an artifact in priority order — native `<name>-plugin-<os>-<arch>`
//! binary, `plugin` wrapper script, generic `<name>-plugin` binary, Go
//! source — and the artifact is verified, copied into the plugins
//! directory as `corynth-plugin-<name>` and health-probed. A failing
//! artifact is removed and the next repository tried.

use crate::security::{RegistryCatalog, SecurityPolicy};
use crate::transport::StdioPlugin;
use corynth_core::config::{PluginsConfig, RepositoryConfig};
use corynth_core::PluginError;
use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct PluginInstaller {
    repositories: Vec<RepositoryConfig>,
    cache_dir: PathBuf,
    plugins_dir: PathBuf,
    cache_ttl: std::time::Duration,
}

impl PluginInstaller {
    pub fn new(config: &PluginsConfig) -> Self {
        Self {
            repositories: config.repositories.clone(),
            cache_dir: config.cache.path.clone(),
            plugins_dir: config.local_path.clone(),
            cache_ttl: std::time::Duration::from_secs(config.cache.ttl_seconds),
        }
    }

    /// Installs a plugin, returning the path of the installed artifact.
    /// A healthy existing artifact makes this a filesystem no-op.
    pub async fn install(&self, name: &str) -> Result<PathBuf, PluginError> {
        let destination = self.plugins_dir.join(format!("corynth-plugin-{name}"));

        if destination.exists() {
            if StdioPlugin::new(name, &destination).metadata().await.is_ok() {
                debug!(plugin = %name, "healthy artifact already installed");
                return Ok(destination);
            }
            warn!(plugin = %name, "existing artifact fails health check, reinstalling");
            let _ = std::fs::remove_file(&destination);
        }

        if self.repositories.is_empty() {
            return Err(PluginError::NotFound(name.to_string()));
        }

        let mut repositories = self.repositories.clone();
        repositories.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut last_error: Option<PluginError> = None;
        for repo in &repositories {
            let checkout = match self.sync_repository(name, repo).await {
                Ok(checkout) => checkout,
                Err(err) => {
                    warn!(repo = %repo.name, error = %err, "repository sync failed");
                    last_error = Some(err);
                    continue;
                }
            };

            let policy = SecurityPolicy::with_catalog(RegistryCatalog::load(&checkout));
            match self
                .install_from_checkout(name, &checkout, &policy, &destination)
                .await
            {
                Ok(path) => {
                    info!(plugin = %name, repo = %repo.name, "plugin installed");
                    return Ok(path);
                }
                Err(err) => {
                    warn!(
                        plugin = %name,
                        repo = %repo.name,
                        error = %err,
                        "installation from repository failed, trying next"
                    );
                    let _ = std::fs::remove_file(&destination);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PluginError::NotFound(name.to_string())))
    }

    /// Clones or updates the repository checkout in the cache.
    async fn sync_repository(
        &self,
        plugin: &str,
        repo: &RepositoryConfig,
    ) -> Result<PathBuf, PluginError> {
        let checkout = self.cache_dir.join("repos").join(&repo.name);
        let plugin_name = plugin.to_string();
        let task_plugin = plugin_name.clone();
        let repo = repo.clone();
        let ttl = self.cache_ttl;

        tokio::task::spawn_blocking(move || {
            sync_repository_blocking(&task_plugin, &repo, &checkout, ttl)
        })
        .await
            .map_err(|err| PluginError::FetchFailed {
                name: plugin_name,
                reason: format!("sync task failed: {err}"),
            })?
    }

    async fn install_from_checkout(
        &self,
        name: &str,
        checkout: &Path,
        policy: &SecurityPolicy,
        destination: &Path,
    ) -> Result<PathBuf, PluginError> {
        let artifact = self.locate_artifact(name, checkout).await?;
        policy.verify(name, &artifact)?;

        std::fs::create_dir_all(&self.plugins_dir).map_err(|err| {
            PluginError::InstallFailed {
                name: name.to_string(),
                reason: format!("cannot create plugins directory: {err}"),
            }
        })?;
        std::fs::copy(&artifact, destination).map_err(|err| PluginError::InstallFailed {
            name: name.to_string(),
            reason: format!("cannot copy artifact: {err}"),
        })?;
        make_executable(name, destination)?;

        // The metadata probe doubles as the post-install health check.
        StdioPlugin::new(name, destination)
            .metadata()
            .await
            .map_err(|err| PluginError::HealthCheckFailed {
                name: name.to_string(),
                reason: err.to_string(),
            })?;

        Ok(destination.to_path_buf())
    }

    /// Searches the checkout for an artifact in priority order.
    async fn locate_artifact(&self, name: &str, checkout: &Path) -> Result<PathBuf, PluginError> {
        let base = checkout.join("official").join(name);
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;

        let candidates = [
            base.join(format!("{name}-plugin-{os}-{arch}")),
            base.join("plugin"),
            base.join(format!("{name}-plugin")),
        ];
        for candidate in &candidates {
            if candidate.is_file() {
                debug!(artifact = %candidate.display(), "found plugin artifact");
                return Ok(candidate.clone());
            }
        }

        for source in [base.join("plugin.go"), base.join(format!("{name}.go"))] {
            if source.is_file() {
                return self.build_go_source(name, &source).await;
            }
        }

        Err(PluginError::NotFound(name.to_string()))
    }

    /// Builds a Go source fallback into the cache.
    async fn build_go_source(&self, name: &str, source: &Path) -> Result<PathBuf, PluginError> {
        let out_dir = self.cache_dir.join("build");
        std::fs::create_dir_all(&out_dir).map_err(|err| PluginError::BuildFailed {
            name: name.to_string(),
            reason: format!("cannot create build directory: {err}"),
        })?;
        let output_path = out_dir.join(format!("corynth-plugin-{name}"));

        info!(plugin = %name, source = %source.display(), "building plugin from source");
        let output = tokio::process::Command::new("go")
            .arg("build")
            .arg("-o")
            .arg(&output_path)
            .arg(source)
            .output()
            .await
            .map_err(|err| PluginError::BuildFailed {
                name: name.to_string(),
                reason: format!("go toolchain unavailable: {err}"),
            })?;

        if !output.status.success() {
            return Err(PluginError::BuildFailed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output_path)
    }
}

fn sync_repository_blocking(
    plugin: &str,
    repo: &RepositoryConfig,
    checkout: &Path,
    ttl: std::time::Duration,
) -> Result<PathBuf, PluginError> {
    let fetch_failed = |reason: String| PluginError::FetchFailed {
        name: plugin.to_string(),
        reason,
    };

    if checkout.join(".git").exists() {
        if checkout_age(checkout).is_some_and(|age| age < ttl) {
            debug!(repo = %repo.name, "cached checkout within ttl, skipping fetch");
            return Ok(checkout.to_path_buf());
        }
        let repository = Repository::open(checkout)
            .map_err(|err| fetch_failed(format!("cannot open cached checkout: {err}")))?;
        match fast_forward(&repository, repo) {
            Ok(()) => {}
            Err(err) => {
                // A stale cache is still usable when the remote is down.
                warn!(repo = %repo.name, error = %err, "fetch failed, using cached checkout");
            }
        }
        return Ok(checkout.to_path_buf());
    }

    if let Some(parent) = checkout.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| fetch_failed(format!("cannot create cache directory: {err}")))?;
    }

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(auth_callbacks(repo));
    let result = RepoBuilder::new()
        .branch(&repo.branch)
        .fetch_options(fetch_options)
        .clone(&repo.url, checkout);

    match result {
        Ok(_) => Ok(checkout.to_path_buf()),
        Err(branch_err) => {
            // The configured branch may not exist; fall back to the
            // repository default.
            let _ = std::fs::remove_dir_all(checkout);
            let mut fetch_options = FetchOptions::new();
            fetch_options.remote_callbacks(auth_callbacks(repo));
            RepoBuilder::new()
                .fetch_options(fetch_options)
                .clone(&repo.url, checkout)
                .map_err(|err| {
                    fetch_failed(format!(
                        "clone failed: {err} (branch '{}': {branch_err})",
                        repo.branch
                    ))
                })?;
            Ok(checkout.to_path_buf())
        }
    }
}

/// Time since the checkout's `.git` directory was last touched by a fetch.
fn checkout_age(checkout: &Path) -> Option<std::time::Duration> {
    let modified = std::fs::metadata(checkout.join(".git"))
        .and_then(|meta| meta.modified())
        .ok()?;
    modified.elapsed().ok()
}

fn fast_forward(repository: &Repository, repo: &RepositoryConfig) -> Result<(), git2::Error> {
    let mut remote = repository.find_remote("origin")?;
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(auth_callbacks(repo));
    remote.fetch(&[repo.branch.as_str()], Some(&mut fetch_options), None)?;

    let fetch_head = repository.find_reference("FETCH_HEAD")?;
    let commit = fetch_head.peel_to_commit()?;
    repository.reset(commit.as_object(), git2::ResetType::Hard, None)?;
    Ok(())
}

/// Credentials: a configured token env var, then the generic
/// `CORYNTH_GIT_USERNAME` / `CORYNTH_GIT_PASSWORD` pair, then anonymous.
fn auth_callbacks(repo: &RepositoryConfig) -> RemoteCallbacks<'static> {
    let token_env = repo.token_env.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username, _allowed| {
        if let Some(env) = &token_env {
            if let Ok(token) = std::env::var(env) {
                return Cred::userpass_plaintext(&token, "");
            }
        }
        if let (Ok(user), Ok(password)) = (
            std::env::var("CORYNTH_GIT_USERNAME"),
            std::env::var("CORYNTH_GIT_PASSWORD"),
        ) {
            return Cred::userpass_plaintext(&user, &password);
        }
        Cred::username(username.unwrap_or("git"))
    });
    callbacks
}

fn make_executable(name: &str, path: &Path) -> Result<(), PluginError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|err| {
            PluginError::InstallFailed {
                name: name.to_string(),
                reason: format!("cannot set execute permission: {err}"),
            }
        })?;
    }
    #[cfg(not(unix))]
    {
        let _ = (name, path);
    }
    Ok(())
}
