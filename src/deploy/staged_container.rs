//! Encrypted container packages
//!
//! Containers cannot be extracted directly. An install attempt goes through
//! these phases, at most one attempt per process at a time:
//!
//! 1. Unregister any existing registration of the family.
//! 2. Stage the container with the package store (bootstrapper mode first,
//!    then once more without it).
//! 3. Find the single staged location of the family.
//! 4. Run a helper inside the package's security context that copies the
//!    protected executable to a temporary name and then renames it. The
//!    helper's exit does not mean the copy is done, so the final name is
//!    polled for with a timeout.
//! 5. Move the staged tree into the install directory and swap in the
//!    decrypted executable.
//! 6. Unregister the now empty staged registration.
//!
//! A failure after step 2 unregisters the staged package again, without a
//! backup, so a retry starts from a clean slate.

use super::app_package::AppPackageBackend;
use super::{PackageSource, PackageSubsystem, PhaseSink, StageOptions};
use crate::config::ContainerConfig;
use crate::guard::{GuardRegistry, OperationKind};
use crate::helper::HelperRunner;
use crate::installer;
use crate::version::InstallPhase;
use crate::{Error, Result};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DECRYPT_HELPER: &str = "powershell.exe";

/// Tunables for the container backend
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Directory for per-attempt decrypted executables
    pub staging_dir: PathBuf,
    pub bootstrapper: bool,
    pub helper_timeout: Duration,
    pub poll_interval: Duration,
    /// Executable inside the package that needs decrypting
    pub executable_name: String,
    /// Application id the helper runs under
    pub app_id: String,
}

impl ContainerSettings {
    pub fn from_config(config: &ContainerConfig, staging_dir: PathBuf) -> Self {
        Self {
            staging_dir,
            bootstrapper: config.bootstrapper,
            helper_timeout: config.helper_timeout(),
            poll_interval: config.poll_interval(),
            executable_name: config.executable_name.clone(),
            app_id: config.app_id.clone(),
        }
    }
}

/// Temporary files of one decrypt attempt
///
/// Every attempt gets a random id so leftovers of a failed attempt never
/// collide with a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArtifact {
    pub attempt_id: String,
    /// Written by the helper while copying
    pub partial: PathBuf,
    /// Appears only once the copy is complete
    pub complete: PathBuf,
}

impl StagingArtifact {
    pub fn new(staging_dir: &Path, executable_name: &str) -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let attempt_id = hex::encode(bytes);
        Self {
            partial: staging_dir.join(format!("{}.{}.partial", executable_name, attempt_id)),
            complete: staging_dir.join(format!("{}.{}", attempt_id, executable_name)),
            attempt_id,
        }
    }

    /// Remove whatever this attempt left behind
    pub fn cleanup(&self) {
        for path in [&self.partial, &self.complete] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

pub struct StagedContainerBackend {
    packages: Arc<dyn PackageSubsystem>,
    app_packages: Arc<AppPackageBackend>,
    helper: Arc<dyn HelperRunner>,
    guards: Arc<GuardRegistry>,
    settings: ContainerSettings,
}

impl StagedContainerBackend {
    pub fn new(
        app_packages: Arc<AppPackageBackend>,
        helper: Arc<dyn HelperRunner>,
        guards: Arc<GuardRegistry>,
        settings: ContainerSettings,
    ) -> Self {
        Self {
            packages: Arc::clone(app_packages.packages()),
            app_packages,
            helper,
            guards,
            settings,
        }
    }

    pub fn app_packages(&self) -> &AppPackageBackend {
        &self.app_packages
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// Install a container into `install_dir`
    ///
    /// Fails with [`Error::StagingInProgress`] right away if another attempt
    /// is running. On failure after files started moving, `install_dir` is
    /// removed again.
    pub async fn install(
        &self,
        source: &PackageSource,
        family: &str,
        install_dir: &Path,
        skip_backup: bool,
        phase: PhaseSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _flag = self.guards.try_acquire(OperationKind::Staging)?;

        tokio::fs::create_dir_all(&self.settings.staging_dir).await?;
        let artifact =
            StagingArtifact::new(&self.settings.staging_dir, &self.settings.executable_name);
        debug!("Container install attempt {}", artifact.attempt_id);

        let result = self
            .run_attempt(source, family, install_dir, skip_backup, &artifact, phase, cancel)
            .await;
        artifact.cleanup();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        source: &PackageSource,
        family: &str,
        install_dir: &Path,
        skip_backup: bool,
        artifact: &StagingArtifact,
        phase: PhaseSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        phase(InstallPhase::Unregistering);
        self.app_packages.unregister(family, skip_backup).await?;
        check_cancelled(cancel)?;

        phase(InstallPhase::Staging);
        self.stage(source).await?;

        if let Err(e) = self.unpack_staged(family, install_dir, artifact, phase, cancel).await {
            // The saved data was moved away before staging, so the staged
            // registration can go without another backup
            warn!("Removing staged registration of {} after failure", family);
            if let Err(cleanup) = self.app_packages.unregister(family, true).await {
                warn!("Failed to remove staged registration: {}", cleanup);
            }
            return Err(e);
        }

        phase(InstallPhase::CleaningUp);
        self.app_packages.unregister(family, true).await?;
        info!("Container installed to {}", install_dir.display());
        Ok(())
    }

    async fn unpack_staged(
        &self,
        family: &str,
        install_dir: &Path,
        artifact: &StagingArtifact,
        phase: PhaseSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_cancelled(cancel)?;
        let staged = self.locate(family)?;

        phase(InstallPhase::Decrypting);
        let staged = resolve_real_path(&staged).await?;
        self.decrypt(family, &staged, artifact, cancel).await?;

        phase(InstallPhase::Moving);
        if let Err(e) = self.move_into_place(&staged, install_dir, artifact).await {
            if install_dir.exists() {
                warn!(
                    "Removing partially populated {} after failed move",
                    install_dir.display()
                );
                if let Err(cleanup) = tokio::fs::remove_dir_all(install_dir).await {
                    warn!("Failed to remove {}: {}", install_dir.display(), cleanup);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stage with the bootstrapper when enabled, retrying once without it
    pub async fn stage(&self, source: &PackageSource) -> Result<()> {
        let first = StageOptions {
            bootstrapper: self.settings.bootstrapper,
        };
        info!("Staging {} (bootstrapper: {})", source.uri(), first.bootstrapper);

        let result = match self.packages.stage(source, first).await {
            Err(e) if first.bootstrapper && !e.is_cancelled() => {
                warn!("Staging with bootstrapper failed ({}), retrying without it", e);
                self.packages
                    .stage(source, StageOptions { bootstrapper: false })
                    .await
            }
            other => other,
        };

        result.map_err(|e| match e {
            Error::Deployment(text) => Error::StagingFailed(text),
            other => other,
        })
    }

    /// The one staged location of `family`
    pub fn locate(&self, family: &str) -> Result<PathBuf> {
        let mut locations: Vec<PathBuf> = self
            .packages
            .find_packages(family)?
            .into_iter()
            .filter_map(|p| p.install_location)
            .collect();

        match locations.len() {
            0 => Err(Error::NoStagedLocation(family.to_string())),
            1 => Ok(locations.remove(0)),
            n => {
                warn!("Found {} staged locations for {}: {:?}", n, family, locations);
                Err(Error::MultipleStagedLocations(n, family.to_string()))
            }
        }
    }

    async fn decrypt(
        &self,
        family: &str,
        staged: &Path,
        artifact: &StagingArtifact,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = staged.join(&self.settings.executable_name);
        let args = decrypt_helper_args(
            family,
            &self.settings.app_id,
            &source,
            &artifact.partial,
            &artifact.complete,
        );

        self.helper
            .run(DECRYPT_HELPER, &args, cancel)
            .await?
            .into_result(DECRYPT_HELPER)?;

        wait_for_file(
            &artifact.complete,
            self.settings.helper_timeout,
            self.settings.poll_interval,
            cancel,
        )
        .await
    }

    async fn move_into_place(
        &self,
        staged: &Path,
        install_dir: &Path,
        artifact: &StagingArtifact,
    ) -> Result<()> {
        let staged = staged.to_path_buf();
        let install_dir = install_dir.to_path_buf();
        let decrypted = artifact.complete.clone();
        let executable = self.settings.executable_name.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            if install_dir.exists() {
                std::fs::remove_dir_all(&install_dir)?;
            }
            info!("Moving {} to {}", staged.display(), install_dir.display());
            installer::move_dir(&staged, &install_dir)?;

            let placeholder = install_dir.join(&executable);
            if placeholder.exists() {
                std::fs::remove_file(&placeholder)?;
            }
            installer::move_file(&decrypted, &placeholder)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("Move task failed: {}", e)))?
    }

    /// Start the decrypted executable of an installed container
    pub fn launch(&self, install_dir: &Path) -> Result<()> {
        let executable = install_dir.join(&self.settings.executable_name);
        if !executable.exists() {
            return Err(Error::Other(format!(
                "Executable not found: {}",
                executable.display()
            )));
        }
        self.helper.spawn_detached(&executable, &[])
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Resolve reparse points so the helper gets a plain filesystem path
async fn resolve_real_path(path: &Path) -> Result<PathBuf> {
    let resolved = tokio::fs::canonicalize(path).await?;
    Ok(strip_verbatim_prefix(&resolved))
}

/// `\\?\C:\x` becomes `C:\x` and `\\?\UNC\server\share` becomes `\\server\share`
fn strip_verbatim_prefix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(share) = text.strip_prefix(r"\\?\UNC\") {
        PathBuf::from(format!(r"\\{}", share))
    } else if let Some(local) = text.strip_prefix(r"\\?\") {
        PathBuf::from(local)
    } else {
        path.to_path_buf()
    }
}

/// Arguments that copy `source` to `partial` and rename it to `complete`
/// from inside the package's security context
pub fn decrypt_helper_args(
    family: &str,
    app_id: &str,
    source: &Path,
    partial: &Path,
    complete: &Path,
) -> Vec<String> {
    let copy = format!(
        "/c copy /y \"{}\" \"{}\" && move /y \"{}\" \"{}\"",
        source.display(),
        partial.display(),
        partial.display(),
        complete.display()
    );
    let script = format!(
        "Invoke-CommandInDesktopPackage -PackageFamilyName '{}' -AppId '{}' -Command 'cmd.exe' -Args '{}'",
        family,
        app_id,
        copy.replace('\'', "''")
    );
    vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-Command".to_string(),
        script,
    ]
}

/// Poll until `path` exists, the timeout elapses, or the operation is cancelled
pub async fn wait_for_file(
    path: &Path,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    loop {
        if path.exists() {
            debug!("{} appeared after {:?}", path.display(), started.elapsed());
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(Error::HelperTimeout(timeout.as_secs()));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
