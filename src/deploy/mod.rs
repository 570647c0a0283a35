//! Deployment backends
//!
//! Two packaging formats, two backends:
//!
//! - [`app_package::AppPackageBackend`] extracts archive packages and
//!   registers them in development mode, backing up and restoring saved data
//!   around registration changes.
//! - [`staged_container::StagedContainerBackend`] stages encrypted containers
//!   through the package store, decrypts the executable with a helper and
//!   moves the result into the managed install directory.
//!
//! Both drive the OS through [`PackageSubsystem`]. [`Deployer`] picks the
//! backend for a format so callers never branch on the format themselves.

pub mod app_package;
pub mod staged_container;

use crate::version::{InstallPhase, PackageFormat};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use app_package::{AppPackageBackend, RegisterOutcome};
pub use staged_container::{ContainerSettings, StagedContainerBackend, StagingArtifact};

/// Reports the current phase of a multi-step operation
pub type PhaseSink<'a> = &'a (dyn Fn(InstallPhase) + Send + Sync);

/// Reports work done and, when known, the total amount of work
pub type ProgressSink<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// One registered (or staged) package, as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub full_name: String,
    /// `None` when the OS cannot report a location
    pub install_location: Option<PathBuf>,
    pub development_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    /// Plain removal for the current user
    Default,
    /// Removal for every user account
    ForAllUsers,
    /// Removal that keeps the package's application data
    PreserveApplicationData,
}

/// Where a package to stage comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    Local(PathBuf),
    Remote(String),
}

impl PackageSource {
    /// Location string handed to the OS
    pub fn uri(&self) -> String {
        match self {
            PackageSource::Local(path) => path.display().to_string(),
            PackageSource::Remote(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Stage only what is needed to start, streaming the rest later
    pub bootstrapper: bool,
}

/// The OS package-management surface
#[async_trait]
pub trait PackageSubsystem: Send + Sync {
    /// Packages of a family registered for the current user
    fn find_packages(&self, family: &str) -> Result<Vec<PackageRecord>>;

    /// Register an unpacked package from its manifest in development mode
    async fn register(&self, manifest: &Path) -> Result<()>;

    async fn remove(&self, full_name: &str, mode: RemovalMode) -> Result<()>;

    async fn stage(&self, source: &PackageSource, options: StageOptions) -> Result<()>;

    /// The family's local application data directory
    fn local_state_dir(&self, family: &str) -> Result<PathBuf>;

    /// Activate the family's registered application
    async fn launch(&self, family: &str) -> Result<()>;
}

/// Progress report from an OS deployment operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentProgress {
    pub state: String,
    pub percentage: u32,
}

/// Terminal status of an OS deployment operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Completed,
    Canceled,
    Error(String),
}

/// Callback half of a deployment bridge
///
/// The OS calls `on_progress` any number of times and `on_completed` once.
/// Only the first completion is delivered; later ones are ignored.
#[derive(Clone)]
pub struct DeploymentHooks {
    operation: Arc<str>,
    sender: Arc<Mutex<Option<oneshot::Sender<DeploymentStatus>>>>,
}

impl DeploymentHooks {
    pub fn on_progress(&self, progress: DeploymentProgress) {
        debug!(
            "Deployment progress ({}): {} {}%",
            self.operation, progress.state, progress.percentage
        );
    }

    pub fn on_completed(&self, status: DeploymentStatus) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(sender) => {
                debug!("Deployment done ({}): {:?}", self.operation, status);
                if sender.send(status).is_err() {
                    debug!("Nobody is waiting for {} any more", self.operation);
                }
            }
            None => warn!(
                "Ignoring repeated completion for {}: {:?}",
                self.operation, status
            ),
        }
    }
}

/// Awaitable half of a deployment bridge
pub struct DeploymentCompletion {
    operation: Arc<str>,
    receiver: oneshot::Receiver<DeploymentStatus>,
}

impl DeploymentCompletion {
    /// Wait for the operation's single terminal status
    pub async fn wait(self) -> Result<()> {
        match self.receiver.await {
            Ok(DeploymentStatus::Completed) => Ok(()),
            Ok(DeploymentStatus::Canceled) => Err(Error::Cancelled),
            Ok(DeploymentStatus::Error(text)) => {
                warn!("Deployment failed ({}): {}", self.operation, text);
                Err(Error::Deployment(text))
            }
            Err(_) => Err(Error::Deployment(format!(
                "{} finished without reporting a result",
                self.operation
            ))),
        }
    }
}

/// Bridge an OS progress/completion callback pair into one awaitable result
pub fn deployment_bridge(operation: &str) -> (DeploymentHooks, DeploymentCompletion) {
    let operation: Arc<str> = Arc::from(operation);
    let (sender, receiver) = oneshot::channel();
    (
        DeploymentHooks {
            operation: Arc::clone(&operation),
            sender: Arc::new(Mutex::new(Some(sender))),
        },
        DeploymentCompletion {
            operation,
            receiver,
        },
    )
}

/// The backend responsible for one package format
#[derive(Clone, Copy)]
pub enum Deployer<'a> {
    Archive(&'a AppPackageBackend),
    Container(&'a StagedContainerBackend),
}

impl Deployer<'_> {
    pub fn format(&self) -> PackageFormat {
        match self {
            Deployer::Archive(_) => PackageFormat::Archive,
            Deployer::Container(_) => PackageFormat::Container,
        }
    }

    /// Turn a fetched package into a populated install directory
    ///
    /// `skip_backup` is passed on to the container backend's unregister step
    /// and must be set when an earlier attempt already moved the saved data.
    pub async fn install(
        &self,
        source: &PackageSource,
        family: &str,
        install_dir: &Path,
        skip_backup: bool,
        phase: PhaseSink<'_>,
        progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            Deployer::Archive(backend) => match source {
                PackageSource::Local(archive) => {
                    phase(InstallPhase::Extracting);
                    backend.install(archive, install_dir, progress).await
                }
                PackageSource::Remote(url) => Err(Error::Unsupported(format!(
                    "archive packages must be downloaded before install ({})",
                    url
                ))),
            },
            Deployer::Container(backend) => {
                backend
                    .install(source, family, install_dir, skip_backup, phase, cancel)
                    .await
            }
        }
    }

    /// Make an installed directory runnable
    pub async fn activate(
        &self,
        install_dir: &Path,
        family: &str,
        phase: PhaseSink<'_>,
    ) -> Result<()> {
        match self {
            Deployer::Archive(backend) => {
                phase(InstallPhase::Registering);
                backend.register(install_dir, family).await.map(|_| ())
            }
            Deployer::Container(_) => Ok(()),
        }
    }

    pub async fn launch(&self, install_dir: &Path, family: &str) -> Result<()> {
        match self {
            Deployer::Archive(backend) => backend.launch(family).await,
            Deployer::Container(backend) => backend.launch(install_dir),
        }
    }

    /// Unregister whatever points at `install_dir` and delete it
    pub async fn uninstall(
        &self,
        install_dir: &Path,
        family: &str,
        phase: PhaseSink<'_>,
    ) -> Result<()> {
        let app_packages = match self {
            Deployer::Archive(backend) => *backend,
            Deployer::Container(backend) => backend.app_packages(),
        };
        phase(InstallPhase::Unregistering);
        app_packages.unregister_at(family, install_dir).await?;

        phase(InstallPhase::CleaningUp);
        if install_dir.exists() {
            tokio::fs::remove_dir_all(install_dir).await?;
        }
        Ok(())
    }
}
