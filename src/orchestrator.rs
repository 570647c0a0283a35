//! Per-version install, launch and removal sequences
//!
//! [`Launcher`] is what a front end talks to. Every entry point attaches an
//! [`InstallState`](crate::version::InstallState) to the version for as long
//! as it runs and clears it on every exit path. Failures are reported to the
//! [`Operator`] once, as a single message, and then returned; cancellation
//! is returned but never reported.
//!
//! Registration changes (register, unregister, backup, restore, staging) are
//! serialized through one lock so a backup of a family's data never runs
//! alongside a registration of the same family.

use crate::config::Config;
use crate::deploy::{
    AppPackageBackend, ContainerSettings, Deployer, PackageSource, PackageSubsystem,
    StagedContainerBackend,
};
use crate::guard::{GuardRegistry, OperationKind};
use crate::helper::{HelperRunner, TokioHelperRunner};
use crate::installer::{self, MANIFEST_FILE};
use crate::migration::{self, MigrationPlan, SaveDataLayout};
use crate::operator::Operator;
use crate::protocol::ProtocolClient;
use crate::token::{self, TokenSource, UserAuthorization};
use crate::transfer::VersionDownloader;
use crate::version::{
    parse_install_dir_name, sanitize_file_name, Channel, InstallPhase, PackageFormat,
    StateGuard, VersionDescriptor,
};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How far the streaming install got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamingOutcome {
    Installed,
    NotAttempted,
    /// `cleared` is set once the previous registration and its saved data
    /// were already moved out of the way
    Failed { cleared: bool },
}

pub struct Launcher {
    config: Config,
    operator: Arc<dyn Operator>,
    authorization: Arc<UserAuthorization>,
    anonymous: VersionDownloader,
    user: VersionDownloader,
    app_packages: Arc<AppPackageBackend>,
    containers: StagedContainerBackend,
    guards: Arc<GuardRegistry>,
    deploy_lock: Mutex<()>,
}

impl Launcher {
    /// Launcher wired to the running OS and the configured token helper
    pub fn from_config(config: Config, operator: Arc<dyn Operator>) -> Result<Self> {
        let packages = crate::platform::system_package_subsystem()?;
        let token_source = token::source_from_config(&config);
        Self::new(
            config,
            packages,
            Arc::new(TokioHelperRunner),
            token_source,
            operator,
        )
    }

    pub fn new(
        config: Config,
        packages: Arc<dyn PackageSubsystem>,
        helper: Arc<dyn HelperRunner>,
        token_source: Arc<dyn TokenSource>,
        operator: Arc<dyn Operator>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("mclauncher/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let protocol = ProtocolClient::new(
            config.protocol.endpoint.clone(),
            config.protocol.url_policy.clone(),
        );
        let authorization = Arc::new(UserAuthorization::new(token_source));

        let anonymous = VersionDownloader::anonymous(http.clone(), protocol.clone())
            .with_inactivity_timeout(config.download.timeout());
        let user = VersionDownloader::user(http, protocol, Arc::clone(&authorization))
            .with_inactivity_timeout(config.download.timeout());

        let app_packages = Arc::new(AppPackageBackend::new(
            packages,
            config.paths.backup_dir.clone(),
            Arc::clone(&operator),
        ));
        let guards = Arc::new(GuardRegistry::new());
        let containers = StagedContainerBackend::new(
            Arc::clone(&app_packages),
            helper,
            Arc::clone(&guards),
            ContainerSettings::from_config(
                &config.container,
                config.paths.decrypt_staging_dir.clone(),
            ),
        );

        Ok(Self {
            config,
            operator,
            authorization,
            anonymous,
            user,
            app_packages,
            containers,
            guards,
            deploy_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn guards(&self) -> &GuardRegistry {
        &self.guards
    }

    /// Describe a catalog version in the managed versions directory
    pub fn catalog_version(
        &self,
        identifier: impl Into<String>,
        name: impl Into<String>,
        channel: Channel,
        format: PackageFormat,
    ) -> VersionDescriptor {
        VersionDescriptor::new(identifier, name, channel, format, &self.config.paths.versions_dir)
    }

    fn deployer(&self, format: PackageFormat) -> Deployer<'_> {
        match format {
            PackageFormat::Archive => Deployer::Archive(&self.app_packages),
            PackageFormat::Container => Deployer::Container(&self.containers),
        }
    }

    fn downloader(&self, channel: Channel) -> &VersionDownloader {
        if channel.requires_user_ticket() {
            &self.user
        } else {
            &self.anonymous
        }
    }

    fn report<T>(&self, title: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_cancelled() {
                debug!("{}: cancelled", title);
            } else {
                warn!("{}: {}", title, e);
                self.operator.notify(title, &e.to_string());
            }
        }
        result
    }

    // ========================================================================
    // Sign in
    // ========================================================================

    /// Run (or join) the one-time user authorization
    pub async fn sign_in(&self) -> Result<()> {
        let result = self
            .authorization
            .ticket()
            .await
            .map(|_| ())
            .map_err(Error::from);
        self.report("Authentication failed", result)
    }

    // ========================================================================
    // Download and install
    // ========================================================================

    /// Fetch a version and install it into its install directory
    pub async fn download(
        &self,
        version: &VersionDescriptor,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = self.download_and_install(version, &cancel).await;
        let result = result.map_err(|e| with_channel_hint(e, version.channel));
        self.report("Download failed", result)
    }

    async fn download_and_install(
        &self,
        version: &VersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = version.begin(InstallPhase::Initializing, Some(cancel.clone()))?;
        let phase = |p: InstallPhase| state.set_phase(p);
        let downloader = self.downloader(version.channel);

        if downloader.is_user() {
            debug!("Waiting for authentication");
            self.authorization.ticket().await?;
            debug!("Authentication complete");
        }

        let skip_backup = match self
            .try_streaming_install(version, downloader, &phase, cancel)
            .await?
        {
            StreamingOutcome::Installed => return Ok(()),
            StreamingOutcome::NotAttempted => false,
            StreamingOutcome::Failed { cleared } => cleared,
        };

        let package = self.download_to_file(version, downloader, &state, cancel).await?;
        let format = installer::sniff_format(&package);
        if format != version.format {
            warn!(
                "{} was declared as {} but the download is {}",
                version.display_name(),
                version.format,
                format
            );
        }
        let package = installer::normalize_extension(&package, format);

        {
            let _serial = self.deploy_lock.lock().await;
            self.deployer(format)
                .install(
                    &PackageSource::Local(package.clone()),
                    version.package_family(),
                    &version.install_dir,
                    skip_backup,
                    &phase,
                    &|done, total| state.set_progress(done, total),
                    cancel,
                )
                .await?;
        }

        if self.config.download.delete_package_after_install {
            debug!("Deleting downloaded package {}", package.display());
            if let Err(e) = tokio::fs::remove_file(&package).await {
                warn!("Failed to delete downloaded package: {}", e);
            }
        } else {
            debug!("Keeping downloaded package {}", package.display());
        }

        info!("Installed {} to {}", version.display_name(), version.install_dir.display());
        Ok(())
    }

    /// Hand a resolved URL straight to the container backend
    ///
    /// Anything but [`StreamingOutcome::Installed`] means the caller falls
    /// back to downloading a file. Only cancellation and errors a retry
    /// cannot fix end the operation here.
    async fn try_streaming_install(
        &self,
        version: &VersionDescriptor,
        downloader: &VersionDownloader,
        phase: &(dyn Fn(InstallPhase) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<StreamingOutcome> {
        if version.format != PackageFormat::Container || !version.source_urls.is_empty() {
            return Ok(StreamingOutcome::NotAttempted);
        }

        let url = match downloader
            .resolve_download_url(&version.identifier, &self.config.protocol.revision, cancel)
            .await
        {
            Ok(url) => url,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!("Could not resolve a streaming URL ({}), downloading instead", e);
                return Ok(StreamingOutcome::NotAttempted);
            }
        };

        info!("Attempting streaming install from {}", url);
        // Staging starts only after the old registration and its saved data
        // were cleared
        let cleared = AtomicBool::new(false);
        let tracking_phase = |p: InstallPhase| {
            if p == InstallPhase::Staging {
                cleared.store(true, Ordering::SeqCst);
            }
            phase(p);
        };

        let _serial = self.deploy_lock.lock().await;
        let result = self
            .containers
            .install(
                &PackageSource::Remote(url),
                version.package_family(),
                &version.install_dir,
                false,
                &tracking_phase,
                cancel,
            )
            .await;
        match result {
            Ok(()) => Ok(StreamingOutcome::Installed),
            Err(e) if e.is_cancelled() || e.requires_operator() => Err(e),
            Err(Error::StagingInProgress) => Err(Error::StagingInProgress),
            Err(e) => {
                warn!("Streaming install failed, falling back to file download: {}", e);
                Ok(StreamingOutcome::Failed {
                    cleared: cleared.load(Ordering::SeqCst),
                })
            }
        }
    }

    async fn download_to_file(
        &self,
        version: &VersionDescriptor,
        downloader: &VersionDownloader,
        state: &StateGuard<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = self.config.paths.downloads_dir.join(format!(
            "{}.{}",
            version.download_file_stem(),
            version.format.extension()
        ));

        let progress = |transferred: u64, total: Option<u64>| {
            if state.phase() != Some(InstallPhase::Downloading) {
                debug!("Actual download started");
                state.set_phase(InstallPhase::Downloading);
            }
            state.set_progress(transferred, total);
        };

        let bytes = if version.source_urls.is_empty() {
            downloader
                .download(
                    &version.identifier,
                    &self.config.protocol.revision,
                    &dest,
                    &progress,
                    cancel,
                )
                .await?
        } else {
            downloader
                .download_first_available(&version.source_urls, &dest, &progress, cancel)
                .await?
        };
        info!("Download complete ({} bytes)", bytes);
        Ok(dest)
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Reconcile saved data, activate and start an installed version
    pub async fn launch(&self, version: &VersionDescriptor) -> Result<()> {
        let result = self.launch_version(version).await;
        self.report("Launch failed", result)
    }

    async fn launch_version(&self, version: &VersionDescriptor) -> Result<()> {
        let _flag = self.guards.try_acquire(OperationKind::Launch)?;
        let state = version.begin(InstallPhase::Initializing, None)?;
        let phase = |p: InstallPhase| state.set_phase(p);

        if !version.is_installed() {
            return Err(Error::Other(format!(
                "{} is not installed ({} does not exist)",
                version.display_name(),
                version.install_dir.display()
            )));
        }

        let family = version.package_family();
        let deployer = self.deployer(version.format);
        let install_dir = std::path::absolute(&version.install_dir)?;
        {
            let _serial = self.deploy_lock.lock().await;

            let layout = SaveDataLayout::new(&self.config, family);
            let candidates = migration::enumerate_candidates(&layout)?;
            let plan = migration::plan(&layout, &candidates, version.format);
            if plan.needs_action() || matches!(plan, MigrationPlan::Conflict(_)) {
                phase(InstallPhase::MovingData);
                migration::apply(&plan, &layout, self.operator.as_ref())?;
            }

            deployer.activate(&install_dir, family, &phase).await?;
        }

        phase(InstallPhase::Launching);
        deployer.launch(&install_dir, family).await?;
        info!("Launched {}", version.display_name());
        Ok(())
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Unregister a version and delete its install directory
    pub async fn remove(&self, version: &VersionDescriptor) -> Result<()> {
        let result = self.remove_version(version).await;
        self.report("Uninstall failed", result)
    }

    async fn remove_version(&self, version: &VersionDescriptor) -> Result<()> {
        let state = version.begin(InstallPhase::Unregistering, None)?;
        let phase = |p: InstallPhase| state.set_phase(p);

        let _serial = self.deploy_lock.lock().await;
        let install_dir = std::path::absolute(&version.install_dir)?;
        self.deployer(version.format)
            .uninstall(&install_dir, version.package_family(), &phase)
            .await?;
        info!("Removed {}", version.display_name());
        Ok(())
    }

    /// Remove every installed version so the store can reinstall the title
    ///
    /// Saved data survives through the backup location. Returns the number
    /// of versions removed; the first failure is returned after every
    /// version was attempted.
    pub async fn cleanup_all(&self, versions: &[VersionDescriptor]) -> Result<usize> {
        info!("Starting uninstall of all versions");
        let mut removed = 0;
        let mut first_error = None;
        for version in versions.iter().filter(|v| v.is_installed()) {
            match self.remove(version).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    // ========================================================================
    // Import
    // ========================================================================

    /// Install a package file from disk as an imported version
    pub async fn import(&self, package: &Path) -> Result<VersionDescriptor> {
        let result = self.import_package(package).await;
        self.report("Import failure", result)
    }

    async fn import_package(&self, package: &Path) -> Result<VersionDescriptor> {
        if !package.is_file() {
            return Err(Error::Other(format!(
                "Package file not found: {}",
                package.display()
            )));
        }

        let stem = package
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = sanitize_file_name(&stem);
        let declared = match package.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("msixvc") => PackageFormat::Container,
            _ => PackageFormat::Archive,
        };

        let directory = self.config.paths.imported_dir.join(&name);
        let version = VersionDescriptor::imported(name, declared, directory);
        self.ensure_import_target_usable(&version).await?;

        let state = version.begin(InstallPhase::Initializing, None)?;
        let phase = |p: InstallPhase| state.set_phase(p);
        let source = PackageSource::Local(package.to_path_buf());
        let cancel = CancellationToken::new();

        let result = {
            let _serial = self.deploy_lock.lock().await;
            self.deployer(declared)
                .install(
                    &source,
                    version.package_family(),
                    &version.install_dir,
                    false,
                    &phase,
                    &|done, total| state.set_progress(done, total),
                    &cancel,
                )
                .await
        };
        drop(state);

        match result {
            Ok(()) => {
                info!("Imported {} to {}", package.display(), version.install_dir.display());
                Ok(version)
            }
            Err(Error::Zip(e)) => Err(Error::Other(format!(
                "Failed to import {}. It may be corrupted or not a package file.\n\n\
                 Extraction error: {}",
                package.display(),
                e
            ))),
            Err(e) => Err(e),
        }
    }

    /// Make sure importing into the version's directory destroys nothing
    ///
    /// A directory holding a previous import is removed after the operator
    /// confirms. Anything else there aborts the import.
    async fn ensure_import_target_usable(&self, version: &VersionDescriptor) -> Result<()> {
        let directory = &version.install_dir;
        if !directory.exists() {
            return Ok(());
        }

        let previous_format = installed_format(directory, &self.config.container.executable_name)
            .ok_or_else(|| Error::ImportTargetExists(directory.clone()))?;

        let question = "A version with the same name was already imported. \
                        Do you want to delete it?";
        if !self.operator.confirm("Delete Confirmation", question) {
            return Err(Error::ImportTargetExists(directory.clone()));
        }

        let previous =
            VersionDescriptor::imported(version.name.clone(), previous_format, directory.clone());
        self.remove_version(&previous).await
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Versions currently present in the managed and imported directories
    pub fn installed_versions(&self) -> Result<Vec<VersionDescriptor>> {
        let mut versions = Vec::new();

        for dir in read_subdirs(&self.config.paths.versions_dir)? {
            let Some(dir_name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_install_dir_name(dir_name) {
                Some((channel, name, format)) => versions.push(VersionDescriptor::with_install_dir(
                    crate::version::UNKNOWN_IDENTIFIER,
                    name,
                    channel,
                    format,
                    dir,
                )),
                None => debug!("Ignoring unmanaged directory {}", dir.display()),
            }
        }

        for dir in read_subdirs(&self.config.paths.imported_dir)? {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let format = installed_format(&dir, &self.config.container.executable_name)
                .unwrap_or(PackageFormat::Archive);
            versions.push(VersionDescriptor::imported(name, format, dir));
        }

        Ok(versions)
    }
}

/// Attach the beta-subscription hint to resolution failures of beta builds
fn with_channel_hint(error: Error, channel: Channel) -> Error {
    match error {
        Error::UnresolvableIdentifier { identifier, .. } => Error::UnresolvableIdentifier {
            identifier,
            beta: channel == Channel::Beta,
        },
        other => other,
    }
}

/// Format of an installed directory, or `None` if it holds no known install
fn installed_format(dir: &Path, executable_name: &str) -> Option<PackageFormat> {
    if dir.join(MANIFEST_FILE).is_file() {
        Some(PackageFormat::Archive)
    } else if dir.join(executable_name).is_file() {
        Some(PackageFormat::Container)
    } else {
        None
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_channel_hint() {
        let e = with_channel_hint(
            Error::UnresolvableIdentifier {
                identifier: "X".to_string(),
                beta: false,
            },
            Channel::Beta,
        );
        assert!(matches!(e, Error::UnresolvableIdentifier { beta: true, .. }));
        assert!(e.to_string().contains("Xbox Insider Hub"));

        let e = with_channel_hint(Error::Cancelled, Channel::Beta);
        assert!(e.is_cancelled());
    }

    #[test]
    fn test_installed_format() {
        let temp = TempDir::new().unwrap();
        assert_eq!(installed_format(temp.path(), "Game.exe"), None);

        fs::write(temp.path().join("Game.exe"), b"exe").unwrap();
        assert_eq!(
            installed_format(temp.path(), "Game.exe"),
            Some(PackageFormat::Container)
        );

        fs::write(temp.path().join(MANIFEST_FILE), b"<Package/>").unwrap();
        assert_eq!(
            installed_format(temp.path(), "Game.exe"),
            Some(PackageFormat::Archive)
        );
    }

    #[test]
    fn test_read_subdirs_missing() {
        let temp = TempDir::new().unwrap();
        assert!(read_subdirs(&temp.path().join("nope")).unwrap().is_empty());
    }
}
