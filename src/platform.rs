//! OS package subsystem bindings
//!
//! On Windows, [`PackageSubsystem`] is backed by the WinRT package manager.
//! Every deployment operation reports progress and completion through two
//! callbacks; those are bridged into a single awaitable result with
//! [`deployment_bridge`](crate::deploy::deployment_bridge).
//!
//! Elsewhere the subsystem reports [`Error::Unsupported`] so the rest of the
//! launcher (downloads, extraction, listing, configuration) still works.

use crate::deploy::PackageSubsystem;
use crate::Result;
use std::sync::Arc;

#[cfg(not(windows))]
use crate::deploy::{PackageRecord, PackageSource, RemovalMode, StageOptions};
#[cfg(not(windows))]
use crate::Error;
#[cfg(not(windows))]
use async_trait::async_trait;
#[cfg(not(windows))]
use std::path::{Path, PathBuf};

/// The package subsystem of the running OS
pub fn system_package_subsystem() -> Result<Arc<dyn PackageSubsystem>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(windows_impl::WindowsPackageSubsystem::new()?))
    }
    #[cfg(not(windows))]
    {
        Ok(Arc::new(UnsupportedPackageSubsystem))
    }
}

/// Stand-in used where no package subsystem exists
#[cfg(not(windows))]
#[derive(Debug, Default, Clone)]
pub struct UnsupportedPackageSubsystem;

#[cfg(not(windows))]
fn unsupported(operation: &str) -> Error {
    Error::Unsupported(format!(
        "{} requires the Windows package manager ({} detected)",
        operation,
        std::env::consts::OS
    ))
}

#[cfg(not(windows))]
#[async_trait]
impl PackageSubsystem for UnsupportedPackageSubsystem {
    fn find_packages(&self, _family: &str) -> Result<Vec<PackageRecord>> {
        Ok(Vec::new())
    }

    async fn register(&self, _manifest: &Path) -> Result<()> {
        Err(unsupported("Package registration"))
    }

    async fn remove(&self, _full_name: &str, _mode: RemovalMode) -> Result<()> {
        Err(unsupported("Package removal"))
    }

    async fn stage(&self, _source: &PackageSource, _options: StageOptions) -> Result<()> {
        Err(unsupported("Package staging"))
    }

    fn local_state_dir(&self, _family: &str) -> Result<PathBuf> {
        Err(unsupported("Application data lookup"))
    }

    async fn launch(&self, _family: &str) -> Result<()> {
        Err(unsupported("Launching a registered package"))
    }
}

#[cfg(windows)]
mod windows_impl {
    use crate::deploy::{
        deployment_bridge, DeploymentProgress, DeploymentStatus, PackageRecord, PackageSource,
        PackageSubsystem, RemovalMode, StageOptions,
    };
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tracing::debug;
    use windows::core::HSTRING;
    use windows::Foundation::Collections::IIterable;
    use windows::Foundation::{
        AsyncOperationProgressHandler, AsyncOperationWithProgressCompletedHandler, AsyncStatus,
        IAsyncOperationWithProgress, Uri,
    };
    use windows::Management::Core::ApplicationDataManager;
    use windows::Management::Deployment::{
        DeploymentOptions, DeploymentProgress as OsProgress, DeploymentResult, PackageManager,
        RemovalOptions, StagePackageOptions,
    };
    use windows::System::AppDiagnosticInfo;

    fn os_error(e: windows::core::Error) -> Error {
        Error::Deployment(e.to_string())
    }

    fn path_uri(path: &Path) -> Result<Uri> {
        let absolute = std::path::absolute(path)?;
        let url = url::Url::from_file_path(&absolute)
            .map_err(|_| Error::Other(format!("Invalid package path: {}", absolute.display())))?;
        Uri::CreateUri(&HSTRING::from(url.as_str())).map_err(os_error)
    }

    fn source_uri(source: &PackageSource) -> Result<Uri> {
        match source {
            PackageSource::Local(path) => path_uri(path),
            PackageSource::Remote(url) => Uri::CreateUri(&HSTRING::from(url.as_str())).map_err(os_error),
        }
    }

    async fn await_deployment(
        operation: IAsyncOperationWithProgress<DeploymentResult, OsProgress>,
        name: &str,
    ) -> Result<()> {
        let (hooks, completion) = deployment_bridge(name);

        let progress_hooks = hooks.clone();
        operation
            .SetProgress(&AsyncOperationProgressHandler::new(move |_, progress| {
                let progress: &OsProgress = &progress;
                progress_hooks.on_progress(DeploymentProgress {
                    state: format!("{:?}", progress.state),
                    percentage: progress.percentage,
                });
                Ok(())
            }))
            .map_err(os_error)?;

        operation
            .SetCompleted(&AsyncOperationWithProgressCompletedHandler::new(
                move |operation, status| {
                    let status = match status {
                        AsyncStatus::Completed => DeploymentStatus::Completed,
                        AsyncStatus::Canceled => DeploymentStatus::Canceled,
                        other => {
                            let text = operation
                                .as_ref()
                                .and_then(|op| op.GetResults().ok())
                                .and_then(|result| result.ErrorText().ok())
                                .map(|text| text.to_string_lossy())
                                .unwrap_or_else(|| format!("deployment ended with {:?}", other));
                            DeploymentStatus::Error(text)
                        }
                    };
                    hooks.on_completed(status);
                    Ok(())
                },
            ))
            .map_err(os_error)?;

        completion.wait().await
    }

    pub struct WindowsPackageSubsystem {
        manager: PackageManager,
    }

    impl WindowsPackageSubsystem {
        pub fn new() -> Result<Self> {
            Ok(Self {
                manager: PackageManager::new().map_err(os_error)?,
            })
        }
    }

    #[async_trait]
    impl PackageSubsystem for WindowsPackageSubsystem {
        fn find_packages(&self, family: &str) -> Result<Vec<PackageRecord>> {
            let packages = self
                .manager
                .FindPackagesByUserSecurityIdPackageFamilyName(&HSTRING::new(), &HSTRING::from(family))
                .map_err(os_error)?;

            let mut records = Vec::new();
            for package in packages {
                let full_name = package
                    .Id()
                    .and_then(|id| id.FullName())
                    .map_err(os_error)?
                    .to_string_lossy();
                let install_location = package
                    .InstalledLocation()
                    .and_then(|folder| folder.Path())
                    .ok()
                    .map(|path| PathBuf::from(path.to_string_lossy()));
                let development_mode = package.IsDevelopmentMode().unwrap_or(false);
                records.push(PackageRecord {
                    full_name,
                    install_location,
                    development_mode,
                });
            }
            debug!("Found {} packages for {}", records.len(), family);
            Ok(records)
        }

        async fn register(&self, manifest: &Path) -> Result<()> {
            let uri = path_uri(manifest)?;
            let operation = self
                .manager
                .RegisterPackageAsync(&uri, None::<&IIterable<Uri>>, DeploymentOptions::DevelopmentMode)
                .map_err(os_error)?;
            await_deployment(operation, "register").await
        }

        async fn remove(&self, full_name: &str, mode: RemovalMode) -> Result<()> {
            let options = match mode {
                RemovalMode::Default => RemovalOptions::default(),
                RemovalMode::ForAllUsers => RemovalOptions::RemoveForAllUsers,
                RemovalMode::PreserveApplicationData => RemovalOptions::PreserveApplicationData,
            };
            let operation = self
                .manager
                .RemovePackageWithOptionsAsync(&HSTRING::from(full_name), options)
                .map_err(os_error)?;
            await_deployment(operation, "remove").await
        }

        async fn stage(&self, source: &PackageSource, options: StageOptions) -> Result<()> {
            let uri = source_uri(source)?;
            let operation = if options.bootstrapper {
                let stage_options = StagePackageOptions::new().map_err(os_error)?;
                stage_options
                    .SetRequiredContentGroupOnly(true)
                    .map_err(os_error)?;
                self.manager
                    .StagePackageByUriAsync(&uri, &stage_options)
                    .map_err(os_error)?
            } else {
                self.manager
                    .StagePackageAsync(&uri, None::<&IIterable<Uri>>)
                    .map_err(os_error)?
            };
            await_deployment(operation, "stage").await
        }

        fn local_state_dir(&self, family: &str) -> Result<PathBuf> {
            let path = ApplicationDataManager::CreateForPackageFamily(&HSTRING::from(family))
                .and_then(|data| data.LocalFolder())
                .and_then(|folder| folder.Path())
                .map_err(os_error)?;
            Ok(PathBuf::from(path.to_string_lossy()))
        }

        async fn launch(&self, family: &str) -> Result<()> {
            let infos = AppDiagnosticInfo::RequestInfoForPackageAsync(&HSTRING::from(family))
                .map_err(os_error)?
                .await
                .map_err(os_error)?;
            if infos.Size().map_err(os_error)? == 0 {
                return Err(Error::Other(format!("No application found for {}", family)));
            }
            infos
                .GetAt(0)
                .and_then(|info| info.LaunchAsync())
                .map_err(os_error)?
                .await
                .map_err(os_error)?;
            debug!("App launch finished");
            Ok(())
        }
    }
}
