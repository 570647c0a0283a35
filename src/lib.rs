//! MCLauncher - side-by-side installs of Minecraft for Windows
//!
//! The game ships in two incompatible package formats: a plain archive that
//! is registered with the OS as a development-mode package, and an encrypted
//! container that has to be staged through the package store and decrypted
//! from inside the game's own security context. This crate resolves version
//! identifiers through the update service, downloads packages, installs
//! either format into a managed directory and keeps saved worlds in the
//! right place when switching between formats.
//!
//! # Examples
//!
//! ```no_run
//! use mclauncher::{Channel, Config, Launcher, PackageFormat, UnattendedOperator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let launcher = Launcher::from_config(Config::load()?, Arc::new(UnattendedOperator))?;
//! let version = launcher.catalog_version(
//!     "d25fb1d8-6c77-46cd-95cf-a3e8e1d7e5f2",
//!     "1.20.0.1",
//!     Channel::Release,
//!     PackageFormat::Archive,
//! );
//!
//! launcher.download(&version, CancellationToken::new()).await?;
//! launcher.launch(&version).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - Update-service request envelopes and URL extraction
//! - [`token`] - User tickets and the one-time authorization step
//! - [`transfer`] - Cancellable streaming downloads
//! - [`deploy`] - Archive and container deployment backends
//! - [`migration`] - Saved data reconciliation between formats
//! - [`orchestrator`] - Per-version download, launch, import and removal
//! - [`installer`] - Format sniffing, extraction and file moves
//! - [`version`] - Version descriptors and install state
//! - [`platform`] - OS package subsystem bindings
//! - [`config`] - User configuration
//! - [`error`] - Error types and result handling

pub mod config;
pub mod deploy;
pub mod error;
pub mod guard;
pub mod helper;
pub mod installer;
pub mod migration;
pub mod operator;
pub mod orchestrator;
pub mod platform;
pub mod protocol;
pub mod token;
pub mod transfer;
pub mod version;

pub use config::Config;
pub use deploy::{
    AppPackageBackend, PackageRecord, PackageSource, PackageSubsystem, RemovalMode,
    StagedContainerBackend,
};
pub use error::{Error, Result};
pub use guard::{GuardRegistry, OperationKind};
pub use helper::{HelperRunner, ProcessOutput, TokioHelperRunner};
pub use installer::{extract_archive, is_zip_file, sniff_format, ProgressCallback};
pub use migration::{MigrationPlan, SaveDataLayout, SaveLocation};
pub use operator::{Operator, UnattendedOperator};
pub use orchestrator::Launcher;
pub use protocol::{ProtocolClient, UrlPolicy};
pub use token::{TokenError, TokenSource, UserAuthorization};
pub use transfer::{download_file, VersionDownloader};
pub use version::{Channel, InstallPhase, InstallState, PackageFormat, VersionDescriptor};
