//! Version descriptors and per-version install state
//!
//! A [`VersionDescriptor`] names one installable build of the game. While an
//! operation runs on it, the descriptor carries an [`InstallState`]; when idle
//! the state is absent. Observers subscribe to the state through a
//! `tokio::sync::watch` channel.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Identifier used for versions imported from a local file
pub const UNKNOWN_IDENTIFIER: &str = "UNKNOWN";

/// Package family of release and beta builds
pub const RELEASE_FAMILY: &str = "Microsoft.MinecraftUWP_8wekyb3d8bbwe";

/// Package family of preview builds
pub const PREVIEW_FAMILY: &str = "Microsoft.MinecraftWindowsBeta_8wekyb3d8bbwe";

const DIR_PREFIX: &str = "Minecraft-";
const PREVIEW_DIR_PREFIX: &str = "Minecraft-Preview-";
const CONTAINER_DIR_SUFFIX: &str = "-GDK";

/// How a build is packaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    /// Plain zip archive, registered as a development-mode package
    Archive,
    /// Encrypted container, staged through the package store and decrypted
    Container,
}

impl PackageFormat {
    /// File extension used for downloaded artifacts of this format
    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::Archive => "Appx",
            PackageFormat::Container => "msixvc",
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageFormat::Archive => write!(f, "archive"),
            PackageFormat::Container => write!(f, "container"),
        }
    }
}

impl FromStr for PackageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "archive" | "appx" => Ok(PackageFormat::Archive),
            "container" | "msixvc" => Ok(PackageFormat::Container),
            other => Err(Error::Other(format!("Unknown package format: {}", other))),
        }
    }
}

/// Release channel of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Release,
    Beta,
    Preview,
    Imported,
}

impl Channel {
    pub fn package_family(&self) -> &'static str {
        match self {
            Channel::Preview => PREVIEW_FAMILY,
            Channel::Release | Channel::Beta | Channel::Imported => RELEASE_FAMILY,
        }
    }

    /// Beta and preview builds are only resolvable with a user ticket
    pub fn requires_user_ticket(&self) -> bool {
        matches!(self, Channel::Beta | Channel::Preview)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Release => "release",
            Channel::Beta => "beta",
            Channel::Preview => "preview",
            Channel::Imported => "imported",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "release" => Ok(Channel::Release),
            "beta" => Ok(Channel::Beta),
            "preview" => Ok(Channel::Preview),
            "imported" => Ok(Channel::Imported),
            other => Err(Error::Other(format!("Unknown channel: {}", other))),
        }
    }
}

/// Phase of an in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Initializing,
    Downloading,
    Extracting,
    Staging,
    Decrypting,
    Moving,
    MovingData,
    Registering,
    Launching,
    Unregistering,
    CleaningUp,
}

impl InstallPhase {
    /// Phases that never report byte progress
    pub fn is_indeterminate(&self) -> bool {
        !matches!(self, InstallPhase::Downloading)
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallPhase::Initializing => "Preparing...",
            InstallPhase::Downloading => "Downloading...",
            InstallPhase::Extracting => "Extracting...",
            InstallPhase::Staging => "Staging package...",
            InstallPhase::Decrypting => "Decrypting...",
            InstallPhase::Moving => "Moving files...",
            InstallPhase::MovingData => "Moving saved data...",
            InstallPhase::Registering => "Registering package...",
            InstallPhase::Launching => "Launching...",
            InstallPhase::Unregistering => "Unregistering package...",
            InstallPhase::CleaningUp => "Cleaning up...",
        };
        write!(f, "{}", s)
    }
}

/// State of a version while an operation is running on it
#[derive(Debug, Clone)]
pub struct InstallState {
    pub phase: InstallPhase,
    pub transferred: u64,
    /// Zero when the total size is unknown
    pub total: u64,
    pub cancel: Option<CancellationToken>,
}

impl InstallState {
    pub fn new(phase: InstallPhase, cancel: Option<CancellationToken>) -> Self {
        Self {
            phase,
            transferred: 0,
            total: 0,
            cancel,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.phase.is_indeterminate() || (self.transferred == 0 && self.total == 0)
    }

    /// Human readable status line
    pub fn display_status(&self) -> String {
        if self.phase == InstallPhase::Downloading && self.total > 0 {
            format!(
                "Downloading... {}MiB/{}MiB",
                self.transferred / 1024 / 1024,
                self.total / 1024 / 1024
            )
        } else {
            self.phase.to_string()
        }
    }
}

/// One installable build of the game
#[derive(Debug)]
pub struct VersionDescriptor {
    pub identifier: String,
    pub name: String,
    pub format: PackageFormat,
    pub channel: Channel,
    /// Pre-resolved download URLs, tried in order before the protocol client
    pub source_urls: Vec<String>,
    pub install_dir: PathBuf,
    state: watch::Sender<Option<InstallState>>,
}

impl VersionDescriptor {
    /// Describe a catalog version installed under `versions_dir`
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        channel: Channel,
        format: PackageFormat,
        versions_dir: &Path,
    ) -> Self {
        let name = name.into();
        let install_dir = versions_dir.join(install_dir_name(&name, channel, format));
        Self::with_install_dir(identifier, name, channel, format, install_dir)
    }

    /// Describe a version imported from a local file into `dir`
    pub fn imported(name: impl Into<String>, format: PackageFormat, dir: PathBuf) -> Self {
        Self::with_install_dir(UNKNOWN_IDENTIFIER, name, Channel::Imported, format, dir)
    }

    pub fn with_install_dir(
        identifier: impl Into<String>,
        name: impl Into<String>,
        channel: Channel,
        format: PackageFormat,
        install_dir: PathBuf,
    ) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            identifier: identifier.into(),
            name: name.into(),
            format,
            channel,
            source_urls: Vec::new(),
            install_dir,
            state,
        }
    }

    pub fn with_source_urls(mut self, urls: Vec<String>) -> Self {
        self.source_urls = urls;
        self
    }

    pub fn package_family(&self) -> &'static str {
        self.channel.package_family()
    }

    pub fn is_imported(&self) -> bool {
        self.channel == Channel::Imported
    }

    pub fn is_installed(&self) -> bool {
        self.install_dir.is_dir()
    }

    pub fn display_name(&self) -> String {
        match self.channel {
            Channel::Beta => format!("{} (beta)", self.name),
            Channel::Preview => format!("{} (preview)", self.name),
            _ => self.name.clone(),
        }
    }

    /// Base file name (without extension) for a downloaded artifact
    pub fn download_file_stem(&self) -> String {
        let prefix = if self.channel == Channel::Preview {
            PREVIEW_DIR_PREFIX
        } else {
            DIR_PREFIX
        };
        format!("{}{}", prefix, sanitize_file_name(&self.name))
    }

    /// Attach a new install state; fails if an operation is already running
    pub fn begin(
        &self,
        phase: InstallPhase,
        cancel: Option<CancellationToken>,
    ) -> Result<StateGuard<'_>> {
        let mut acquired = false;
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(InstallState::new(phase, cancel));
            acquired = true;
            true
        });

        if acquired {
            Ok(StateGuard { descriptor: self })
        } else {
            Err(Error::Busy(self.display_name()))
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn state(&self) -> Option<InstallState> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<InstallState>> {
        self.state.subscribe()
    }

    /// Request cancellation of the running operation, if it is cancellable
    pub fn cancel(&self) -> bool {
        match self.state.borrow().as_ref().and_then(|s| s.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Keeps a version's install state attached; clears it on drop
///
/// Dropping the guard is the last step of every operation, on success and
/// failure alike.
#[derive(Debug)]
pub struct StateGuard<'a> {
    descriptor: &'a VersionDescriptor,
}

impl StateGuard<'_> {
    pub fn set_phase(&self, phase: InstallPhase) {
        self.descriptor.state.send_modify(|state| {
            if let Some(state) = state {
                state.phase = phase;
            }
        });
    }

    pub fn set_progress(&self, transferred: u64, total: Option<u64>) {
        self.descriptor.state.send_modify(|state| {
            if let Some(state) = state {
                state.transferred = transferred;
                if let Some(total) = total {
                    state.total = total;
                }
            }
        });
    }

    pub fn phase(&self) -> Option<InstallPhase> {
        self.descriptor.state.borrow().as_ref().map(|s| s.phase)
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.descriptor.state.send_replace(None);
    }
}

/// Directory name for a managed install
pub fn install_dir_name(name: &str, channel: Channel, format: PackageFormat) -> String {
    let prefix = if channel == Channel::Preview {
        PREVIEW_DIR_PREFIX
    } else {
        DIR_PREFIX
    };
    let suffix = match format {
        PackageFormat::Archive => "",
        PackageFormat::Container => CONTAINER_DIR_SUFFIX,
    };
    format!("{}{}{}", prefix, sanitize_file_name(name), suffix)
}

/// Recover channel, name and format from a managed directory name
///
/// Release and beta installs share a prefix, so both parse as release.
pub fn parse_install_dir_name(dir_name: &str) -> Option<(Channel, String, PackageFormat)> {
    let (channel, rest) = if let Some(rest) = dir_name.strip_prefix(PREVIEW_DIR_PREFIX) {
        (Channel::Preview, rest)
    } else if let Some(rest) = dir_name.strip_prefix(DIR_PREFIX) {
        (Channel::Release, rest)
    } else {
        return None;
    };

    let (name, format) = match rest.strip_suffix(CONTAINER_DIR_SUFFIX) {
        Some(name) => (name, PackageFormat::Container),
        None => (rest, PackageFormat::Archive),
    };
    if name.is_empty() {
        return None;
    }
    Some((channel, name.to_string(), format))
}

/// Replace characters that are invalid in file names with `_`
pub fn sanitize_file_name(name: &str) -> String {
    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = name
        .chars()
        .map(|c| {
            if INVALID.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
