//! Archive-format packages registered in development mode
//!
//! Removing a store-installed (non development mode) package deletes its
//! application data, so the data directory is first moved to a fixed backup
//! location. The next registration merges it back. An existing backup
//! directory means a previous backup was never restored; nothing is
//! overwritten and the operator has to deal with it.

use super::{PackageRecord, PackageSubsystem, ProgressSink, RemovalMode};
use crate::installer::{self, ProgressCallback, MANIFEST_FILE};
use crate::operator::Operator;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const RESTORE_TITLE: &str = "Restoring data directory from previous installation";

/// Result of [`AppPackageBackend::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A package of the family was already registered at this directory
    AlreadyRegistered,
    Registered,
}

pub struct AppPackageBackend {
    packages: Arc<dyn PackageSubsystem>,
    backup_dir: PathBuf,
    operator: Arc<dyn Operator>,
}

impl AppPackageBackend {
    pub fn new(
        packages: Arc<dyn PackageSubsystem>,
        backup_dir: PathBuf,
        operator: Arc<dyn Operator>,
    ) -> Self {
        Self {
            packages,
            backup_dir,
            operator,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn packages(&self) -> &Arc<dyn PackageSubsystem> {
        &self.packages
    }

    /// Extract an archive package into `install_dir`
    ///
    /// `progress` receives extracted and total entry counts.
    pub async fn install(
        &self,
        archive: &Path,
        install_dir: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<()> {
        let archive = archive.to_path_buf();
        let install_dir = install_dir.to_path_buf();

        let (sender, mut receiver) = watch::channel((0u64, 0u64));
        let callback: ProgressCallback = Arc::new(move |current, total| {
            sender.send_replace((current, total));
        });
        let task = tokio::task::spawn_blocking(move || {
            installer::extract_archive(&archive, &install_dir, Some(callback))
        });

        // Ends once the extraction task drops the callback
        while receiver.changed().await.is_ok() {
            let (current, total) = *receiver.borrow_and_update();
            progress(current, Some(total));
        }

        task.await
            .map_err(|e| Error::Other(format!("Extraction task failed: {}", e)))?
    }

    /// Remove every registration of `family`
    ///
    /// With `skip_backup` the caller guarantees saved data was already taken
    /// care of, so no backup is attempted.
    pub async fn unregister(&self, family: &str, skip_backup: bool) -> Result<()> {
        for package in self.packages.find_packages(family)? {
            self.remove_package(&package, family, skip_backup).await?;
        }
        Ok(())
    }

    /// Remove registrations of `family` that point at `dir` or at nothing
    pub async fn unregister_at(&self, family: &str, dir: &Path) -> Result<()> {
        for package in self.packages.find_packages(family)? {
            let matches = match &package.install_location {
                None => true,
                Some(location) => same_location(location, dir),
            };
            if matches {
                self.remove_package(&package, family, false).await?;
            }
        }
        Ok(())
    }

    async fn remove_package(
        &self,
        package: &PackageRecord,
        family: &str,
        skip_backup: bool,
    ) -> Result<()> {
        info!("Removing package: {}", package.full_name);
        if package.development_mode {
            debug!("Package is in development mode");
            self.packages
                .remove(&package.full_name, RemovalMode::PreserveApplicationData)
                .await?;
        } else {
            if !skip_backup {
                self.backup_save_data(family)?;
            }
            match self
                .packages
                .remove(&package.full_name, RemovalMode::ForAllUsers)
                .await
            {
                Ok(()) => {}
                Err(Error::Deployment(text)) => {
                    warn!(
                        "Removal for all users failed ({}), retrying for the current user",
                        text
                    );
                    self.packages
                        .remove(&package.full_name, RemovalMode::Default)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        info!("Removal of package done: {}", package.full_name);
        Ok(())
    }

    /// Move the family's local data to the backup directory
    ///
    /// Returns `false` when there was no local data to back up.
    pub fn backup_save_data(&self, family: &str) -> Result<bool> {
        if self.backup_dir.exists() {
            warn!(
                "Backup directory {} already exists",
                self.backup_dir.display()
            );
            return Err(Error::BackupConflict(self.backup_dir.clone()));
        }

        let local_state = self.packages.local_state_dir(family)?;
        if !local_state.exists() {
            debug!("No local data at {}", local_state.display());
            return Ok(false);
        }

        info!("Moving saved data to: {}", self.backup_dir.display());
        if let Some(parent) = self.backup_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if !installer::move_dir(&local_state, &self.backup_dir)? {
            fs::remove_dir_all(&local_state)?;
        }
        Ok(true)
    }

    /// Merge a pending backup into the family's local data directory
    ///
    /// Returns `false` when there was no pending backup.
    pub fn restore_backup(&self, family: &str) -> Result<bool> {
        if !self.backup_dir.exists() {
            return Ok(false);
        }

        let local_state = self.packages.local_state_dir(family)?;
        info!("Moving backup data to: {}", local_state.display());
        fs::create_dir_all(&local_state)?;
        merge_move(&self.backup_dir, &local_state, self.operator.as_ref())?;
        fs::remove_dir_all(&self.backup_dir)?;
        Ok(true)
    }

    /// Register the package unpacked in `dir` as the family's only registration
    ///
    /// Registering the directory that is already registered is a no-op apart
    /// from restoring a pending backup.
    pub async fn register(&self, dir: &Path, family: &str) -> Result<RegisterOutcome> {
        let existing = self.packages.find_packages(family)?;

        if let Some(current) = existing.iter().find(|p| {
            p.install_location
                .as_deref()
                .is_some_and(|location| same_location(location, dir))
        }) {
            debug!(
                "Skipping package removal - same path: {} {}",
                current.full_name,
                dir.display()
            );
            self.restore_backup(family)?;
            return Ok(RegisterOutcome::AlreadyRegistered);
        }

        for package in &existing {
            self.remove_package(package, family, false).await?;
        }

        info!("Registering package from {}", dir.display());
        self.packages.register(&dir.join(MANIFEST_FILE)).await?;
        info!("Package registered");

        self.restore_backup(family)?;
        Ok(RegisterOutcome::Registered)
    }

    pub async fn launch(&self, family: &str) -> Result<()> {
        self.packages.launch(family).await
    }
}

fn same_location(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Move the contents of `from` into `to`, merging directories
///
/// Existing files are only replaced after the operator confirms. A file
/// standing where a directory should go is likewise only removed after
/// confirmation. Declined entries stay in `from`.
pub fn merge_move(from: &Path, to: &Path, operator: &dyn Operator) -> Result<()> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry);
        } else {
            files.push(entry);
        }
    }

    for entry in files {
        let target = to.join(entry.file_name());
        if target.exists() {
            let question = format!(
                "The file {} already exists in the destination.\n\
                 Do you want to replace it? The old file will be lost otherwise.",
                target.display()
            );
            if !operator.confirm(RESTORE_TITLE, &question) {
                continue;
            }
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_file(&target)?;
            }
        }
        installer::move_file(&entry.path(), &target)?;
    }

    for entry in dirs {
        let target = to.join(entry.file_name());
        if !target.is_dir() {
            if target.exists() {
                let question = format!(
                    "The file {} is not a directory. Do you want to remove it? \
                     The data from the old directory will be lost otherwise.",
                    target.display()
                );
                if !operator.confirm(RESTORE_TITLE, &question) {
                    continue;
                }
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)?;
        }
        merge_move(&entry.path(), &target, operator)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Answer {
        yes: bool,
        asked: AtomicUsize,
    }

    impl Operator for Answer {
        fn notify(&self, _title: &str, _message: &str) {}

        fn confirm(&self, _title: &str, _question: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.yes
        }
    }

    fn answer(yes: bool) -> Answer {
        Answer {
            yes,
            asked: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_merge_into_empty() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        let to = temp.path().join("to");
        fs::create_dir_all(from.join("games").join("com.mojang")).unwrap();
        fs::write(from.join("games").join("com.mojang").join("options.txt"), b"o").unwrap();
        fs::write(from.join("top.dat"), b"t").unwrap();
        fs::create_dir_all(&to).unwrap();

        let operator = answer(false);
        merge_move(&from, &to, &operator).unwrap();

        assert_eq!(operator.asked.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read(to.join("top.dat")).unwrap(), b"t");
        assert_eq!(
            fs::read(to.join("games").join("com.mojang").join("options.txt")).unwrap(),
            b"o"
        );
        assert!(!from.join("top.dat").exists());
    }

    #[test]
    fn test_merge_conflict_declined_keeps_destination() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        let to = temp.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::create_dir_all(&to).unwrap();
        fs::write(from.join("a.txt"), b"backup").unwrap();
        fs::write(to.join("a.txt"), b"current").unwrap();

        let operator = answer(false);
        merge_move(&from, &to, &operator).unwrap();

        assert_eq!(operator.asked.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(to.join("a.txt")).unwrap(), b"current");
        assert!(from.join("a.txt").exists());
    }

    #[test]
    fn test_merge_conflict_confirmed_replaces() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        let to = temp.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::create_dir_all(&to).unwrap();
        fs::write(from.join("a.txt"), b"backup").unwrap();
        fs::write(to.join("a.txt"), b"current").unwrap();

        merge_move(&from, &to, &answer(true)).unwrap();
        assert_eq!(fs::read(to.join("a.txt")).unwrap(), b"backup");
    }

    #[test]
    fn test_merge_file_in_place_of_directory() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        let to = temp.path().join("to");
        fs::create_dir_all(from.join("games")).unwrap();
        fs::write(from.join("games").join("x"), b"x").unwrap();
        fs::create_dir_all(&to).unwrap();
        fs::write(to.join("games"), b"not a dir").unwrap();

        let declined = answer(false);
        merge_move(&from, &to, &declined).unwrap();
        assert!(to.join("games").is_file());

        let accepted = answer(true);
        merge_move(&from, &to, &accepted).unwrap();
        assert_eq!(fs::read(to.join("games").join("x")).unwrap(), b"x");
    }

    #[test]
    fn test_same_location() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a");
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(temp.path().join("b")).unwrap();
        assert!(same_location(&dir, &dir));
        assert!(same_location(&dir, &temp.path().join("b").join("..").join("a")));
        assert!(!same_location(&dir, &temp.path().join("b")));
    }
}
