//! Saved data migration between package formats
//!
//! The archive format keeps saved data in the package's local application
//! data. The container format keeps it per user account under a shared
//! roaming directory. A pending backup left by an unregister is a third
//! place worlds can live. All three use the same relative layout
//! `games/com.mojang/<worlds_dir>/<one dir per world>`.
//!
//! [`plan`] is pure: it looks at counted candidates and decides what to do.
//! [`apply`] performs the decision. When more than one location holds worlds
//! nothing is moved and the operator has to resolve it by hand.

use crate::config::Config;
use crate::deploy::app_package::merge_move;
use crate::operator::Operator;
use crate::version::PackageFormat;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Account directory holding shared state rather than one user's saves
const SHARED_ACCOUNT_DIR: &str = "Shared";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationKind {
    /// Local application data of the registered archive package
    ArchiveFormat,
    /// One account's directory used by the container format
    ContainerAccount(String),
    /// Backup taken before an unregister, not yet restored
    PendingBackup,
}

/// A place that may hold saved data, with its world count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveLocation {
    pub kind: LocationKind,
    /// The `com.mojang` directory of this location
    pub path: PathBuf,
    pub worlds: usize,
}

/// Where saved data lives for one package family
#[derive(Debug, Clone)]
pub struct SaveDataLayout {
    pub archive_root: PathBuf,
    pub container_root: PathBuf,
    pub backup_root: PathBuf,
    pub worlds_dir: String,
    pub migration_marker: PathBuf,
}

impl SaveDataLayout {
    pub fn new(config: &Config, package_family: &str) -> Self {
        Self {
            archive_root: config
                .data
                .packages_root
                .join(package_family)
                .join("LocalState"),
            container_root: config.data.container_data_root.clone(),
            backup_root: config.paths.backup_dir.clone(),
            worlds_dir: config.data.worlds_dir.clone(),
            migration_marker: config
                .data
                .container_data_root
                .join(&config.data.migration_marker),
        }
    }

    /// The `com.mojang` directory below a location root
    pub fn save_dir(root: &Path) -> PathBuf {
        root.join("games").join("com.mojang")
    }

    pub fn archive_save_dir(&self) -> PathBuf {
        Self::save_dir(&self.archive_root)
    }

    fn location(&self, kind: LocationKind, root: &Path) -> Result<SaveLocation> {
        let path = Self::save_dir(root);
        let worlds = count_worlds(&path.join(&self.worlds_dir))?;
        Ok(SaveLocation { kind, path, worlds })
    }
}

/// Number of entries in a worlds directory; a missing directory counts zero
pub fn count_worlds(worlds_dir: &Path) -> Result<usize> {
    if !worlds_dir.is_dir() {
        return Ok(0);
    }
    Ok(fs::read_dir(worlds_dir)?.filter_map(|e| e.ok()).count())
}

/// Every existing location that may hold saved data for this layout
pub fn enumerate_candidates(layout: &SaveDataLayout) -> Result<Vec<SaveLocation>> {
    let mut candidates = Vec::new();

    if layout.archive_root.is_dir() {
        candidates.push(layout.location(LocationKind::ArchiveFormat, &layout.archive_root)?);
    }

    if layout.container_root.is_dir() {
        let mut accounts: Vec<_> = fs::read_dir(&layout.container_root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter(|e| e.file_name() != SHARED_ACCOUNT_DIR)
            .collect();
        accounts.sort_by_key(|e| e.file_name());
        for account in accounts {
            let name = account.file_name().to_string_lossy().into_owned();
            let kind = LocationKind::ContainerAccount(name);
            candidates.push(layout.location(kind, &account.path())?);
        }
    }

    if layout.backup_root.is_dir() {
        candidates.push(layout.location(LocationKind::PendingBackup, &layout.backup_root)?);
    }

    debug!("Save data candidates: {:?}", candidates);
    Ok(candidates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationPlan {
    /// No location holds any worlds
    NothingToDo,
    /// The only populated location is already the right one
    AlreadyInPlace(SaveLocation),
    /// Move the save directory, optionally clearing the migration marker after
    Relocate {
        from: PathBuf,
        to: PathBuf,
        clear_marker: bool,
    },
    /// Delete the marker so the container build migrates archive data itself
    ClearMarker(PathBuf),
    /// More than one location holds worlds
    Conflict(Vec<SaveLocation>),
}

impl MigrationPlan {
    pub fn needs_action(&self) -> bool {
        matches!(
            self,
            MigrationPlan::Relocate { .. } | MigrationPlan::ClearMarker(_)
        )
    }
}

/// Decide what to do with saved data before running `target`
pub fn plan(
    layout: &SaveDataLayout,
    candidates: &[SaveLocation],
    target: PackageFormat,
) -> MigrationPlan {
    let populated: Vec<&SaveLocation> = candidates.iter().filter(|c| c.worlds > 0).collect();

    let only = match populated.as_slice() {
        [] => return MigrationPlan::NothingToDo,
        [only] => (*only).clone(),
        _ => return MigrationPlan::Conflict(populated.into_iter().cloned().collect()),
    };

    match (target, &only.kind) {
        // A pending backup is restored by the next archive registration
        (PackageFormat::Archive, LocationKind::ArchiveFormat)
        | (PackageFormat::Archive, LocationKind::PendingBackup)
        | (PackageFormat::Container, LocationKind::ContainerAccount(_)) => {
            MigrationPlan::AlreadyInPlace(only)
        }
        (PackageFormat::Archive, LocationKind::ContainerAccount(_)) => MigrationPlan::Relocate {
            from: only.path,
            to: layout.archive_save_dir(),
            clear_marker: false,
        },
        (PackageFormat::Container, LocationKind::ArchiveFormat) => {
            MigrationPlan::ClearMarker(layout.migration_marker.clone())
        }
        (PackageFormat::Container, LocationKind::PendingBackup) => MigrationPlan::Relocate {
            from: only.path,
            to: layout.archive_save_dir(),
            clear_marker: true,
        },
    }
}

/// Carry out a plan
///
/// Returns `true` when anything on disk changed.
pub fn apply(
    plan: &MigrationPlan,
    layout: &SaveDataLayout,
    operator: &dyn Operator,
) -> Result<bool> {
    match plan {
        MigrationPlan::NothingToDo | MigrationPlan::AlreadyInPlace(_) => Ok(false),
        MigrationPlan::Conflict(candidates) => Err(Error::SaveDataConflict(candidates.clone())),
        MigrationPlan::Relocate {
            from,
            to,
            clear_marker,
        } => {
            info!("Moving saved data from {} to {}", from.display(), to.display());
            fs::create_dir_all(to)?;
            merge_move(from, to, operator)?;
            remove_if_empty(from)?;
            if from.starts_with(&layout.backup_root) {
                // Any leftover backup directory blocks the next backup
                remove_if_empty(&layout.backup_root)?;
            }
            if *clear_marker {
                clear_migration_marker(&layout.migration_marker)?;
            }
            Ok(true)
        }
        MigrationPlan::ClearMarker(marker) => clear_migration_marker(marker),
    }
}

fn clear_migration_marker(marker: &Path) -> Result<bool> {
    if marker.exists() {
        info!("Removing migration marker {}", marker.display());
        fs::remove_file(marker)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove a directory tree that contains no files
fn remove_if_empty(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let has_files = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file());
    if has_files {
        debug!("Keeping {}, it still holds files", dir.display());
    } else {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::UnattendedOperator;
    use tempfile::TempDir;

    fn layout(root: &Path) -> SaveDataLayout {
        SaveDataLayout {
            archive_root: root.join("Packages").join("Family").join("LocalState"),
            container_root: root.join("Users"),
            backup_root: root.join("TmpLocalState"),
            worlds_dir: "minecraftWorlds".to_string(),
            migration_marker: root.join("Users").join("Shared").join("marker"),
        }
    }

    fn add_worlds(root: &Path, count: usize) {
        let worlds = SaveDataLayout::save_dir(root).join("minecraftWorlds");
        for i in 0..count {
            let world = worlds.join(format!("world{}", i));
            fs::create_dir_all(&world).unwrap();
            fs::write(world.join("level.dat"), b"data").unwrap();
        }
    }

    fn snapshot(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_no_worlds_nothing_to_do() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        fs::create_dir_all(&layout.archive_root).unwrap();
        let candidates = enumerate_candidates(&layout).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            plan(&layout, &candidates, PackageFormat::Archive),
            MigrationPlan::NothingToDo
        );
    }

    #[test]
    fn test_count_and_enumerate() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        add_worlds(&layout.archive_root, 3);
        add_worlds(&layout.container_root.join("12345"), 2);
        fs::create_dir_all(layout.container_root.join(SHARED_ACCOUNT_DIR)).unwrap();

        let candidates = enumerate_candidates(&layout).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].kind, LocationKind::ArchiveFormat);
        assert_eq!(candidates[0].worlds, 3);
        assert_eq!(
            candidates[1].kind,
            LocationKind::ContainerAccount("12345".to_string())
        );
        assert_eq!(candidates[1].worlds, 2);
    }

    #[test]
    fn test_conflict_lists_both_and_mutates_nothing() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        add_worlds(&layout.archive_root, 1);
        add_worlds(&layout.container_root.join("acct"), 4);
        let before = snapshot(temp.path());

        let candidates = enumerate_candidates(&layout).unwrap();
        let decision = plan(&layout, &candidates, PackageFormat::Archive);
        match &decision {
            MigrationPlan::Conflict(found) => {
                assert_eq!(found.len(), 2);
                assert!(found.iter().any(|c| c.worlds == 1));
                assert!(found.iter().any(|c| c.worlds == 4));
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let result = apply(&decision, &layout, &UnattendedOperator);
        assert!(matches!(result, Err(Error::SaveDataConflict(ref c)) if c.len() == 2));
        assert_eq!(snapshot(temp.path()), before);
    }

    #[test]
    fn test_container_worlds_move_to_archive() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        let account = layout.container_root.join("acct");
        add_worlds(&account, 2);

        let candidates = enumerate_candidates(&layout).unwrap();
        let decision = plan(&layout, &candidates, PackageFormat::Archive);
        assert!(decision.needs_action());
        assert!(apply(&decision, &layout, &UnattendedOperator).unwrap());

        assert_eq!(
            count_worlds(&layout.archive_save_dir().join("minecraftWorlds")).unwrap(),
            2
        );
        assert!(!SaveDataLayout::save_dir(&account).exists());
    }

    #[test]
    fn test_archive_worlds_for_container_clear_marker() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        add_worlds(&layout.archive_root, 1);
        fs::create_dir_all(layout.migration_marker.parent().unwrap()).unwrap();
        fs::write(&layout.migration_marker, b"").unwrap();

        let candidates = enumerate_candidates(&layout).unwrap();
        let decision = plan(&layout, &candidates, PackageFormat::Container);
        assert_eq!(
            decision,
            MigrationPlan::ClearMarker(layout.migration_marker.clone())
        );
        assert!(apply(&decision, &layout, &UnattendedOperator).unwrap());
        assert!(!layout.migration_marker.exists());
        assert_eq!(
            count_worlds(&layout.archive_save_dir().join("minecraftWorlds")).unwrap(),
            1
        );
    }

    #[test]
    fn test_already_in_place() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        add_worlds(&layout.container_root.join("acct"), 1);
        let candidates = enumerate_candidates(&layout).unwrap();
        let decision = plan(&layout, &candidates, PackageFormat::Container);
        assert!(matches!(decision, MigrationPlan::AlreadyInPlace(_)));
        assert!(!apply(&decision, &layout, &UnattendedOperator).unwrap());
    }

    #[test]
    fn test_pending_backup_for_archive_waits_for_restore() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        add_worlds(&layout.backup_root, 2);
        let candidates = enumerate_candidates(&layout).unwrap();
        assert_eq!(candidates[0].kind, LocationKind::PendingBackup);
        let decision = plan(&layout, &candidates, PackageFormat::Archive);
        assert!(matches!(decision, MigrationPlan::AlreadyInPlace(_)));
    }

    #[test]
    fn test_pending_backup_for_container_is_moved_and_removed() {
        let temp = TempDir::new().unwrap();
        let layout = layout(temp.path());
        add_worlds(&layout.backup_root, 2);
        let candidates = enumerate_candidates(&layout).unwrap();
        let decision = plan(&layout, &candidates, PackageFormat::Container);
        assert!(matches!(decision, MigrationPlan::Relocate { .. }));

        assert!(apply(&decision, &layout, &UnattendedOperator).unwrap());

        let moved = SaveDataLayout::save_dir(&layout.archive_root).join("minecraftWorlds");
        assert!(moved.join("world0").join("level.dat").exists());
        assert!(moved.join("world1").join("level.dat").exists());
        assert!(!layout.backup_root.exists());
    }

    #[test]
    fn test_remove_if_empty_keeps_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tree");
        fs::create_dir_all(dir.join("a").join("b")).unwrap();
        remove_if_empty(&dir).unwrap();
        assert!(!dir.exists());

        fs::create_dir_all(dir.join("a")).unwrap();
        fs::write(dir.join("a").join("options.txt"), b"x").unwrap();
        remove_if_empty(&dir).unwrap();
        assert!(dir.join("a").join("options.txt").exists());

        remove_if_empty(&temp.path().join("missing")).unwrap();
    }

    #[test]
    fn test_layout_from_config() {
        let mut config = Config::default();
        config.data.packages_root = PathBuf::from("/pk");
        config.data.container_data_root = PathBuf::from("/users");
        let layout = SaveDataLayout::new(&config, "Fam_123");
        assert_eq!(layout.archive_root, PathBuf::from("/pk/Fam_123/LocalState"));
        assert!(layout.migration_marker.starts_with("/users"));
        assert!(layout.migration_marker.ends_with("uwp_migration_complete"));
    }
}
