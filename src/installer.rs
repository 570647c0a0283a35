//! Package files on disk
//!
//! Archive-format packages are plain zip files. This module sniffs a
//! downloaded artifact's real format, fixes its extension, and extracts
//! archives into an install directory ready for development-mode
//! registration. It also holds the directory move/copy helpers the container
//! backend uses.
//!
//! # Examples
//!
//! ```no_run
//! use mclauncher::installer::{extract_archive, sniff_format};
//! use mclauncher::version::PackageFormat;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! if sniff_format("Minecraft-1.20.0.1.Appx") == PackageFormat::Archive {
//!     extract_archive("Minecraft-1.20.0.1.Appx", "versions/Minecraft-1.20.0.1", None)?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::version::PackageFormat;
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Signature file that prevents development-mode registration
pub const SIGNATURE_FILE: &str = "AppxSignature.p7x";

/// Manifest at the root of an unpacked package
pub const MANIFEST_FILE: &str = "AppxManifest.xml";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Called with the entries extracted so far and the archive's entry count
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Whether a file starts with the zip local-file-header signature
pub fn is_zip_file<P: AsRef<Path>>(path: P) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path.as_ref()) {
        Ok(mut file) => file.read_exact(&mut magic).is_ok() && magic == ZIP_MAGIC,
        Err(_) => false,
    }
}

/// The format a downloaded file actually has
pub fn sniff_format<P: AsRef<Path>>(path: P) -> PackageFormat {
    if is_zip_file(path) {
        PackageFormat::Archive
    } else {
        PackageFormat::Container
    }
}

/// Rename `path` so its extension matches `format`
///
/// Best effort: on failure the original path is returned and a warning is
/// logged.
pub fn normalize_extension(path: &Path, format: PackageFormat) -> PathBuf {
    let desired = format.extension();
    let current = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if current.eq_ignore_ascii_case(desired) {
        return path.to_path_buf();
    }

    let renamed = path.with_extension(desired);
    if renamed.exists() {
        if let Err(e) = fs::remove_file(&renamed) {
            warn!("Failed to replace {}: {}", renamed.display(), e);
            return path.to_path_buf();
        }
    }
    match fs::rename(path, &renamed) {
        Ok(()) => {
            debug!("Renamed {} to {}", path.display(), renamed.display());
            renamed
        }
        Err(e) => {
            warn!("Failed to rename downloaded file {}: {}", path.display(), e);
            path.to_path_buf()
        }
    }
}

/// Extract an archive package into `dest`
///
/// Any existing `dest` is removed first. After extraction the package
/// signature is deleted so the directory can be registered in development
/// mode. Entries whose paths would escape `dest` are skipped.
pub fn extract_archive<P: AsRef<Path>, Q: AsRef<Path>>(
    archive_path: P,
    dest: Q,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let dest = dest.as_ref();

    if !archive_path.exists() {
        return Err(Error::Other(format!(
            "Package file not found: {}",
            archive_path.display()
        )));
    }

    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)?;
    let total = archive.len() as u64;

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    if let Some(ref cb) = progress {
        cb(0, total);
    }

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = match entry.enclosed_name() {
            Some(path) => path,
            None => {
                warn!("Skipping unsafe archive entry: {}", entry.name());
                continue;
            }
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
        }

        if let Some(ref cb) = progress {
            cb(index as u64 + 1, total);
        }
    }

    let signature = dest.join(SIGNATURE_FILE);
    if signature.exists() {
        if let Err(e) = fs::remove_file(&signature) {
            warn!("Failed to delete {}: {}", SIGNATURE_FILE, e);
        }
    }

    Ok(())
}

/// Copy a directory tree, returning the number of files copied
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Other(e.to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Move a directory tree, copying when a rename is not possible
///
/// Returns `true` when the tree was renamed and `false` when it was copied
/// (the source is left in place in that case).
pub fn move_dir(src: &Path, dst: &Path) -> Result<bool> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!(
                "Rename {} -> {} failed ({}), copying instead",
                src.display(),
                dst.display(),
                e
            );
            copy_dir_recursive(src, dst)?;
            Ok(false)
        }
    }
}

/// Move a single file, copying when a rename is not possible
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_err() {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Create a test package with a manifest, an asset and a signature
    fn create_test_package(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default();

        writer.start_file(MANIFEST_FILE, options).unwrap();
        writer.write_all(b"<Package/>").unwrap();
        writer.add_directory("Assets/", options).unwrap();
        writer.start_file("Assets/logo.png", options).unwrap();
        writer.write_all(b"png").unwrap();
        writer.start_file(SIGNATURE_FILE, options).unwrap();
        writer.write_all(b"sig").unwrap();
        writer.finish().unwrap();
        path
    }

    // ============================================================================
    // Format detection
    // ============================================================================

    #[test]
    fn test_is_zip_file() {
        let temp = TempDir::new().unwrap();
        let package = create_test_package(temp.path(), "pkg.bin");
        assert!(is_zip_file(&package));
        assert_eq!(sniff_format(&package), PackageFormat::Archive);

        let other = temp.path().join("other.bin");
        fs::write(&other, b"MSIXVC\0\0").unwrap();
        assert!(!is_zip_file(&other));
        assert_eq!(sniff_format(&other), PackageFormat::Container);

        let short = temp.path().join("short.bin");
        fs::write(&short, b"PK").unwrap();
        assert!(!is_zip_file(&short));
        assert!(!is_zip_file(temp.path().join("missing")));
    }

    #[test]
    fn test_normalize_extension() {
        let temp = TempDir::new().unwrap();
        let download = temp.path().join("Minecraft-1.0.Appx");
        fs::write(&download, b"container bytes").unwrap();

        let renamed = normalize_extension(&download, PackageFormat::Container);
        assert_eq!(renamed, temp.path().join("Minecraft-1.0.msixvc"));
        assert!(renamed.exists());
        assert!(!download.exists());

        let same = normalize_extension(&renamed, PackageFormat::Container);
        assert_eq!(same, renamed);
    }

    #[test]
    fn test_normalize_extension_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let download = temp.path().join("pkg.appx");
        fs::write(&download, b"x").unwrap();
        assert_eq!(normalize_extension(&download, PackageFormat::Archive), download);
    }

    // ============================================================================
    // Extraction
    // ============================================================================

    #[test]
    fn test_extract_archive_removes_signature() {
        let temp = TempDir::new().unwrap();
        let package = create_test_package(temp.path(), "pkg.Appx");
        let dest = temp.path().join("Minecraft-1.0");

        extract_archive(&package, &dest, None).unwrap();

        assert!(dest.join(MANIFEST_FILE).exists());
        assert_eq!(fs::read(dest.join("Assets").join("logo.png")).unwrap(), b"png");
        assert!(!dest.join(SIGNATURE_FILE).exists());
    }

    #[test]
    fn test_extract_archive_replaces_existing_dir() {
        let temp = TempDir::new().unwrap();
        let package = create_test_package(temp.path(), "pkg.Appx");
        let dest = temp.path().join("Minecraft-1.0");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.txt"), b"old").unwrap();

        extract_archive(&package, &dest, None).unwrap();
        assert!(!dest.join("stale.txt").exists());
        assert!(dest.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_extract_archive_not_a_zip() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.Appx");
        fs::write(&bogus, b"definitely not a zip").unwrap();
        let dest = temp.path().join("out");

        let result = extract_archive(&bogus, &dest, None);
        assert!(matches!(result, Err(Error::Zip(_))));
        assert!(!dest.exists());
    }

    #[test]
    fn test_extract_archive_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = extract_archive(temp.path().join("nope.Appx"), temp.path().join("out"), None);
        assert!(matches!(result, Err(Error::Other(_))));
    }

    #[test]
    fn test_extract_archive_with_progress() {
        let temp = TempDir::new().unwrap();
        let package = create_test_package(temp.path(), "pkg.Appx");

        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();
        let progress: ProgressCallback = Arc::new(move |current, total| {
            reports_clone.lock().unwrap().push((current, total));
        });

        extract_archive(&package, temp.path().join("out"), Some(progress)).unwrap();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.first().map(|r| r.0), Some(0));
        let last = reports.last().unwrap();
        assert_eq!(last.0, last.1);
        assert!(last.1 > 0);
    }

    // ============================================================================
    // Directory moves
    // ============================================================================

    #[test]
    fn test_move_dir_and_copy() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested").join("a.txt"), b"a").unwrap();
        fs::write(src.join("b.txt"), b"b").unwrap();

        let copy = temp.path().join("copy");
        assert_eq!(copy_dir_recursive(&src, &copy).unwrap(), 2);
        assert_eq!(fs::read(copy.join("nested").join("a.txt")).unwrap(), b"a");

        let moved = temp.path().join("deep").join("moved");
        assert!(move_dir(&src, &moved).unwrap());
        assert!(!src.exists());
        assert_eq!(fs::read(moved.join("b.txt")).unwrap(), b"b");
    }

    #[test]
    fn test_move_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a");
        let dst = temp.path().join("b");
        fs::write(&src, b"x").unwrap();
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"x");
    }
}
