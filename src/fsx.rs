//! Filesystem helpers: deep copy, tolerant removal, and the existence-based
//! directory overlay used by the install cache.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively copy `src` into `dest`, creating `dest` as needed.
///
/// Symlinks are followed; file contents and names are copied, nothing else.
pub fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a single file, treating "already gone" as success.
pub fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Extract a zip archive into `dest`, creating it as needed.
pub fn extract_zip(archive: &Path, dest: &Path) -> io::Result<()> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(io::Error::other)?;
    fs::create_dir_all(dest)?;
    zip.extract(dest).map_err(io::Error::other)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    Dir,
    File,
}

/// One path present in the updated tree but absent from the pristine tree.
#[derive(Debug, Clone)]
pub struct OverlayEntry {
    /// Relative to the updated tree's root.
    pub path: PathBuf,
    pub kind: OverlayKind,
}

/// Collect the overlay of `updated` over `pristine`.
///
/// Existence-based by design: a path counts as new only if the pristine tree
/// has no entry at the same relative location. Files that exist in both trees
/// with different contents are NOT part of the overlay.
pub fn collect_overlay(updated: &Path, pristine: &Path) -> io::Result<Vec<OverlayEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(updated).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(updated)
            .map_err(io::Error::other)?;
        if pristine.join(rel).exists() {
            continue;
        }
        let kind = if entry.file_type().is_dir() {
            OverlayKind::Dir
        } else {
            OverlayKind::File
        };
        entries.push(OverlayEntry {
            path: rel.to_path_buf(),
            kind,
        });
    }
    Ok(entries)
}

/// Apply collected overlay entries, copying from `from_root` into `dest_root`.
pub fn apply_overlay(
    entries: &[OverlayEntry],
    from_root: &Path,
    dest_root: &Path,
) -> io::Result<()> {
    for entry in entries {
        let target = dest_root.join(&entry.path);
        match entry.kind {
            OverlayKind::Dir => fs::create_dir_all(&target)?,
            OverlayKind::File => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(from_root.join(&entry.path), &target)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn copy_dir_is_deep() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write(src.path(), "a.txt", "a");
        write(src.path(), "sub/deeper/b.txt", "b");
        fs::create_dir_all(src.path().join("empty")).unwrap();

        copy_dir(src.path(), &dest.path().join("out")).unwrap();

        let out = dest.path().join("out");
        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "a");
        assert_eq!(
            fs::read_to_string(out.join("sub/deeper/b.txt")).unwrap(),
            "b"
        );
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn remove_dir_tolerates_missing() {
        let dir = tempdir().unwrap();
        remove_dir(&dir.path().join("never-created")).unwrap();
    }

    #[test]
    fn extract_zip_restores_tree() {
        use std::io::Write as _;
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.add_directory("plugin", options).unwrap();
        writer.start_file("plugin/load.php", options).unwrap();
        writer.write_all(b"<?php load").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("out");
        extract_zip(&archive, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("plugin/load.php")).unwrap(),
            "<?php load"
        );
    }

    #[test]
    fn overlay_contains_only_new_paths() {
        let pristine = tempdir().unwrap();
        let updated = tempdir().unwrap();
        write(pristine.path(), "kept.txt", "old");
        write(updated.path(), "kept.txt", "CHANGED");
        write(updated.path(), "new.txt", "new");
        write(updated.path(), "plugins/extra/main.txt", "x");

        let entries = collect_overlay(updated.path(), pristine.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();

        // Changed-in-place files are invisible to the existence check.
        assert!(!paths.contains(&PathBuf::from("kept.txt")));
        assert!(paths.contains(&PathBuf::from("new.txt")));
        assert!(paths.contains(&PathBuf::from("plugins/extra/main.txt")));
        assert!(paths.contains(&PathBuf::from("plugins")));
    }

    #[test]
    fn overlay_round_trip() {
        let pristine = tempdir().unwrap();
        let updated = tempdir().unwrap();
        let restored = tempdir().unwrap();
        write(pristine.path(), "base.txt", "base");
        write(updated.path(), "base.txt", "base");
        write(updated.path(), "added/one.txt", "1");
        write(updated.path(), "added/two.txt", "2");

        let entries = collect_overlay(updated.path(), pristine.path()).unwrap();
        apply_overlay(&entries, updated.path(), restored.path()).unwrap();

        assert_eq!(
            fs::read_to_string(restored.path().join("added/one.txt")).unwrap(),
            "1"
        );
        assert_eq!(
            fs::read_to_string(restored.path().join("added/two.txt")).unwrap(),
            "2"
        );
        assert!(!restored.path().join("base.txt").exists());
    }
}
