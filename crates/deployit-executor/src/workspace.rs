//! Workspace file operations: clone and artifact directories.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory names never copied into an artifact directory.
const EXCLUDED_FROM_ARTIFACTS: &[&str] = &[".git"];

/// Remove `path` recursively. Returns whether anything was removed.
pub async fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed directory");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Sorted entry names directly under `dir`, directories suffixed with `/`.
pub async fn list_entries(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Whether `path` resolves, after following every link, to a location
/// inside `root`.
pub async fn is_within(path: &Path, root: &Path) -> bool {
    match (fs::canonicalize(path).await, fs::canonicalize(root).await) {
        (Ok(path), Ok(root)) => path.starts_with(root),
        _ => false,
    }
}

/// First of `candidates` that exists as a directory directly under `dir`
/// and stays inside `root`. Candidates linking elsewhere are skipped.
pub async fn locate_output(dir: &Path, candidates: &[String], root: &Path) -> Option<PathBuf> {
    for name in candidates {
        let path = dir.join(name);
        if !fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            continue;
        }
        if !is_within(&path, root).await {
            warn!(path = %path.display(), "Ignoring output directory outside the workspace");
            continue;
        }
        return Some(path);
    }
    None
}

/// Copy the tree under `src` into `dst`, preserving relative paths.
///
/// Symbolic links and `.git` are not copied. Returns the number of files
/// copied.
pub async fn copy_tree(src: &Path, dst: &Path) -> io::Result<usize> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst))
        .await
        .map_err(io::Error::other)?
}

fn copy_tree_blocking(src: &Path, dst: &Path) -> io::Result<usize> {
    // The walk root is always followed, so start from its real location.
    let src = &std::fs::canonicalize(src)?;
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !EXCLUDED_FROM_ARTIFACTS.contains(&e.file_name().to_string_lossy().as_ref())
        });

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(copied)
}

/// Regular files under `root`, relative to it, in sorted order.
pub async fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(io::Error::other)?;
                files.push(relative.to_path_buf());
            }
        }
        Ok(files)
    })
    .await
    .map_err(io::Error::other)?
}
