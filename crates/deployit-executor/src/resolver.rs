//! Build directory resolution.
//!
//! Finds the directory a deployment should be built from: the clone root, a
//! literal relative path, or the shallowest directory with the requested name.

use deployit_core::pipeline::StageError;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::workspace::is_within;

/// Default search depth below the clone root.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Dependency caches that never contain a build directory.
pub const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "bower_components",
    "vendor",
    "target",
    "__pycache__",
];

/// How a build directory was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No target was given; the clone root is used.
    Root,
    /// The target was an existing relative path.
    Direct,
    /// The target was found by name at the given depth.
    Search { depth: usize },
}

/// A resolved build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDir {
    pub path: PathBuf,
    pub resolution: Resolution,
}

/// Breadth-first build directory resolver.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    max_depth: usize,
}

impl Default for DirectoryResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl DirectoryResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Resolve `target` below `root`.
    ///
    /// A literal path wins over a search hit. The search never follows
    /// symbolic links, skips hidden and dependency-cache directories, and
    /// walks siblings in name order. A literal path that leads outside
    /// `root` is not accepted.
    pub async fn resolve(&self, root: &Path, target: &str) -> Result<ResolvedDir, StageError> {
        let target = target.trim().trim_matches('/');
        if target.is_empty() {
            return Ok(ResolvedDir {
                path: root.to_path_buf(),
                resolution: Resolution::Root,
            });
        }

        let direct = root.join(target);
        if is_dir(&direct).await {
            if is_within(&direct, root).await {
                info!(path = %direct.display(), "Build directory found at direct path");
                return Ok(ResolvedDir {
                    path: direct,
                    resolution: Resolution::Direct,
                });
            }
            warn!(path = %direct.display(), "Build path leads outside the repository");
        }

        if let Some((path, depth)) = self.search(root, target).await {
            info!(path = %path.display(), depth, "Build directory found by search");
            return Ok(ResolvedDir {
                path,
                resolution: Resolution::Search { depth },
            });
        }

        Err(StageError::DirectoryNotFound {
            target: target.to_string(),
            available: top_level_dirs(root).await,
        })
    }

    async fn search(&self, root: &Path, target: &str) -> Option<(PathBuf, usize)> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);

        while let Some((dir, depth)) = queue.pop_front() {
            let Ok(canonical) = fs::canonicalize(&dir).await else {
                continue;
            };
            if !visited.insert(canonical) {
                debug!(path = %dir.display(), "Skipping already visited directory");
                continue;
            }

            let names = match sorted_entry_names(&dir).await {
                Ok(names) => names,
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "Cannot read directory");
                    continue;
                }
            };

            for name in names {
                if is_skipped(&name) {
                    continue;
                }
                let path = dir.join(&name);
                if !is_real_dir(&path).await {
                    continue;
                }
                let child_depth = depth + 1;
                if name == target {
                    return Some((path, child_depth));
                }
                if child_depth < self.max_depth {
                    queue.push_back((path, child_depth));
                }
            }
        }
        None
    }
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || SKIPPED_DIRS.contains(&name)
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// A directory that is not itself a symbolic link.
async fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn sorted_entry_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Sorted names of the non-hidden directories directly under `root`.
pub async fn top_level_dirs(root: &Path) -> Vec<String> {
    let Ok(names) = sorted_entry_names(root).await else {
        return Vec::new();
    };
    let mut dirs = Vec::new();
    for name in names {
        if !name.starts_with('.') && is_real_dir(&root.join(&name)).await {
            dirs.push(name);
        }
    }
    dirs
}
