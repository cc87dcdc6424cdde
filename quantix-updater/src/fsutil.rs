//! Filesystem helpers for backup, rollback and cleanup.

use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::UpdateError;

/// How `copy_tree` reacts to a per-file error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Stop at the first error (backups, where a partial copy is useless)
    AbortOnError,
    /// Log and keep going (rollback, where every restored file counts)
    ContinueOnError,
}

/// Totals from a tree copy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub bytes: u64,
    pub failures: u64,
    /// FIFOs, sockets and device nodes, which are never copied
    pub skipped: u64,
}

/// Recursively copy `src` into `dest`, overwriting existing files.
///
/// When a token is given it is checked after every file; cancellation
/// surfaces as [`UpdateError::Cancelled`].
pub async fn copy_tree(
    src: &Path,
    dest: &Path,
    mode: CopyMode,
    token: Option<&CancellationToken>,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    copy_dir(src, dest, mode, token, &mut stats).await?;
    debug!(
        src = %src.display(),
        dest = %dest.display(),
        files = stats.files,
        bytes = stats.bytes,
        failures = stats.failures,
        "Tree copied"
    );
    Ok(stats)
}

fn copy_dir<'a>(
    src: &'a Path,
    dest: &'a Path,
    mode: CopyMode,
    token: Option<&'a CancellationToken>,
    stats: &'a mut CopyStats,
) -> BoxFuture<'a, Result<()>> {
    async move {
        if let Err(e) = fs::create_dir_all(dest).await {
            return on_error(mode, stats, dest, e.into());
        }

        let mut entries = match fs::read_dir(src).await {
            Ok(entries) => entries,
            Err(e) => return on_error(mode, stats, src, e.into()),
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return on_error(mode, stats, src, e.into()),
            };
            let entry_path = entry.path();
            let dest_path = dest.join(entry.file_name());

            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) => {
                    on_error(mode, stats, &entry_path, e.into())?;
                    continue;
                }
            };

            if file_type.is_dir() {
                copy_dir(&entry_path, &dest_path, mode, token, stats).await?;
                continue;
            }

            if !file_type.is_file() && !file_type.is_symlink() {
                // Reading a FIFO would block the copy indefinitely
                warn!(path = %entry_path.display(), "Skipping special file");
                stats.skipped += 1;
                continue;
            }

            let copied = if file_type.is_symlink() {
                copy_symlink(&entry_path, &dest_path).await.map(|_| 0)
            } else {
                fs::copy(&entry_path, &dest_path).await
            };

            match copied {
                Ok(bytes) => {
                    stats.files += 1;
                    stats.bytes += bytes;
                }
                Err(e) => {
                    let err = anyhow::Error::new(e)
                        .context(format!("Failed to copy {}", entry_path.display()));
                    on_error(mode, stats, &entry_path, err)?;
                }
            }

            if token.map(|t| t.is_cancelled()).unwrap_or(false) {
                return Err(UpdateError::Cancelled.into());
            }
        }

        Ok(())
    }
    .boxed()
}

fn on_error(mode: CopyMode, stats: &mut CopyStats, path: &Path, err: anyhow::Error) -> Result<()> {
    stats.failures += 1;
    match mode {
        CopyMode::AbortOnError => Err(err),
        CopyMode::ContinueOnError => {
            warn!(path = %path.display(), error = %format!("{:#}", err), "Copy failed, continuing");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    let target = fs::read_link(src).await?;
    if fs::symlink_metadata(dest).await.is_ok() {
        fs::remove_file(dest).await?;
    }
    fs::symlink(target, dest).await
}

#[cfg(not(unix))]
async fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest).await.map(|_| ())
}

/// Totals from a best-effort removal
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemovalStats {
    pub removed: u64,
    /// Paths outside the root, which are never touched
    pub skipped: u64,
    pub failed: u64,
}

/// Whether `path` lies strictly inside `root`, judged lexically.
pub fn is_within(path: &Path, root: &Path) -> bool {
    path != root
        && path.starts_with(root)
        && !path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Delete each file in `paths` that lies under `root`. Missing files count as
/// removed; failures are logged and skipped.
pub async fn remove_paths_best_effort(paths: &[PathBuf], root: &Path) -> RemovalStats {
    let mut stats = RemovalStats::default();

    for path in paths {
        if !is_within(path, root) {
            warn!(path = %path.display(), root = %root.display(), "Refusing to delete path outside the application directory");
            stats.skipped += 1;
            continue;
        }

        match fs::remove_file(path).await {
            Ok(()) => stats.removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => stats.removed += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete installed file");
                stats.failed += 1;
            }
        }
    }

    stats
}

/// Remove directories under `root` that are empty and have no counterpart
/// in `reference` (the backup). Deepest directories go first so emptied
/// parents are swept too. Symlinked directories are not followed.
pub async fn sweep_empty_dirs(root: &Path, reference: &Path) -> usize {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                pending.push(entry.path());
                found.push(entry.path());
            }
        }
    }
    found.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut swept = 0;
    for dir in found {
        let Ok(relative) = dir.strip_prefix(root) else {
            continue;
        };
        if fs::symlink_metadata(reference.join(relative)).await.is_ok() {
            continue;
        }
        if !dir_is_empty(&dir).await {
            continue;
        }
        match fs::remove_dir(&dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed empty directory");
                swept += 1;
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove empty directory"),
        }
    }

    swept
}

async fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// A fresh path under `dir`, keyed by a UTC timestamp plus a random suffix
/// so concurrent attempts never collide.
pub fn unique_temp_path(dir: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("{}-{}-{}{}", prefix, timestamp, &nonce[..12], suffix))
}

/// Make sure `dir` exists.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

/// Delete a directory tree, logging instead of failing.
pub async fn remove_tree_best_effort(path: &Path) -> bool {
    match fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
            false
        }
    }
}

/// Delete a file, logging instead of failing.
pub async fn remove_file_best_effort(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_cancellation;

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::create_dir_all(root.join("share/doc")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("bin/app"), b"binary").unwrap();
        std::fs::write(root.join("share/doc/README"), b"docs").unwrap();
        std::fs::write(root.join("VERSION"), b"1.0.0").unwrap();
    }

    #[tokio::test]
    async fn test_copy_tree_copies_everything() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        populate(src.path());
        std::fs::write(dest.path().join("VERSION"), b"0.9.0").unwrap();

        let stats = copy_tree(src.path(), dest.path(), CopyMode::AbortOnError, None)
            .await
            .unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.bytes, 6 + 4 + 5);
        assert_eq!(std::fs::read(dest.path().join("VERSION")).unwrap(), b"1.0.0");
        assert_eq!(std::fs::read(dest.path().join("share/doc/README")).unwrap(), b"docs");
        assert!(dest.path().join("empty").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_tree_skips_special_files() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        populate(src.path());
        let _listener = std::os::unix::net::UnixListener::bind(src.path().join("share/app.sock")).unwrap();

        let stats = copy_tree(src.path(), dest.path(), CopyMode::AbortOnError, None)
            .await
            .unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failures, 0);
        assert!(!dest.path().join("share/app.sock").exists());
        assert_eq!(std::fs::read(dest.path().join("bin/app")).unwrap(), b"binary");
    }

    #[tokio::test]
    async fn test_copy_tree_observes_cancellation() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        populate(src.path());

        let token = CancellationToken::new();
        token.cancel();
        let err = copy_tree(src.path(), dest.path(), CopyMode::AbortOnError, Some(&token))
            .await
            .unwrap_err();
        assert!(is_cancellation(&err));
    }

    #[tokio::test]
    async fn test_copy_tree_modes_on_missing_source() {
        let dest = tempfile::tempdir().unwrap();
        let missing = dest.path().join("missing");

        assert!(copy_tree(&missing, dest.path(), CopyMode::AbortOnError, None).await.is_err());

        let stats = copy_tree(&missing, dest.path(), CopyMode::ContinueOnError, None)
            .await
            .unwrap();
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_remove_paths_respects_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        populate(root.path());
        std::fs::write(outside.path().join("keep"), b"x").unwrap();

        let paths = vec![
            root.path().join("bin/app"),
            root.path().join("bin/never-existed"),
            outside.path().join("keep"),
            root.path().join("../escape"),
        ];
        let stats = remove_paths_best_effort(&paths, root.path()).await;

        assert_eq!(stats.removed, 2);
        assert_eq!(stats.skipped, 2);
        assert!(!root.path().join("bin/app").exists());
        assert!(outside.path().join("keep").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_new_empty_dirs() {
        let root = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        populate(root.path());
        populate(backup.path());

        std::fs::create_dir_all(root.path().join("plugins/extra")).unwrap();
        std::fs::create_dir_all(root.path().join("cache")).unwrap();
        std::fs::create_dir_all(root.path().join("logs")).unwrap();
        std::fs::write(root.path().join("logs/today.log"), b"x").unwrap();
        std::fs::remove_file(root.path().join("bin/app")).unwrap();

        let swept = sweep_empty_dirs(root.path(), backup.path()).await;

        assert_eq!(swept, 3);
        assert!(!root.path().join("plugins").exists());
        assert!(!root.path().join("cache").exists());
        assert!(root.path().join("logs/today.log").exists());
        assert!(root.path().join("bin").is_dir());
        assert!(root.path().join("empty").is_dir());
    }

    #[test]
    fn test_unique_temp_paths_differ() {
        let dir = Path::new("/tmp");
        let a = unique_temp_path(dir, "qx-package", ".pkg");
        let b = unique_temp_path(dir, "qx-package", ".pkg");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("qx-package-"));
        assert!(name.ends_with(".pkg"));
    }
}
