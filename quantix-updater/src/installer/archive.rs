//! Archive installer
//!
//! Extracts a zip or gzip-compressed tar package over the target directory.
//! The format is taken from the file's magic bytes, not its name, since the
//! downloaded package lands in a temp file with a generated name.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::ZipArchive;

use super::PackageInstaller;
use crate::component::{Component, ComponentState, Lifecycle, OperationContext, ProgressReporter};
use crate::dispatch::Dispatcher;
use crate::error::UpdateError;
use crate::sync::lock;

/// Supported package formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Identify an archive from its leading bytes.
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") {
            Some(ArchiveFormat::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }

    /// Read the header of `path` and identify it.
    pub fn detect(path: &Path) -> Result<Self> {
        let mut header = [0u8; 4];
        let mut file =
            File::open(path).with_context(|| format!("Failed to open package {}", path.display()))?;
        let n = read_up_to(&mut file, &mut header)?;
        Self::from_magic(&header[..n])
            .ok_or_else(|| anyhow!("Unsupported package format: {}", path.display()))
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone)]
struct InstallTarget {
    package_file: PathBuf,
    target_directory: PathBuf,
}

/// Installer that unpacks zip and tar.gz packages.
pub struct ArchiveInstaller {
    lifecycle: Lifecycle,
    target: Mutex<Option<InstallTarget>>,
    installed: Arc<Mutex<Vec<PathBuf>>>,
}

impl ArchiveInstaller {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            lifecycle: Lifecycle::new("archive-installer", dispatcher),
            target: Mutex::new(None),
            installed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Component for ArchiveInstaller {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(&self) -> bool {
        let target = lock(&self.target).clone();
        let validation = match &target {
            None => Err("package file and target directory are not configured".to_string()),
            Some(t) if !t.package_file.is_file() => {
                Err(format!("package file {} does not exist", t.package_file.display()))
            }
            Some(_) => Ok(()),
        };
        let installed = Arc::clone(&self.installed);

        self.lifecycle
            .start(validation, move |ctx| install(ctx, target, installed))
    }
}

async fn install(
    ctx: OperationContext,
    target: Option<InstallTarget>,
    installed: Arc<Mutex<Vec<PathBuf>>>,
) -> Result<()> {
    let target = target.ok_or_else(|| anyhow!("installer is not configured"))?;
    let token = ctx.token().clone();
    let reporter = ctx.reporter();

    tokio::task::spawn_blocking(move || extract_package(&target, &token, &reporter, &installed))
        .await
        .context("Extraction worker panicked")??;

    ctx.report_progress(1.0);
    Ok(())
}

impl PackageInstaller for ArchiveInstaller {
    fn configure(&self, package_file: &Path, target_directory: &Path) -> Result<(), UpdateError> {
        if self.state() != ComponentState::Initializing {
            return Err(UpdateError::InvalidState(
                "installer can only be configured before start".into(),
            ));
        }
        *lock(&self.target) = Some(InstallTarget {
            package_file: package_file.to_path_buf(),
            target_directory: target_directory.to_path_buf(),
        });
        Ok(())
    }

    fn installed_file_paths(&self) -> Vec<PathBuf> {
        let recorded = lock(&self.installed);
        let mut seen = HashSet::with_capacity(recorded.len());
        recorded
            .iter()
            .filter(|p| seen.insert(p.as_path()))
            .cloned()
            .collect()
    }
}

fn extract_package(
    target: &InstallTarget,
    token: &CancellationToken,
    reporter: &ProgressReporter,
    installed: &Mutex<Vec<PathBuf>>,
) -> Result<()> {
    let format = ArchiveFormat::detect(&target.package_file)?;
    info!(
        package = %target.package_file.display(),
        target = %target.target_directory.display(),
        format = ?format,
        "Extracting package"
    );

    fs::create_dir_all(&target.target_directory).with_context(|| {
        format!("Failed to create {}", target.target_directory.display())
    })?;

    match format {
        ArchiveFormat::Zip => extract_zip(target, token, reporter, installed),
        ArchiveFormat::TarGz => extract_tar_gz(target, token, reporter, installed),
    }
}

fn extract_zip(
    target: &InstallTarget,
    token: &CancellationToken,
    reporter: &ProgressReporter,
    installed: &Mutex<Vec<PathBuf>>,
) -> Result<()> {
    let file = File::open(&target.package_file)?;
    let mut archive = ZipArchive::new(file).context("Failed to read zip archive")?;
    let total = archive.len();

    for i in 0..total {
        check_cancelled(token)?;

        let mut entry = archive.by_index(i).context("Corrupt zip entry")?;
        let relative = entry
            .enclosed_name()
            .and_then(|p| clean_relative(&p))
            .ok_or_else(|| anyhow!("Archive entry '{}' escapes the target directory", entry.name()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let out_path = target.target_directory.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("Failed to create {}", out_path.display()))?;
        } else if entry.is_symlink() {
            let mut link_target = String::new();
            entry
                .read_to_string(&mut link_target)
                .with_context(|| format!("Failed to read link target of '{}'", entry.name()))?;
            if !link_stays_inside(&relative, Path::new(&link_target)) {
                bail!(
                    "Archive link '{}' -> '{}' escapes the target directory",
                    entry.name(),
                    link_target
                );
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            record(installed, &out_path);
            write_symlink(&link_target, &out_path)
                .with_context(|| format!("Failed to create link {}", out_path.display()))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            // Record first so a half-written file is still rolled back.
            record(installed, &out_path);
            let mut out = File::create(&out_path)
                .with_context(|| format!("Failed to create {}", out_path.display()))?;
            io::copy(&mut entry, &mut out)
                .with_context(|| format!("Failed to write {}", out_path.display()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))?;
                }
            }
        }

        reporter.report((i + 1) as f64 / total as f64);
    }

    debug!(entries = total, "Zip extraction complete");
    Ok(())
}

fn extract_tar_gz(
    target: &InstallTarget,
    token: &CancellationToken,
    reporter: &ProgressReporter,
    installed: &Mutex<Vec<PathBuf>>,
) -> Result<()> {
    let file = File::open(&target.package_file)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    // Entry count is unknown without decompressing twice.
    reporter.report(f64::NAN);

    let mut count = 0u64;
    for entry in archive.entries().context("Failed to read tar archive")? {
        check_cancelled(token)?;

        let mut entry = entry.context("Corrupt tar entry")?;
        let raw = entry.path().context("Invalid tar entry path")?.into_owned();
        let relative = clean_relative(&raw)
            .ok_or_else(|| anyhow!("Archive entry '{}' escapes the target directory", raw.display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        if !entry.header().entry_type().is_dir() {
            record(installed, &target.target_directory.join(&relative));
        }
        let unpacked = entry
            .unpack_in(&target.target_directory)
            .with_context(|| format!("Failed to unpack {}", raw.display()))?;
        if !unpacked {
            bail!("Archive entry '{}' escapes the target directory", raw.display());
        }
        count += 1;
    }

    debug!(entries = count, "Tar extraction complete");
    Ok(())
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(UpdateError::Cancelled.into());
    }
    Ok(())
}

fn record(installed: &Mutex<Vec<PathBuf>>, path: &Path) {
    lock(installed).push(path.to_path_buf());
}

/// Whether a link at `link` (relative to the target directory) pointing at
/// `link_target` resolves inside the target directory, judged lexically.
fn link_stays_inside(link: &Path, link_target: &Path) -> bool {
    let mut depth = link.components().count().saturating_sub(1);
    for component in link_target.components() {
        match component {
            PathComponent::Normal(_) => depth += 1,
            PathComponent::CurDir => {}
            PathComponent::ParentDir if depth > 0 => depth -= 1,
            _ => return false,
        }
    }
    true
}

#[cfg(unix)]
fn write_symlink(link_target: &str, path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(link_target, path)
}

// No portable symlinks: keep the target path as file content.
#[cfg(not(unix))]
fn write_symlink(link_target: &str, path: &Path) -> io::Result<()> {
    fs::write(path, link_target)
}

/// Strip `.` components. `None` if the path is absolute or climbs out.
fn clean_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            PathComponent::Normal(part) => out.push(part),
            PathComponent::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::start_and_wait;
    use crate::dispatch::ImmediateDispatcher;
    use crate::error::{is_cancellation, WaitError};
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        zip.add_directory("empty/", options).unwrap();
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn build_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let encoder = flate2::write::GzEncoder::new(File::create(path).unwrap(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn sorted(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
        paths.sort();
        paths
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ArchiveFormat::from_magic(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_magic(&[0x1f, 0x8b, 0x08]), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_magic(b"ELF"), None);
        assert_eq!(ArchiveFormat::from_magic(b""), None);
    }

    #[test]
    fn test_clean_relative() {
        assert_eq!(clean_relative(Path::new("./bin/tool")), Some(PathBuf::from("bin/tool")));
        assert_eq!(clean_relative(Path::new("./")), Some(PathBuf::new()));
        assert_eq!(clean_relative(Path::new("../etc/passwd")), None);
        assert_eq!(clean_relative(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_link_stays_inside() {
        assert!(link_stays_inside(Path::new("bin/current"), Path::new("../lib/core.so")));
        assert!(link_stays_inside(Path::new("latest"), Path::new("./releases/2.0")));
        assert!(!link_stays_inside(Path::new("bin/current"), Path::new("../../etc/passwd")));
        assert!(!link_stays_inside(Path::new("latest"), Path::new("/etc/passwd")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zip_symlinks_are_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg.bin");
        let mut zip = zip::ZipWriter::new(File::create(&package).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file("lib/core.so.2", options).unwrap();
        zip.write_all(b"\x7fELF").unwrap();
        zip.add_symlink("lib/core.so", "core.so.2", options).unwrap();
        zip.finish().unwrap();
        let target = dir.path().join("app");

        let installer = ArchiveInstaller::new(ImmediateDispatcher::shared());
        installer.configure(&package, &target).unwrap();
        start_and_wait(&installer, &CancellationToken::new()).await.unwrap();

        let link = target.join("lib/core.so");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("core.so.2"));
        assert_eq!(fs::read(&link).unwrap(), b"\x7fELF");
        assert!(installer.installed_file_paths().contains(&link));
    }

    #[tokio::test]
    async fn test_zip_symlink_escaping_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg.bin");
        let mut zip = zip::ZipWriter::new(File::create(&package).unwrap());
        zip.add_symlink("etc", "../../etc", SimpleFileOptions::default()).unwrap();
        zip.finish().unwrap();
        let target = dir.path().join("app");

        let installer = ArchiveInstaller::new(ImmediateDispatcher::shared());
        installer.configure(&package, &target).unwrap();
        let outcome = start_and_wait(&installer, &CancellationToken::new()).await;
        assert!(matches!(outcome, Err(WaitError::Failed(_))));
        assert!(fs::symlink_metadata(target.join("etc")).is_err());
    }

    #[tokio::test]
    async fn test_zip_install() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg.bin");
        build_zip(&package, &[("app.conf", b"mode=prod"), ("lib/core.so", b"\x7fELF")]);
        let target = dir.path().join("app");

        let installer = ArchiveInstaller::new(ImmediateDispatcher::shared());
        installer.configure(&package, &target).unwrap();
        let state = start_and_wait(&installer, &CancellationToken::new()).await.unwrap();
        assert_eq!(state, ComponentState::Succeeded);

        assert_eq!(
            sorted(installer.installed_file_paths()),
            vec![target.join("app.conf"), target.join("lib/core.so")]
        );
        assert_eq!(fs::read(target.join("lib/core.so")).unwrap(), b"\x7fELF");
        assert!(target.join("empty").is_dir());
        assert_eq!(installer.progress().value(), Some(1.0));
    }

    #[tokio::test]
    async fn test_tar_gz_install() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg.bin");
        build_tar_gz(&package, &[("./bin/tool", b"#!/bin/sh\n"), ("share/readme", b"hi")]);
        let target = dir.path().join("app");

        let installer = ArchiveInstaller::new(ImmediateDispatcher::shared());
        installer.configure(&package, &target).unwrap();
        start_and_wait(&installer, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            sorted(installer.installed_file_paths()),
            vec![target.join("bin/tool"), target.join("share/readme")]
        );
        assert_eq!(fs::read_to_string(target.join("share/readme")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unknown_format_fails() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg.bin");
        fs::write(&package, b"definitely not an archive").unwrap();

        let installer = ArchiveInstaller::new(ImmediateDispatcher::shared());
        installer.configure(&package, dir.path()).unwrap();
        let outcome = start_and_wait(&installer, &CancellationToken::new()).await;
        assert!(matches!(outcome, Err(WaitError::Failed(_))));
        assert!(installer.installed_file_paths().is_empty());
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let installer = ArchiveInstaller::new(ImmediateDispatcher::shared());
        assert!(!installer.start());

        let dir = tempfile::tempdir().unwrap();
        installer.configure(&dir.path().join("missing.zip"), dir.path()).unwrap();
        assert!(!installer.start());
        assert_eq!(installer.state(), ComponentState::Initializing);
    }

    #[test]
    fn test_cancelled_before_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg.bin");
        build_zip(&package, &[("a.txt", b"a")]);
        let target = InstallTarget {
            package_file: package,
            target_directory: dir.path().join("app"),
        };

        let token = CancellationToken::new();
        token.cancel();
        let reporter = Lifecycle::new("test", ImmediateDispatcher::shared()).reporter();
        let installed = Mutex::new(Vec::new());

        let err = extract_package(&target, &token, &reporter, &installed).unwrap_err();
        assert!(is_cancellation(&err));
        assert!(installed.lock().unwrap().is_empty());
    }
}
