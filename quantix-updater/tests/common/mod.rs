//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quantix_updater::component::OperationContext;
use quantix_updater::{
    Component, Dispatcher, Lifecycle, PackageInstaller, UpdateError, Updater, UpdaterState,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;

/// Every file and directory under a root, keyed by relative path.
/// Directories map to `None`.
pub type TreeSnapshot = BTreeMap<PathBuf, Option<Vec<u8>>>;

pub fn snapshot(root: &Path) -> TreeSnapshot {
    let mut tree = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap().to_path_buf();
            if entry.file_type().unwrap().is_dir() {
                tree.insert(relative, None);
                pending.push(path);
            } else {
                tree.insert(relative, Some(fs::read(&path).unwrap()));
            }
        }
    }
    tree
}

/// Regular files under `root`, as absolute paths.
pub fn files_under(root: &Path) -> Vec<PathBuf> {
    snapshot(root)
        .into_iter()
        .filter(|(_, content)| content.is_some())
        .map(|(relative, _)| root.join(relative))
        .collect()
}

/// Populate `root` with `count` random files spread over nested directories.
pub fn populate_random_tree(root: &Path, count: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..count {
        let depth = rng.gen_range(0..3);
        let mut path = root.to_path_buf();
        for level in 0..depth {
            path.push(format!("dir{}_{}", level, rng.gen_range(0..3)));
        }
        fs::create_dir_all(&path).unwrap();
        path.push(format!("file{:03}.dat", i));

        let mut data = vec![0u8; rng.gen_range(16..4096)];
        rng.fill(&mut data[..]);
        fs::write(&path, data).unwrap();
    }
    fs::create_dir_all(root.join("empty_dir")).unwrap();
}

/// Random package contents: `count` files of `size` bytes.
pub fn random_files(count: usize, size: usize, seed: u64) -> Vec<(String, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut data = vec![0u8; size];
            rng.fill(&mut data[..]);
            (format!("lib/module{:02}/part{:03}.bin", i % 5, i), data)
        })
        .collect()
}

/// Write a zip holding `files`, stored uncompressed.
pub fn build_zip(path: &Path, files: &[(String, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        zip.start_file(name.as_str(), options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Whether `dir` has no entries.
pub fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
}

/// Wait for the updater to finish, failing the test after a minute.
pub async fn finish(updater: &Updater) -> UpdaterState {
    tokio::time::timeout(Duration::from_secs(60), updater.wait_until_finished())
        .await
        .expect("update did not finish in time")
}

/// How a [`ScriptedInstaller`] ends after writing its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerScript {
    Fail,
    WaitForCancel,
}

/// Installer that overwrites and creates a fixed set of files, then fails
/// or waits to be cancelled.
pub struct ScriptedInstaller {
    lifecycle: Lifecycle,
    script: InstallerScript,
    writes: Vec<(PathBuf, Vec<u8>)>,
    extra_dirs: Vec<PathBuf>,
    target: Mutex<Option<PathBuf>>,
    installed: Arc<Mutex<Vec<PathBuf>>>,
    /// Signalled once every file has been written
    pub written: Arc<Notify>,
}

impl ScriptedInstaller {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        script: InstallerScript,
        writes: Vec<(PathBuf, Vec<u8>)>,
        extra_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("scripted-installer", dispatcher),
            script,
            writes,
            extra_dirs,
            target: Mutex::new(None),
            installed: Arc::new(Mutex::new(Vec::new())),
            written: Arc::new(Notify::new()),
        }
    }
}

impl Component for ScriptedInstaller {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(&self) -> bool {
        let target = self.target.lock().unwrap().clone();
        let validation = target.clone().map(|_| ()).ok_or_else(|| "not configured".to_string());
        let target = target.unwrap_or_default();
        let writes = self.writes.clone();
        let extra_dirs = self.extra_dirs.clone();
        let installed = Arc::clone(&self.installed);
        let written = Arc::clone(&self.written);
        let script = self.script;

        self.lifecycle.start(validation, move |ctx| {
            run_script(ctx, script, target, writes, extra_dirs, installed, written)
        })
    }
}

async fn run_script(
    ctx: OperationContext,
    script: InstallerScript,
    target: PathBuf,
    writes: Vec<(PathBuf, Vec<u8>)>,
    extra_dirs: Vec<PathBuf>,
    installed: Arc<Mutex<Vec<PathBuf>>>,
    written: Arc<Notify>,
) -> anyhow::Result<()> {
    for dir in &extra_dirs {
        fs::create_dir_all(target.join(dir))?;
    }
    for (relative, data) in &writes {
        let path = target.join(relative);
        fs::create_dir_all(path.parent().unwrap())?;
        installed.lock().unwrap().push(path.clone());
        fs::write(&path, data)?;
    }
    ctx.report_progress(0.5);
    written.notify_one();

    match script {
        InstallerScript::Fail => Err(anyhow::anyhow!("disk quota exceeded")),
        InstallerScript::WaitForCancel => {
            ctx.token().cancelled().await;
            Err(UpdateError::Cancelled.into())
        }
    }
}

impl PackageInstaller for ScriptedInstaller {
    fn configure(&self, _package_file: &Path, target_directory: &Path) -> Result<(), UpdateError> {
        *self.target.lock().unwrap() = Some(target_directory.to_path_buf());
        Ok(())
    }

    fn installed_file_paths(&self) -> Vec<PathBuf> {
        self.installed.lock().unwrap().clone()
    }
}
