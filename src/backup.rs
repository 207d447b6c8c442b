//! Snapshot and restore of a server's data directory.
//!
//! Archives are zip files named `<instance_id>-<YYYYmmdd-HHMMSS>.zip` in the
//! configured backup directory. Both operations take the instance lock through
//! the lifecycle engine, so they never overlap a start, stop or update of the
//! same server.

use crate::error::{Error, Result};
use crate::server::{
    Actor, InstanceId, InstancePatch, LifecycleEngine, Operation, OperationScope, ServerStatus,
};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
/// `-YYYYmmdd-HHMMSS`
const SUFFIX_LEN: usize = 16;

/// One archive in the backup directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    /// Instance the archive was taken from
    pub instance_id: InstanceId,
    /// Local creation time, from the file name
    pub created_at: NaiveDateTime,
    /// Full path of the archive
    pub file_path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl BackupArchive {
    /// Archive file name
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Creates, lists and restores backups
pub struct BackupCoordinator {
    engine: Arc<LifecycleEngine>,
    backup_dir: PathBuf,
    timeout: Option<Duration>,
}

impl BackupCoordinator {
    /// Creates a coordinator writing to `backup_dir`.
    pub fn new(engine: Arc<LifecycleEngine>, backup_dir: impl Into<PathBuf>) -> Self {
        let timeout = engine.timeouts().backup();
        Self {
            engine,
            backup_dir: backup_dir.into(),
            timeout,
        }
    }

    /// Directory archives live in
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Archives the instance's data directory. Precondition: `Stopped`.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn create_backup(&self, instance_id: &InstanceId, actor: Actor) -> Result<BackupArchive> {
        let mut scope = self.engine.open_scope(instance_id, "backup", actor).await?;
        let record = scope.require(Operation::Backup, &[ServerStatus::Stopped])?;
        scope.begin(Operation::Backup, ServerStatus::BackingUp)?;

        let source = record.data_dir().clone();
        let backup_dir = self.backup_dir.clone();
        let id = instance_id.clone();
        let result = run_blocking(&scope, "backup", self.timeout, move |abort| {
            write_archive(&id, &source, &backup_dir, abort)
        })
        .await;

        match result {
            Ok(archive) => {
                tracing::info!(file = %archive.file_path.display(), size = archive.size, "Backup created");
                scope.succeed(
                    InstancePatch::status(ServerStatus::Stopped),
                    Some(archive.file_name()),
                )?;
                Ok(archive)
            }
            Err(e) => Err(scope.fail(e, None)),
        }
    }

    /// Replaces the instance's data directory with the contents of `archive`.
    ///
    /// `archive` is a file name inside the backup directory. With
    /// `overwrite == false` a non-empty data directory is left untouched and
    /// the call fails with [`Error::OverwriteRequired`].
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn restore_backup(
        &self,
        instance_id: &InstanceId,
        archive: &str,
        overwrite: bool,
        actor: Actor,
    ) -> Result<BackupArchive> {
        let mut scope = self.engine.open_scope(instance_id, "restore", actor).await?;
        let record = scope.require(Operation::Restore, &[ServerStatus::Stopped])?;

        let archive_path = resolve_archive(&self.backup_dir, archive)?;
        let described = describe(&archive_path)?;
        if described.instance_id != *instance_id {
            tracing::warn!(
                archive = %archive,
                owner = %described.instance_id,
                "Restore refused, archive belongs to another server"
            );
            return Err(Error::ArchiveNotFound(format!(
                "{} is not a backup of '{}'",
                archive, instance_id
            )));
        }

        let target = record.data_dir().clone();
        if !overwrite && dir_has_entries(&target)? {
            tracing::warn!(target = %target.display(), "Restore refused, target not empty");
            return Err(Error::OverwriteRequired(target.display().to_string()));
        }

        let checked = archive_path.clone();
        tokio::task::spawn_blocking(move || check_archive(&checked))
            .await
            .map_err(|e| Error::Other(format!("Restore task failed: {}", e)))??;

        scope.begin(Operation::Restore, ServerStatus::Restoring)?;

        let source = archive_path.clone();
        let result = run_blocking(&scope, "restore", self.timeout, move |abort| {
            extract_archive(&source, &target, abort)
        })
        .await;

        match result {
            Ok(()) => {
                let archive = describe(&archive_path)?;
                scope.succeed(
                    InstancePatch::status(ServerStatus::Stopped),
                    Some(archive.file_name()),
                )?;
                tracing::info!(file = %archive.file_path.display(), "Backup restored");
                Ok(archive)
            }
            Err(e) => Err(scope.fail(e, None)),
        }
    }

    /// Archives in the backup directory, newest first.
    pub fn list_backups(&self, instance_id: Option<&InstanceId>) -> Result<Vec<BackupArchive>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut archives = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(archive) = describe(&entry.path()).ok() else {
                continue;
            };
            if instance_id.is_none_or(|id| &archive.instance_id == id) {
                archives.push(archive);
            }
        }

        archives.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        Ok(archives)
    }
}

/// Runs a blocking archive job within the scope's timeout and cancellation.
///
/// When the limit or a cancel fires first, the job is told to abort and is
/// awaited before returning, so the caller still holds the instance lock
/// while the job touches the filesystem.
async fn run_blocking<T, F>(
    scope: &OperationScope,
    what: &str,
    limit: Option<Duration>,
    job: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
{
    let abort = AbortFlag::new();
    let flag = abort.flag();
    let mut task = tokio::task::spawn_blocking(move || job(&*flag));
    let mut joined = false;

    let result = scope
        .bounded(what, limit, async {
            let output = (&mut task).await;
            joined = true;
            output.map_err(|e| Error::Other(format!("{} task failed: {}", what, e)))?
        })
        .await;

    match result {
        Ok(value) => {
            abort.disarm();
            Ok(value)
        }
        Err(e) => {
            abort.trip();
            if !joined {
                tracing::debug!(what, "Waiting for abandoned job to stop");
                if let Err(join) = task.await {
                    tracing::debug!(what, error = %join, "Abandoned job failed");
                }
            }
            Err(e)
        }
    }
}

/// Sets the abort flag when tripped or dropped unless disarmed, so an
/// abandoned blocking job stops at its next entry.
struct AbortFlag {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl AbortFlag {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            armed: true,
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortFlag {
    fn drop(&mut self) {
        if self.armed {
            self.trip();
        }
    }
}

fn check_aborted(flag: &AtomicBool, what: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(Error::Cancelled(format!("{} aborted", what)));
    }
    Ok(())
}

/// Archive file name for `instance_id` at `at`.
pub fn archive_name(instance_id: &InstanceId, at: NaiveDateTime) -> String {
    format!("{}-{}.zip", instance_id, at.format(TIMESTAMP_FORMAT))
}

/// Splits an archive file name into instance id and creation time.
pub fn parse_archive_name(name: &str) -> Option<(InstanceId, NaiveDateTime)> {
    let stem = name.strip_suffix(".zip")?;
    if stem.len() <= SUFFIX_LEN || !stem.is_char_boundary(stem.len() - SUFFIX_LEN) {
        return None;
    }
    let (id, suffix) = stem.split_at(stem.len() - SUFFIX_LEN);
    let timestamp = suffix.strip_prefix('-')?;
    let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    Some((InstanceId::from(id), created_at))
}

fn describe(path: &Path) -> Result<BackupArchive> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::ArchiveNotFound(path.display().to_string()))?;
    let (instance_id, created_at) =
        parse_archive_name(name).ok_or_else(|| Error::ArchiveNotFound(name.to_string()))?;
    let size = fs::metadata(path)?.len();
    Ok(BackupArchive {
        instance_id,
        created_at,
        file_path: path.to_path_buf(),
        size,
    })
}

/// Resolves a bare archive file name inside `backup_dir`.
fn resolve_archive(backup_dir: &Path, name: &str) -> Result<PathBuf> {
    let mut components = Path::new(name).components();
    let bare = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !bare || !name.ends_with(".zip") {
        return Err(Error::ArchiveNotFound(name.to_string()));
    }

    let path = backup_dir.join(name);
    if !path.is_file() {
        return Err(Error::ArchiveNotFound(name.to_string()));
    }
    Ok(path)
}

fn dir_has_entries(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Io(format!("Archive error: {}", e))
}

fn write_archive(
    instance_id: &InstanceId,
    source: &Path,
    backup_dir: &Path,
    abort: &AtomicBool,
) -> Result<BackupArchive> {
    if !source.is_dir() {
        return Err(Error::Io(format!(
            "Data directory {} does not exist",
            source.display()
        )));
    }
    fs::create_dir_all(backup_dir)?;

    let mut at = Local::now().naive_local();
    let mut final_path = backup_dir.join(archive_name(instance_id, at));
    while final_path.exists() {
        at += chrono::Duration::seconds(1);
        final_path = backup_dir.join(archive_name(instance_id, at));
    }
    let mut partial_name = final_path.file_name().unwrap_or_default().to_os_string();
    partial_name.push(".partial");
    let partial = final_path.with_file_name(partial_name);

    let written = write_zip(source, &partial, abort);
    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, &final_path)?;
    describe(&final_path)
}

fn write_zip(source: &Path, partial: &Path, abort: &AtomicBool) -> Result<()> {
    let file = File::create(partial)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        check_aborted(abort, "backup")?;
        let entry = entry.map_err(|e| Error::Io(format!("Failed to walk data directory: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::Other(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)
                .map_err(zip_error)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options).map_err(zip_error)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }

    let writer = zip.finish().map_err(zip_error)?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::Io(format!("Failed to flush archive: {}", e)))?;
    file.sync_all()?;
    Ok(())
}

/// Rejects archives with entries that would land outside the target.
fn check_archive(path: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(path)?).map_err(zip_error)?;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(zip_error)?;
        if entry.enclosed_name().is_none() {
            return Err(Error::Io(format!(
                "Archive entry '{}' escapes the target directory",
                entry.name()
            )));
        }
    }
    Ok(())
}

/// Extracts into a sibling staging directory, then swaps it into place.
fn extract_archive(path: &Path, target: &Path, abort: &AtomicBool) -> Result<()> {
    let mut staging_name = target.file_name().unwrap_or_default().to_os_string();
    staging_name.push(".restoring");
    let staging = target.with_file_name(staging_name);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    if let Err(e) = unpack(path, &staging, abort).and_then(|()| check_aborted(abort, "restore")) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    fs::rename(&staging, target)?;
    Ok(())
}

fn unpack(path: &Path, staging: &Path, abort: &AtomicBool) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(path)?).map_err(zip_error)?;
    for i in 0..archive.len() {
        check_aborted(abort, "restore")?;
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::Io(format!(
                "Archive entry '{}' escapes the target directory",
                entry.name()
            )));
        };
        let dest = staging.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&dest)?;
        io::copy(&mut entry, &mut output)?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig};
    use crate::server::{EventBus, ServerRegistry};
    use chrono::NaiveDate;

    #[test]
    fn archive_names_round_trip_with_dashed_ids() {
        let at = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(2, 9, 0)
            .unwrap();
        let id = InstanceId::from("palworld-main");
        let name = archive_name(&id, at);
        assert_eq!(name, "palworld-main-20250309-020900.zip");
        assert_eq!(parse_archive_name(&name), Some((id, at)));
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(parse_archive_name("notes.txt"), None);
        assert_eq!(parse_archive_name("x.zip"), None);
        assert_eq!(parse_archive_name("ark-2025-03-09.zip"), None);
    }

    #[test]
    fn archive_lookup_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a-20250101-000000.zip"), b"").unwrap();

        assert!(resolve_archive(dir.path(), "a-20250101-000000.zip").is_ok());
        for name in ["../a-20250101-000000.zip", "/etc/passwd", "sub/a.zip", "a.tar"] {
            assert!(matches!(
                resolve_archive(dir.path(), name),
                Err(Error::ArchiveNotFound(_))
            ));
        }
    }

    #[test]
    fn abandoned_job_sets_abort_flag() {
        let abort = AbortFlag::new();
        let flag = abort.flag();
        drop(abort);
        assert!(check_aborted(&flag, "backup").is_err());

        let abort = AbortFlag::new();
        let flag = abort.flag();
        abort.disarm();
        assert!(check_aborted(&flag, "backup").is_ok());
    }

    #[tokio::test]
    async fn timed_out_job_finishes_before_the_lock_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.manager.state_file = dir.path().join("state.json");
        config.manager.servers_root = dir.path().join("servers");
        config
            .servers
            .insert("Valheim".to_string(), ServerConfig::new("896660", "valheim_server.x86_64"));
        let registry = Arc::new(ServerRegistry::open(&config).unwrap());
        let engine = LifecycleEngine::new(registry, Arc::new(EventBus::default()), &config.manager);
        let id = InstanceId::from("valheim");
        let scope = engine.open_scope(&id, "restore", Actor::System).await.unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&finished);
        let result: Result<()> =
            run_blocking(&scope, "restore", Some(Duration::from_millis(50)), move |abort| {
                while !abort.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                seen.store(true, Ordering::SeqCst);
                check_aborted(abort, "restore")
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(engine.locks().current_operation(&id).as_deref(), Some("restore"));
    }
}
