//! The snapshot service: names snapshots, sequences operations, and
//! owns the crash-attribution bookkeeping.
//!
//! A [`Snapshotter`] allows at most one save and one load in flight.
//! The embedding VM drives each operation through `begin_*`, the
//! operation accessor, and `end_*`; the [`VmCallbacks`] hook lets it
//! veto or observe operations from the emulation side.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{OpKind, OperationStats, SnapshotConfig, SnapshotObserver};
use crate::error::{Result, SnapshotError};
use crate::fault::{self, FaultWatch};
use crate::operation::{self, LoadOperation, METADATA_FILE, OpStatus, SaveOperation};

/// Sidecar recording the last successfully loaded snapshot. If the
/// process crashes shortly after, that snapshot takes the blame.
const LAST_LOAD_FILE: &str = ".last_load";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Save,
    Load,
}

/// Hooks into the emulation side of an operation. `on_operation_start`
/// returning `false` aborts before any disk state changes.
pub trait VmCallbacks: Send + Sync {
    fn on_operation_start(&self, _op: Operation, _name: &str) -> bool {
        true
    }
    fn on_operation_end(&self, _op: Operation, _name: &str, _succeeded: bool) {}
}

#[derive(Debug, Serialize, Deserialize)]
struct LastLoadMarker {
    name: String,
    completed_unix: u64,
}

pub struct Snapshotter {
    root: PathBuf,
    config: SnapshotConfig,
    watch: Option<Arc<dyn FaultWatch>>,
    callbacks: Option<Arc<dyn VmCallbacks>>,
    observer: Option<Arc<dyn SnapshotObserver>>,
    saver: Option<SaveOperation>,
    loader: Option<LoadOperation>,
    last_stats: Option<OperationStats>,
}

impl Snapshotter {
    /// `root` is the directory holding one subdirectory per snapshot.
    pub fn new(root: impl Into<PathBuf>, config: SnapshotConfig) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| SnapshotError::Directory {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            config,
            watch: fault::platform_watch(),
            callbacks: None,
            observer: None,
            saver: None,
            loader: None,
            last_stats: None,
        })
    }

    /// Replaces the platform fault watcher (tests inject a simulated one;
    /// `None` forces every load down the eager path).
    pub fn set_watch(&mut self, watch: Option<Arc<dyn FaultWatch>>) {
        self.watch = watch;
    }

    pub fn set_callbacks(&mut self, callbacks: Arc<dyn VmCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    pub fn set_observer(&mut self, observer: Arc<dyn SnapshotObserver>) {
        self.observer = Some(observer);
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn snapshot_exists(&self, name: &str) -> bool {
        self.snapshot_dir(name).join(METADATA_FILE).is_file()
    }

    /// Names of every complete snapshot under the root.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().join(METADATA_FILE).is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn begin_save(&mut self, name: &str) -> Result<&mut SaveOperation> {
        validate_name(name)?;
        self.clear_conflicting(name);
        if self.saver.is_some() {
            return Err(SnapshotError::InvalidOperation("save already in flight"));
        }
        if !self.notify_start(Operation::Save, name) {
            return Err(SnapshotError::InvalidOperation("vm refused save"));
        }
        let op = SaveOperation::new(&self.root, name, &self.config)?;
        Ok(self.saver.insert(op))
    }

    pub fn save_op(&mut self) -> Option<&mut SaveOperation> {
        self.saver.as_mut()
    }

    /// Settles the in-flight save; `succeeded` reports the VM side's
    /// outcome (device serialization and the like).
    pub fn end_save(&mut self, succeeded: bool) -> Result<()> {
        let mut op = self
            .saver
            .take()
            .ok_or(SnapshotError::InvalidOperation("no save in flight"))?;
        let result = op.complete(succeeded);
        let ok = op.status() == OpStatus::Ok;
        let stats = OperationStats {
            kind: OpKind::Save,
            name: op.name().to_owned(),
            succeeded: ok,
            duration: op.duration().unwrap_or_default(),
            disk_size: op.disk_size(),
            compressed: op.compressed(),
            on_demand: false,
        };
        self.finish(Operation::Save, stats);
        result
    }

    pub fn begin_load(&mut self, name: &str) -> Result<&mut LoadOperation> {
        validate_name(name)?;
        self.clear_conflicting(name);
        if self.loader.is_some() {
            return Err(SnapshotError::InvalidOperation("load already in flight"));
        }
        if !self.notify_start(Operation::Load, name) {
            return Err(SnapshotError::InvalidOperation("vm refused load"));
        }
        let op = LoadOperation::new(&self.root, name, &self.config, self.watch.clone())?;
        op.prepare()?;
        Ok(self.loader.insert(op))
    }

    pub fn load_op(&mut self) -> Option<&mut LoadOperation> {
        self.loader.as_mut()
    }

    /// Waits out the in-flight load and settles it. A successful load is
    /// recorded for crash attribution; a failed one has already deleted
    /// its directory.
    pub fn end_load(&mut self, succeeded: bool) -> Result<()> {
        let mut op = self
            .loader
            .take()
            .ok_or(SnapshotError::InvalidOperation("no load in flight"))?;
        let result = op.complete(succeeded);
        let ok = op.status() == OpStatus::Ok;
        if ok {
            self.write_last_load(op.name());
        }
        let stats = OperationStats {
            kind: OpKind::Load,
            name: op.name().to_owned(),
            succeeded: ok,
            duration: op.duration().unwrap_or_default(),
            disk_size: op.metadata().ram_disk_size + op.metadata().texture_disk_size,
            compressed: op.metadata().compressed,
            on_demand: op.on_demand(),
        };
        self.finish(Operation::Load, stats);
        result
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        let busy = self.saver.as_ref().is_some_and(|op| op.name() == name)
            || self.loader.as_ref().is_some_and(|op| op.name() == name);
        if busy {
            return Err(SnapshotError::InvalidOperation("snapshot is in use"));
        }
        let dir = self.snapshot_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|source| SnapshotError::Directory {
                path: dir,
                source,
            })?;
            tracing::info!(name, "snapshot deleted");
        }
        if let Some(marker) = self.read_last_load() {
            if marker.name == name {
                self.clear_last_load();
            }
        }
        Ok(())
    }

    /// Call once at startup after detecting that the previous run
    /// crashed. If a snapshot load finished within the configured window
    /// before that crash, the snapshot is deleted and its name returned.
    pub fn check_crash_on_boot(&mut self) -> Result<Option<String>> {
        let Some(marker) = self.read_last_load() else {
            return Ok(None);
        };
        self.clear_last_load();
        let age = operation::unix_now().saturating_sub(marker.completed_unix);
        if Duration::from_secs(age) > self.config.crash_window {
            return Ok(None);
        }
        tracing::warn!(
            name = marker.name,
            age_secs = age,
            "crash attributed to recently loaded snapshot"
        );
        self.delete(&marker.name)?;
        Ok(Some(marker.name))
    }

    pub fn last_stats(&self) -> Option<&OperationStats> {
        self.last_stats.as_ref()
    }

    /// A new operation on `name` abandons any in-flight operation of the
    /// other kind on the same name.
    fn clear_conflicting(&mut self, name: &str) {
        if self.loader.as_ref().is_some_and(|op| op.name() == name) {
            if let Some(mut op) = self.loader.take() {
                tracing::warn!(name, "abandoning in-flight load for new operation");
                op.interrupt();
                let _ = op.complete(false);
            }
        }
        if self.saver.as_ref().is_some_and(|op| op.name() == name) {
            if let Some(mut op) = self.saver.take() {
                tracing::warn!(name, "abandoning in-flight save for new operation");
                let _ = op.complete(false);
            }
        }
    }

    fn notify_start(&self, op: Operation, name: &str) -> bool {
        self.callbacks
            .as_ref()
            .is_none_or(|cb| cb.on_operation_start(op, name))
    }

    fn finish(&mut self, op: Operation, stats: OperationStats) {
        if let Some(cb) = &self.callbacks {
            cb.on_operation_end(op, &stats.name, stats.succeeded);
        }
        if let Some(observer) = &self.observer {
            observer.operation_finished(&stats);
        }
        self.last_stats = Some(stats);
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(LAST_LOAD_FILE)
    }

    fn write_last_load(&self, name: &str) {
        let marker = LastLoadMarker {
            name: name.to_owned(),
            completed_unix: operation::unix_now(),
        };
        match postcard::to_allocvec(&marker) {
            Ok(bytes) => {
                if let Err(err) = fs::write(self.marker_path(), bytes) {
                    tracing::warn!(error = %err, "failed to record last load");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode last-load marker"),
        }
    }

    fn read_last_load(&self) -> Option<LastLoadMarker> {
        let bytes = fs::read(self.marker_path()).ok()?;
        postcard::from_bytes(&bytes).ok()
    }

    fn clear_last_load(&self) {
        let _ = fs::remove_file(self.marker_path());
    }
}

/// Snapshot names become directory names; keep them to one path segment.
/// `.saving` is reserved for a save's temp directory.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.ends_with(".saving")
        && !name.contains(['/', '\\']);
    if ok {
        Ok(())
    } else {
        Err(SnapshotError::InvalidOperation("invalid snapshot name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("quickboot").is_ok());
        assert!(validate_name("save_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".hidden").is_err());
        // Would collide with the temp directory of a save named "foo".
        assert!(validate_name("foo.saving").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
    }

    #[test]
    fn end_without_begin_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut snap =
            Snapshotter::new(dir.path().join("snapshots"), SnapshotConfig::default())
                .expect("snapshotter");
        assert!(matches!(
            snap.end_save(true),
            Err(SnapshotError::InvalidOperation(_))
        ));
        assert!(matches!(
            snap.end_load(true),
            Err(SnapshotError::InvalidOperation(_))
        ));
    }

    #[test]
    fn crash_marker_outside_window_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("snapshots");
        let mut snap = Snapshotter::new(&root, SnapshotConfig::default()).expect("snapshotter");

        let marker = LastLoadMarker {
            name: "old".into(),
            completed_unix: operation::unix_now() - 3600,
        };
        fs::write(
            root.join(LAST_LOAD_FILE),
            postcard::to_allocvec(&marker).expect("encode"),
        )
        .expect("write marker");

        assert_eq!(snap.check_crash_on_boot().expect("check"), None);
        // Marker is consumed either way.
        assert!(!root.join(LAST_LOAD_FILE).exists());
    }

    #[test]
    fn crash_within_window_deletes_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("snapshots");
        let mut snap = Snapshotter::new(&root, SnapshotConfig::default()).expect("snapshotter");

        let victim = root.join("fresh");
        fs::create_dir_all(&victim).expect("mkdir");
        fs::write(victim.join(METADATA_FILE), b"stub").expect("meta");

        let marker = LastLoadMarker {
            name: "fresh".into(),
            completed_unix: operation::unix_now(),
        };
        fs::write(
            root.join(LAST_LOAD_FILE),
            postcard::to_allocvec(&marker).expect("encode"),
        )
        .expect("write marker");

        assert_eq!(
            snap.check_crash_on_boot().expect("check").as_deref(),
            Some("fresh")
        );
        assert!(!victim.exists());
    }
}
