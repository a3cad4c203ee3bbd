//! Per-operation state: one save or load of one named snapshot.
//!
//! A save writes every file into a temp-named sibling directory and
//! renames it over the final name only after everything (ram, textures,
//! metadata) landed; a failed or abandoned save removes the temp
//! directory and the previous snapshot under that name survives
//! untouched. A failed load deletes the snapshot directory outright: a
//! half-restored machine is worse than a cold boot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::SnapshotConfig;
use crate::error::{Result, SnapshotError};
use crate::fault::FaultWatch;
use crate::ram::{RamBlock, loader::RamLoader, saver::RamSaver};
use crate::texture::{TextureLoader, TextureSaver};

pub const RAM_FILE: &str = "ram.bin";
pub const TEXTURES_FILE: &str = "textures.bin";
pub const METADATA_FILE: &str = "snapshot.meta";
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// In progress (or never driven to completion).
    NotStarted,
    Ok,
    Error,
}

/// Postcard-encoded sidecar describing the snapshot as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub created_unix: u64,
    pub compressed: bool,
    pub ram_disk_size: u64,
    pub texture_disk_size: u64,
}

pub fn read_metadata(path: &Path) -> Result<SnapshotMetadata> {
    let bytes = fs::read(path)?;
    let metadata: SnapshotMetadata =
        postcard::from_bytes(&bytes).map_err(|e| SnapshotError::Metadata(e.to_string()))?;
    if metadata.version != METADATA_VERSION {
        return Err(SnapshotError::IncompatibleVersion {
            expected: METADATA_VERSION,
            found: metadata.version,
        });
    }
    Ok(metadata)
}

fn write_metadata(path: &Path, metadata: &SnapshotMetadata) -> Result<()> {
    let bytes =
        postcard::to_allocvec(metadata).map_err(|e| SnapshotError::Metadata(e.to_string()))?;
    fs::write(path, bytes)?;
    Ok(())
}

fn dir_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Directory {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub struct SaveOperation {
    name: String,
    final_dir: PathBuf,
    temp_dir: PathBuf,
    ram: RamSaver,
    textures: TextureSaver,
    texture_disk_size: u64,
    compressed: bool,
    status: OpStatus,
    started_at: Instant,
    duration: Option<Duration>,
    completed: bool,
}

impl SaveOperation {
    pub fn new(root: &Path, name: &str, config: &SnapshotConfig) -> Result<Self> {
        let final_dir = root.join(name);
        let temp_dir = root.join(format!("{name}.saving"));
        if temp_dir.exists() {
            // Leftover from a save that died; its header-zero files are
            // useless anyway.
            fs::remove_dir_all(&temp_dir).map_err(dir_err(&temp_dir))?;
        }
        fs::create_dir_all(&temp_dir).map_err(dir_err(&temp_dir))?;
        let ram = RamSaver::new(temp_dir.join(RAM_FILE), config.compress)?;
        let textures = TextureSaver::new(temp_dir.join(TEXTURES_FILE))?;
        tracing::info!(name, "snapshot save started");
        Ok(Self {
            name: name.to_owned(),
            final_dir,
            temp_dir,
            ram,
            textures,
            texture_disk_size: 0,
            compressed: config.compress,
            status: OpStatus::NotStarted,
            started_at: Instant::now(),
            duration: None,
            completed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_block(&mut self, block: RamBlock) {
        self.ram.register_block(block);
    }

    pub fn save_page(&mut self, block_index: usize, page_offset: usize, size: usize) -> Result<()> {
        self.ram.save_page(block_index, page_offset, size)
    }

    pub fn save_all_ram(&mut self) -> Result<()> {
        self.ram.save_all()
    }

    pub fn textures(&mut self) -> &mut TextureSaver {
        &mut self.textures
    }

    /// Finishes the save. On success the temp directory atomically
    /// replaces any previous snapshot under this name; on failure (ours
    /// or the VM's, via `succeeded = false`) the temp directory is
    /// removed and the previous snapshot survives.
    pub fn complete(&mut self, succeeded: bool) -> Result<()> {
        if self.completed {
            return Err(SnapshotError::InvalidOperation("save already completed"));
        }
        self.completed = true;
        let result = if !succeeded {
            self.abandon();
            Ok(())
        } else if self.ram.has_error() {
            Err(SnapshotError::InvalidOperation("ram writer reported errors"))
        } else if self.textures.has_error() {
            Err(SnapshotError::InvalidOperation("texture writer reported errors"))
        } else {
            self.commit()
        };
        self.duration = Some(self.started_at.elapsed());
        match &result {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(name = self.name, error = %err, "snapshot save failed");
                self.abandon();
            }
        }
        result
    }

    fn commit(&mut self) -> Result<()> {
        self.ram.join()?;
        self.texture_disk_size = self.textures.done()?;
        let metadata = SnapshotMetadata {
            version: METADATA_VERSION,
            created_unix: unix_now(),
            compressed: self.compressed,
            ram_disk_size: self.ram.disk_size(),
            texture_disk_size: self.texture_disk_size,
        };
        write_metadata(&self.temp_dir.join(METADATA_FILE), &metadata)?;

        if self.final_dir.exists() {
            fs::remove_dir_all(&self.final_dir).map_err(dir_err(&self.final_dir))?;
        }
        fs::rename(&self.temp_dir, &self.final_dir).map_err(dir_err(&self.final_dir))?;
        self.status = OpStatus::Ok;
        tracing::info!(
            name = self.name,
            disk_size = self.ram.disk_size(),
            "snapshot save complete"
        );
        Ok(())
    }

    fn abandon(&mut self) {
        self.status = OpStatus::Error;
        if self.temp_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&self.temp_dir) {
                tracing::warn!(path = %self.temp_dir.display(), error = %err, "temp dir cleanup failed");
            }
        }
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn disk_size(&self) -> u64 {
        self.ram.disk_size() + self.texture_disk_size
    }

    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}

impl Drop for SaveOperation {
    fn drop(&mut self) {
        // Never auto-commit: an un-completed save is a failed save.
        if !self.completed {
            self.abandon();
        }
    }
}

pub struct LoadOperation {
    name: String,
    dir: PathBuf,
    metadata: SnapshotMetadata,
    ram: RamLoader,
    status: OpStatus,
    started_at: Instant,
    duration: Option<Duration>,
    completed: bool,
}

impl LoadOperation {
    pub fn new(
        root: &Path,
        name: &str,
        config: &SnapshotConfig,
        watch: Option<Arc<dyn FaultWatch>>,
    ) -> Result<Self> {
        let dir = root.join(name);
        let metadata = read_metadata(&dir.join(METADATA_FILE))?;
        let ram = RamLoader::new(dir.join(RAM_FILE), *config, watch);
        tracing::info!(name, "snapshot load started");
        Ok(Self {
            name: name.to_owned(),
            dir,
            metadata,
            ram,
            status: OpStatus::NotStarted,
            started_at: Instant::now(),
            duration: None,
            completed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Pre-flight: both data files must exist and the RAM file's offset
    /// header must have been patched by a finished save. Runs before
    /// `start`, so a torn snapshot is rejected without touching guest
    /// memory.
    pub fn prepare(&self) -> Result<()> {
        for file in [RAM_FILE, TEXTURES_FILE] {
            let path = self.dir.join(file);
            if !path.is_file() {
                return Err(SnapshotError::Directory {
                    path,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
        }
        let mut header = [0u8; 8];
        let mut file = fs::File::open(self.dir.join(RAM_FILE))?;
        std::io::Read::read_exact(&mut file, &mut header)?;
        if u64::from_le_bytes(header) == 0 {
            return Err(SnapshotError::CorruptIndex("ram header never patched"));
        }
        Ok(())
    }

    pub fn register_block(&mut self, block: RamBlock) {
        self.ram.register_block(block);
    }

    /// Reads the index and begins loading. With `on_demand` set (and a
    /// fault watcher available) this returns as soon as faults are armed;
    /// otherwise it returns with every page resident.
    pub fn start(&mut self, on_demand: bool) -> Result<()> {
        self.ram.start(on_demand)
    }

    pub fn ram(&mut self) -> &mut RamLoader {
        &mut self.ram
    }

    /// Opens this snapshot's texture store.
    pub fn open_textures(&self) -> Result<TextureLoader> {
        TextureLoader::new(self.dir.join(TEXTURES_FILE))
    }

    pub fn interrupt(&self) {
        self.ram.interrupt_reading();
    }

    /// Waits for the load to finish and settles the outcome. Any failure
    /// deletes the snapshot directory: it will not be offered again.
    pub fn complete(&mut self, succeeded: bool) -> Result<()> {
        if self.completed {
            return Err(SnapshotError::InvalidOperation("load already completed"));
        }
        self.completed = true;
        let joined = self.ram.join();
        self.duration = Some(self.started_at.elapsed());
        let result = match joined {
            Ok(()) if succeeded => {
                self.status = OpStatus::Ok;
                tracing::info!(name = self.name, "snapshot load complete");
                return Ok(());
            }
            Ok(()) => Err(SnapshotError::InvalidOperation("load abandoned by vm")),
            Err(err) => Err(err),
        };
        self.status = OpStatus::Error;
        if let Err(ref err) = result {
            tracing::warn!(name = self.name, error = %err, "snapshot load failed");
            if err.poisons_snapshot() {
                if let Err(remove_err) = fs::remove_dir_all(&self.dir) {
                    tracing::warn!(path = %self.dir.display(), error = %remove_err, "snapshot dir cleanup failed");
                }
            }
        }
        result
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn on_demand(&self) -> bool {
        self.ram.on_demand()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}

impl Drop for LoadOperation {
    fn drop(&mut self) {
        if !self.completed {
            self.ram.interrupt_reading();
        }
    }
}
