//! Snapshot persistence for a full-system emulator: guest RAM and GPU
//! textures, saved to and restored from disk with page-level
//! granularity.
//!
//! The interesting half is the restore path. Rather than streaming all
//! of guest RAM back before the machine runs, [`ram::loader::RamLoader`]
//! can arm a page-fault watcher over the guest mapping and let the VM
//! start immediately: the first touch of a missing page traps, the page
//! is read (and decompressed) right there, and a background
//! reader/decompressor pipeline prefetches the rest whenever the guest
//! is not faulting. Zero pages never reach the disk in either
//! direction.
//!
//! [`coordinator::Snapshotter`] is the front door: it names snapshots,
//! runs the save-to-temp-then-rename commit protocol, deletes poisoned
//! snapshots, and blames a recently loaded snapshot for a crash that
//! follows it too closely.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fault;
pub mod index;
pub mod operation;
pub mod ram;
pub mod texture;
pub mod zero;

pub use config::{OpKind, OperationStats, SnapshotConfig, SnapshotObserver};
pub use coordinator::{Operation, Snapshotter, VmCallbacks};
pub use error::{Result, SnapshotError};
pub use fault::{FaultHandler, FaultWatch, IdleOutcome};
pub use operation::{LoadOperation, OpStatus, SaveOperation, SnapshotMetadata};
pub use ram::{RamBlock, loader::RamLoader, saver::RamSaver};
pub use texture::{TextureLoader, TextureSaver};
