mod common;

use std::fs;

use common::{GuestRam, PAGE, save_ram_snapshot, snapshotter};
use glacier_snapshot::{SnapshotConfig, SnapshotError};

fn saved_snapshot(root: &std::path::Path, name: &str) -> (glacier_snapshot::Snapshotter, GuestRam) {
    let mut snap = snapshotter(root, SnapshotConfig::default());
    let mut ram = GuestRam::new("pc.ram", PAGE * 16, PAGE);
    ram.randomize(0.2);
    save_ram_snapshot(&mut snap, name, std::slice::from_mut(&mut ram)).expect("save snapshot");
    (snap, ram)
}

/// Rewrites the version word of `ram.bin`'s index in place.
fn corrupt_version(ram_bin: &std::path::Path, version: u32) {
    let mut bytes = fs::read(ram_bin).expect("read ram.bin");
    let index_offset =
        u64::from_le_bytes(bytes[..8].try_into().expect("header")) as usize;
    bytes[index_offset..index_offset + 4].copy_from_slice(&version.to_le_bytes());
    fs::write(ram_bin, bytes).expect("rewrite ram.bin");
}

#[test]
fn version_mismatch_rejected_before_touching_memory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut snap, mut ram) = saved_snapshot(dir.path(), "versioned");
    corrupt_version(&snap.snapshot_dir("versioned").join("ram.bin"), 99);

    ram.fill(0xCD);
    let sentinel = ram.bytes().to_vec();

    snap.begin_load("versioned").expect("begin load");
    let op = snap.load_op().expect("load op");
    op.register_block(ram.block());
    match op.start(false) {
        Err(SnapshotError::IncompatibleVersion { found, .. }) => assert_eq!(found, 99),
        other => panic!("expected IncompatibleVersion, got {other:?}"),
    }
    assert_eq!(ram.bytes(), sentinel.as_slice(), "no page may be mutated");

    // Settling the failed load removes the unusable snapshot.
    let snapshot_dir = snap.snapshot_dir("versioned");
    assert!(snap.end_load(false).is_err());
    assert!(!snapshot_dir.exists());
}

#[test]
fn unfinished_header_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut snap, _ram) = saved_snapshot(dir.path(), "torn");

    // A save that died before patching the header leaves it zero. The
    // pre-flight catches this at begin_load, before any block exists.
    let ram_bin = snap.snapshot_dir("torn").join("ram.bin");
    let mut bytes = fs::read(&ram_bin).expect("read ram.bin");
    bytes[..8].copy_from_slice(&0u64.to_le_bytes());
    fs::write(&ram_bin, bytes).expect("rewrite ram.bin");

    assert!(matches!(
        snap.begin_load("torn"),
        Err(SnapshotError::CorruptIndex(_))
    ));
}

#[test]
fn missing_texture_file_rejected_at_begin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut snap, _ram) = saved_snapshot(dir.path(), "gutted");

    fs::remove_file(snap.snapshot_dir("gutted").join("textures.bin"))
        .expect("remove textures.bin");

    assert!(matches!(
        snap.begin_load("gutted"),
        Err(SnapshotError::Directory { .. })
    ));
}

#[test]
fn mismatched_block_registration_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut snap, _ram) = saved_snapshot(dir.path(), "blocks");

    let mut other = GuestRam::new("not.the.same", PAGE * 16, PAGE);
    snap.begin_load("blocks").expect("begin load");
    let op = snap.load_op().expect("load op");
    op.register_block(other.block());
    match op.start(false) {
        Err(SnapshotError::UnknownBlock { id }) => assert_eq!(id, "pc.ram"),
        other => panic!("expected UnknownBlock, got {other:?}"),
    }
    assert!(snap.end_load(false).is_err());
}

#[test]
fn truncated_page_data_fails_the_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut snap = snapshotter(dir.path(), SnapshotConfig { compress: false, ..SnapshotConfig::default() });
    let mut ram = GuestRam::new("pc.ram", PAGE * 8, PAGE);
    ram.randomize(0.0);
    save_ram_snapshot(&mut snap, "short", std::slice::from_mut(&mut ram)).expect("save snapshot");

    // Drop the last page's data and splice the index directly after it,
    // as a torn write would. The index now promises bytes the data
    // region no longer holds.
    let ram_bin = snap.snapshot_dir("short").join("ram.bin");
    let bytes = fs::read(&ram_bin).expect("read ram.bin");
    let index_offset = u64::from_le_bytes(bytes[..8].try_into().expect("header")) as usize;
    let mut shorter = bytes.clone();
    shorter.truncate(index_offset - PAGE);
    shorter.extend_from_slice(&bytes[index_offset..]);
    shorter[..8].copy_from_slice(&((index_offset - PAGE) as u64).to_le_bytes());
    fs::write(&ram_bin, shorter).expect("rewrite ram.bin");

    ram.fill(0);
    snap.begin_load("short").expect("begin load");
    let op = snap.load_op().expect("load op");
    op.register_block(ram.block());
    let started = op.start(false);
    assert!(started.is_err(), "load with missing page data must fail");
    assert!(snap.end_load(false).is_err());
}
