mod common;

use common::{GuestRam, PAGE, save_ram_snapshot, snapshotter};
use glacier_snapshot::SnapshotConfig;

fn roundtrip(config: SnapshotConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut snap = snapshotter(dir.path(), config);

    // Second block deliberately ends on a short tail page.
    let mut rams = vec![
        GuestRam::new("pc.ram", PAGE * 24, PAGE),
        GuestRam::new("vram", PAGE * 7 + 100, PAGE),
    ];
    for ram in &mut rams {
        ram.randomize(0.3);
    }
    let expected: Vec<Vec<u8>> = rams.iter().map(|r| r.bytes().to_vec()).collect();

    save_ram_snapshot(&mut snap, "slot0", &mut rams).expect("save snapshot");

    for ram in &mut rams {
        ram.fill(0xAA);
    }

    snap.begin_load("slot0").expect("begin load");
    let op = snap.load_op().expect("load op");
    for ram in &mut rams {
        op.register_block(ram.block());
    }
    op.start(false).expect("eager load");
    snap.end_load(true).expect("end load");

    for (ram, expected) in rams.iter().zip(&expected) {
        assert_eq!(ram.bytes(), expected.as_slice(), "block {}", ram.id);
    }
}

#[test]
fn roundtrip_compressed() {
    roundtrip(SnapshotConfig::default());
}

#[test]
fn roundtrip_uncompressed() {
    roundtrip(SnapshotConfig {
        compress: false,
        ..SnapshotConfig::default()
    });
}

#[test]
fn roundtrip_without_decompress_pool() {
    roundtrip(SnapshotConfig {
        decompress_workers: 0,
        ..SnapshotConfig::default()
    });
}

#[test]
fn zero_pages_cost_no_disk_reads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut snap = snapshotter(dir.path(), SnapshotConfig::default());

    let mut ram = GuestRam::new("pc.ram", PAGE * 32, PAGE);
    ram.randomize(0.5);
    let nonzero = ram.nonzero_page_count();
    assert!(nonzero > 0 && nonzero < ram.page_count(), "needs both kinds");
    let expected = ram.bytes().to_vec();

    save_ram_snapshot(&mut snap, "zeroes", std::slice::from_mut(&mut ram)).expect("save snapshot");
    ram.fill(0x55);

    snap.begin_load("zeroes").expect("begin load");
    let op = snap.load_op().expect("load op");
    op.register_block(ram.block());
    op.start(false).expect("eager load");
    assert_eq!(op.ram().disk_read_count(), nonzero);
    snap.end_load(true).expect("end load");

    assert_eq!(ram.bytes(), expected.as_slice());
}

#[test]
fn eager_reads_are_sequential() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut snap = snapshotter(dir.path(), SnapshotConfig::default());

    let mut ram = GuestRam::new("pc.ram", PAGE * 64, PAGE);
    ram.randomize(0.2);
    save_ram_snapshot(&mut snap, "seq", std::slice::from_mut(&mut ram)).expect("save snapshot");
    ram.fill(0);

    snap.begin_load("seq").expect("begin load");
    let op = snap.load_op().expect("load op");
    op.register_block(ram.block());
    op.start(false).expect("eager load");
    let offsets = op.ram().read_offsets();
    assert!(
        offsets.windows(2).all(|w| w[0] <= w[1]),
        "eager reads must be in non-decreasing offset order: {offsets:?}"
    );
    snap.end_load(true).expect("end load");
}

#[test]
fn save_stats_are_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut snap = snapshotter(dir.path(), SnapshotConfig::default());

    let mut ram = GuestRam::new("pc.ram", PAGE * 8, PAGE);
    ram.randomize(0.0);
    save_ram_snapshot(&mut snap, "stats", std::slice::from_mut(&mut ram)).expect("save snapshot");

    let stats = snap.last_stats().expect("stats");
    assert_eq!(stats.kind, glacier_snapshot::OpKind::Save);
    assert_eq!(stats.name, "stats");
    assert!(stats.succeeded);
    assert!(stats.compressed);
    assert!(stats.disk_size > 0);
}
