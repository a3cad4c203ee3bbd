#![allow(dead_code)]

use anyhow::{Context, Result};
use glacier_snapshot::{RamBlock, SnapshotConfig, Snapshotter};
use rand::Rng;

#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub const PAGE: usize = 4096;

/// A stand-in for one guest memory region. The buffer is heap-allocated
/// and pinned for the struct's lifetime, so its address can be handed to
/// the engine as a `RamBlock`.
pub struct GuestRam {
    pub id: String,
    buf: Box<[u8]>,
    pub page_size: usize,
}

impl GuestRam {
    pub fn new(id: &str, size: usize, page_size: usize) -> Self {
        Self {
            id: id.to_owned(),
            buf: vec![0u8; size].into_boxed_slice(),
            page_size,
        }
    }

    /// Randomizes contents page by page; roughly `zero_ratio` of the
    /// pages are left all-zero to exercise the elision path.
    pub fn randomize(&mut self, zero_ratio: f64) {
        let mut rng = rand::rng();
        let page_size = self.page_size;
        for page in self.buf.chunks_mut(page_size) {
            if rng.random_bool(zero_ratio) {
                page.fill(0);
            } else {
                rng.fill(page);
            }
        }
    }

    pub fn fill(&mut self, byte: u8) {
        self.buf.fill(byte);
    }

    pub fn block(&mut self) -> RamBlock {
        RamBlock::new(&self.id, self.buf.as_mut_ptr(), self.buf.len(), self.page_size)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn base_addr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn page_count(&self) -> usize {
        self.buf.len().div_ceil(self.page_size)
    }

    pub fn nonzero_page_count(&self) -> usize {
        self.buf
            .chunks(self.page_size)
            .filter(|page| page.iter().any(|&b| b != 0))
            .count()
    }
}

pub fn snapshotter(root: &std::path::Path, config: SnapshotConfig) -> Snapshotter {
    let mut snap = Snapshotter::new(root.join("snapshots"), config).expect("snapshotter");
    // Tests choose their watcher explicitly; the platform default would
    // write-protect real test memory.
    snap.set_watch(None);
    snap
}

/// Saves the current contents of `rams` under `name`.
pub fn save_ram_snapshot(snap: &mut Snapshotter, name: &str, rams: &mut [GuestRam]) -> Result<()> {
    snap.begin_save(name).with_context(|| format!("begin save {name:?}"))?;
    let op = snap.save_op().context("save op missing")?;
    for ram in rams.iter_mut() {
        op.register_block(ram.block());
    }
    op.save_all_ram().context("save ram")?;
    snap.end_save(true).context("end save")?;
    Ok(())
}
