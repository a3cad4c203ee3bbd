//! Writes guest RAM into `ram.bin`.
//!
//! Pages are zero-checked first (zero pages cost nothing on disk),
//! optionally LZ4-compressed, and appended in call order. The index goes
//! in last and the leading offset word is patched as the final act, so a
//! save that dies mid-write leaves a file the loader refuses to parse.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Result, SnapshotError};
use crate::index::{self, DATA_START, IndexBlock, PageRecord};
use crate::ram::RamBlock;
use crate::zero;

struct SaverBlock {
    block: RamBlock,
    /// One record per page; pages never saved stay `{0, 0}` and are
    /// stored as zero pages.
    records: Vec<PageRecord>,
}

pub struct RamSaver {
    path: PathBuf,
    out: BufWriter<File>,
    blocks: Vec<SaverBlock>,
    compress: bool,
    /// Next byte to be written in the data region.
    pos: u64,
    disk_size: u64,
    has_error: bool,
    joined: bool,
    started_at: Instant,
    duration: Option<Duration>,
}

impl RamSaver {
    pub fn new(path: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let path = path.into();
        let mut out = BufWriter::new(File::create(&path)?);
        // Offset header placeholder; zero marks the file unfinished.
        out.write_all(&0u64.to_le_bytes())?;
        Ok(Self {
            path,
            out,
            blocks: Vec::new(),
            compress,
            pos: DATA_START,
            disk_size: 0,
            has_error: false,
            joined: false,
            started_at: Instant::now(),
            duration: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn register_block(&mut self, block: RamBlock) {
        let records = vec![
            PageRecord {
                size_on_disk: 0,
                file_pos: 0
            };
            block.page_count()
        ];
        self.blocks.push(SaverBlock { block, records });
    }

    /// Saves one page. `page_offset` is the page's byte offset within the
    /// block and must be page-aligned; `size` must match the page's
    /// in-memory length (short only for a block's tail page).
    pub fn save_page(&mut self, block_index: usize, page_offset: usize, size: usize) -> Result<()> {
        let result = self.save_page_inner(block_index, page_offset, size);
        if result.is_err() {
            self.has_error = true;
        }
        result
    }

    fn save_page_inner(
        &mut self,
        block_index: usize,
        page_offset: usize,
        size: usize,
    ) -> Result<()> {
        let entry = self
            .blocks
            .get(block_index)
            .ok_or(SnapshotError::InvalidOperation("unregistered block"))?;
        let block = &entry.block;
        if page_offset % block.page_size != 0 {
            return Err(SnapshotError::InvalidOperation("unaligned page offset"));
        }
        let page_index = page_offset / block.page_size;
        if page_index >= entry.records.len() {
            return Err(SnapshotError::InvalidOperation("page offset out of range"));
        }
        if size != block.page_len(page_index) {
            return Err(SnapshotError::InvalidOperation("page size mismatch"));
        }
        // SAFETY: the VM is paused for the whole save; nothing mutates
        // guest memory while we read it.
        let src: &[u8] = unsafe { block.page_slice_mut(page_index) };

        if zero::is_zero_page(src) {
            self.blocks[block_index].records[page_index] = PageRecord {
                size_on_disk: 0,
                file_pos: 0,
            };
            return Ok(());
        }

        let file_pos = self.pos;
        let stored_len = if self.compress {
            let compressed = lz4_flex::block::compress(src);
            self.out.write_all(&compressed)?;
            compressed.len()
        } else {
            self.out.write_all(src)?;
            src.len()
        };
        self.blocks[block_index].records[page_index] = PageRecord {
            size_on_disk: u32::try_from(stored_len)
                .map_err(|_| SnapshotError::CorruptIndex("page length overflow"))?,
            file_pos,
        };
        self.pos += stored_len as u64;
        Ok(())
    }

    /// Saves every page of every registered block, in block order.
    pub fn save_all(&mut self) -> Result<()> {
        for block_index in 0..self.blocks.len() {
            let page_count = self.blocks[block_index].records.len();
            let page_size = self.blocks[block_index].block.page_size;
            for page_index in 0..page_count {
                let size = self.blocks[block_index].block.page_len(page_index);
                self.save_page(block_index, page_index * page_size, size)?;
            }
        }
        Ok(())
    }

    /// Writes the index, patches the offset header, and flushes. The file
    /// is only valid once this returns `Ok`.
    pub fn join(&mut self) -> Result<()> {
        let result = self.join_inner();
        if result.is_err() {
            self.has_error = true;
        }
        result
    }

    fn join_inner(&mut self) -> Result<()> {
        if self.joined {
            return Err(SnapshotError::InvalidOperation("ram saver already joined"));
        }
        self.joined = true;

        let index_offset = self.pos;
        let index: Vec<IndexBlock<'_>> = self
            .blocks
            .iter()
            .map(|entry| IndexBlock {
                id: &entry.block.id,
                page_size: entry.block.page_size,
                pages: &entry.records,
            })
            .collect();
        index::write_index(&mut self.out, &index, self.compress)?;
        self.out.flush()?;

        let file = self.out.get_mut();
        self.disk_size = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&index_offset.to_le_bytes())?;
        file.sync_all()?;
        self.duration = Some(self.started_at.elapsed());
        tracing::info!(
            path = %self.path.display(),
            disk_size = self.disk_size,
            compressed = self.compress,
            "ram save complete"
        );
        Ok(())
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn compressed(&self) -> bool {
        self.compress
    }

    /// Final size of `ram.bin`; 0 until a successful join.
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}
