//! The `ram.bin` index: reader and writer.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [u64 index_offset]                      <- patched last, 0 while writing
//! [page bytes for all non-empty pages]
//! index:
//!   [u32 version][u32 flags][u32 block_count]
//!   per block: [u8 id_len][id bytes][u32 page_count]
//!     per page: varint size field          (0 = zero page, never stored)
//!               if nonzero: signed varint  (file_pos - previous page end)
//! ```
//!
//! The size field is the exact on-disk byte count when pages are
//! compressed, and a page-multiple count otherwise (the actual byte count
//! is then just the page's in-memory length). File positions are encoded
//! as deltas against the end of the previous non-empty page, which keeps
//! them to one or two bytes for a sequentially written file. Signed
//! values use sign-and-magnitude packing: magnitude shifted left one bit,
//! sign in bit 0.
//!
//! Because the index is appended after all page data and the leading
//! offset word is written as the final act, a crashed save leaves a file
//! whose header still reads zero, which the loader rejects outright.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, SnapshotError};
use crate::ram::{Page, RamBlock};

pub const INDEX_VERSION: u32 = 2;
pub const FLAG_COMPRESSED: u32 = 1 << 0;
/// First byte of page data, just past the index-offset header.
pub const DATA_START: u64 = 8;

const ALL_FLAGS: u32 = FLAG_COMPRESSED;
const MAX_VARINT_BYTES: u32 = 10;

/// On-disk placement of one page, collected by the saver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRecord {
    /// 0 for zero pages.
    pub size_on_disk: u32,
    pub file_pos: u64,
}

/// One block's worth of records, in page order, for [`write_index`].
pub struct IndexBlock<'a> {
    pub id: &'a str,
    pub page_size: usize,
    pub pages: &'a [PageRecord],
}

/// The fully decoded index for a load: the global page table plus each
/// registered block's slice of it. Built once, immutable thereafter.
#[derive(Debug)]
pub struct ParsedIndex {
    pub compressed: bool,
    pub blocks: Vec<BlockEntry>,
    pub pages: Vec<Page>,
}

/// Associates a registered [`RamBlock`] with its half-open page range in
/// the global table.
#[derive(Debug)]
pub struct BlockEntry {
    pub block: RamBlock,
    pub pages_begin: usize,
    pub pages_end: usize,
}

pub fn write_varint<W: Write>(w: &mut W, mut value: u64) -> Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            w.write_all(&[byte])?;
            return Ok(());
        }
        w.write_all(&[byte | 0x80])?;
    }
}

pub fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(r)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= MAX_VARINT_BYTES * 7 {
            return Err(SnapshotError::CorruptIndex("varint too long"));
        }
    }
}

/// Sign-and-magnitude packing: magnitude in the high bits, sign in bit 0.
pub fn pack_signed(value: i64) -> u64 {
    let sign = u64::from(value < 0);
    (value.unsigned_abs() << 1) | sign
}

pub fn unpack_signed(packed: u64) -> i64 {
    let magnitude = (packed >> 1) as i64;
    if packed & 1 == 1 { -magnitude } else { magnitude }
}

/// Appends the index at the writer's current position. The caller is
/// responsible for patching the leading offset word afterwards.
pub fn write_index<W: Write>(w: &mut W, blocks: &[IndexBlock<'_>], compressed: bool) -> Result<()> {
    let flags = if compressed { FLAG_COMPRESSED } else { 0 };
    w.write_all(&INDEX_VERSION.to_le_bytes())?;
    w.write_all(&flags.to_le_bytes())?;
    let block_count = u32::try_from(blocks.len())
        .map_err(|_| SnapshotError::CorruptIndex("too many blocks"))?;
    w.write_all(&block_count.to_le_bytes())?;

    let mut prev_end = DATA_START;
    for block in blocks {
        let id = block.id.as_bytes();
        let id_len =
            u8::try_from(id.len()).map_err(|_| SnapshotError::CorruptIndex("block id too long"))?;
        w.write_all(&[id_len])?;
        w.write_all(id)?;
        let page_count = u32::try_from(block.pages.len())
            .map_err(|_| SnapshotError::CorruptIndex("too many pages"))?;
        w.write_all(&page_count.to_le_bytes())?;

        for record in block.pages {
            if record.size_on_disk == 0 {
                write_varint(w, 0)?;
                continue;
            }
            let size_field = if compressed {
                u64::from(record.size_on_disk)
            } else {
                (record.size_on_disk as u64).div_ceil(block.page_size as u64)
            };
            write_varint(w, size_field)?;
            let delta = record.file_pos as i64 - prev_end as i64;
            write_varint(w, pack_signed(delta))?;
            prev_end = record.file_pos + u64::from(record.size_on_disk);
        }
    }
    Ok(())
}

/// Reads and validates the index, resolving stored block ids against the
/// blocks the VM registered (order-insensitive; lookup is by id).
pub fn read_index<R: Read + Seek>(r: &mut R, expected_blocks: &[RamBlock]) -> Result<ParsedIndex> {
    let file_len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(0))?;
    let index_offset = read_u64(r)?;
    if index_offset < DATA_START || index_offset >= file_len {
        // A zero header is the signature of a save that died mid-write.
        return Err(SnapshotError::CorruptIndex("index offset out of range"));
    }
    r.seek(SeekFrom::Start(index_offset))?;

    let version = read_u32(r)?;
    if version != INDEX_VERSION {
        return Err(SnapshotError::IncompatibleVersion {
            expected: INDEX_VERSION,
            found: version,
        });
    }
    let flags = read_u32(r)?;
    if flags & !ALL_FLAGS != 0 {
        return Err(SnapshotError::CorruptIndex("unknown flag bits"));
    }
    let compressed = flags & FLAG_COMPRESSED != 0;

    let block_count = read_u32(r)? as usize;
    if block_count != expected_blocks.len() {
        return Err(SnapshotError::CorruptIndex("block count mismatch"));
    }

    let mut blocks = Vec::with_capacity(block_count);
    let mut pages = Vec::new();
    let mut prev_end = DATA_START;
    for _ in 0..block_count {
        let id = read_block_id(r)?;
        let block = expected_blocks
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(SnapshotError::UnknownBlock { id })?;
        if blocks.iter().any(|e: &BlockEntry| e.block.id == block.id) {
            return Err(SnapshotError::CorruptIndex("duplicate block id"));
        }

        let page_count = read_u32(r)? as usize;
        if page_count != block.page_count() {
            return Err(SnapshotError::CorruptIndex("page count mismatch"));
        }
        let block_index = u32::try_from(blocks.len())
            .map_err(|_| SnapshotError::CorruptIndex("too many blocks"))?;

        let pages_begin = pages.len();
        for page_index in 0..page_count {
            let size_field = read_varint(r)?;
            if size_field == 0 {
                pages.push(Page::new(block_index, 0, 0));
                continue;
            }
            let page_len = block.page_len(page_index);
            let size_on_disk = decode_size(size_field, page_len, compressed)?;
            let delta = unpack_signed(read_varint(r)?);
            let file_pos = prev_end
                .checked_add_signed(delta)
                .ok_or(SnapshotError::CorruptIndex("file position underflow"))?;
            let end = file_pos + u64::from(size_on_disk);
            if file_pos < DATA_START || end > index_offset {
                return Err(SnapshotError::CorruptIndex("page outside data region"));
            }
            prev_end = end;
            pages.push(Page::new(block_index, size_on_disk, file_pos));
        }
        blocks.push(BlockEntry {
            block,
            pages_begin,
            pages_end: pages.len(),
        });
    }

    Ok(ParsedIndex {
        compressed,
        blocks,
        pages,
    })
}

fn decode_size(size_field: u64, page_len: usize, compressed: bool) -> Result<u32> {
    if compressed {
        // LZ4 worst case: input + input/255 + 16.
        let max = page_len as u64 + page_len as u64 / 255 + 16;
        if size_field > max {
            return Err(SnapshotError::CorruptIndex("compressed page too large"));
        }
        Ok(size_field as u32)
    } else {
        // Single-page records occupy exactly one page multiple.
        if size_field != 1 {
            return Err(SnapshotError::CorruptIndex("bad page multiple"));
        }
        u32::try_from(page_len).map_err(|_| SnapshotError::CorruptIndex("page length overflow"))
    }
}

fn read_block_id<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u8(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| SnapshotError::CorruptIndex("block id not utf-8"))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;
    use crate::ram::PageState;

    fn varint_roundtrip(value: u64) -> u64 {
        let mut buf = Vec::new();
        write_varint(&mut buf, value).expect("write");
        read_varint(&mut Cursor::new(buf)).expect("read")
    }

    #[test]
    fn varint_edges() {
        for v in [0, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            assert_eq!(varint_roundtrip(v), v);
        }
    }

    #[test]
    fn signed_packing_puts_sign_in_bit_zero() {
        assert_eq!(pack_signed(0), 0);
        assert_eq!(pack_signed(1), 2);
        assert_eq!(pack_signed(-1), 3);
        assert_eq!(pack_signed(4096), 8192);
        assert_eq!(unpack_signed(pack_signed(-4096)), -4096);
    }

    proptest! {
        #[test]
        fn varint_roundtrips(value: u64) {
            prop_assert_eq!(varint_roundtrip(value), value);
        }

        #[test]
        fn signed_roundtrips(value in i64::MIN / 2..=i64::MAX / 2) {
            prop_assert_eq!(unpack_signed(pack_signed(value)), value);
        }
    }

    /// A two-block index written compressed, with pages deliberately out
    /// of block order on disk to exercise the delta decoding.
    fn sample_file(compressed: bool) -> (Vec<u8>, Vec<RamBlock>) {
        let blocks = vec![
            RamBlock::new("pc.ram", 0x10_0000 as *mut u8, 4096 * 3, 4096),
            RamBlock::new("vram", 0x80_0000 as *mut u8, 4096 * 2, 4096),
        ];
        let a = [
            PageRecord { size_on_disk: if compressed { 900 } else { 4096 }, file_pos: 8 },
            PageRecord { size_on_disk: 0, file_pos: 0 },
            PageRecord { size_on_disk: if compressed { 1100 } else { 4096 }, file_pos: if compressed { 908 } else { 4104 } },
        ];
        let b = [
            PageRecord { size_on_disk: 0, file_pos: 0 },
            PageRecord { size_on_disk: if compressed { 70 } else { 4096 }, file_pos: if compressed { 2008 } else { 8200 } },
        ];
        let data_end = b[1].file_pos + u64::from(b[1].size_on_disk);

        let mut file = vec![0u8; data_end as usize];
        {
            let mut cursor = Cursor::new(&mut file);
            cursor.set_position(data_end);
            let index = [
                IndexBlock { id: "pc.ram", page_size: 4096, pages: &a },
                IndexBlock { id: "vram", page_size: 4096, pages: &b },
            ];
            write_index(&mut cursor, &index, compressed).expect("write index");
        }
        file[..8].copy_from_slice(&data_end.to_le_bytes());
        (file, blocks)
    }

    #[test]
    fn roundtrip_compressed_and_raw() {
        for compressed in [true, false] {
            let (file, blocks) = sample_file(compressed);
            let parsed =
                read_index(&mut Cursor::new(&file), &blocks).expect("parse");
            assert_eq!(parsed.compressed, compressed);
            assert_eq!(parsed.blocks.len(), 2);
            assert_eq!(parsed.pages.len(), 5);
            assert_eq!(parsed.blocks[0].pages_begin, 0);
            assert_eq!(parsed.blocks[0].pages_end, 3);
            assert_eq!(parsed.blocks[1].pages_begin, 3);
            assert!(parsed.pages[1].is_zero());
            assert_eq!(parsed.pages[1].state(), PageState::Read);
            assert_eq!(parsed.pages[0].file_pos, 8);
            if compressed {
                assert_eq!(parsed.pages[0].size_on_disk, 900);
                assert_eq!(parsed.pages[4].file_pos, 2008);
            } else {
                assert_eq!(parsed.pages[0].size_on_disk, 4096);
                assert_eq!(parsed.pages[4].file_pos, 8200);
            }
        }
    }

    #[test]
    fn registration_order_does_not_matter() {
        let (file, mut blocks) = sample_file(true);
        blocks.reverse();
        let parsed = read_index(&mut Cursor::new(&file), &blocks).expect("parse");
        // Stored order wins; lookup is by id.
        assert_eq!(parsed.blocks[0].block.id, "pc.ram");
        assert_eq!(parsed.blocks[1].block.id, "vram");
    }

    #[test]
    fn rejects_unknown_block() {
        let (file, _) = sample_file(true);
        let other = vec![
            RamBlock::new("pc.ram", 0x10_0000 as *mut u8, 4096 * 3, 4096),
            RamBlock::new("different", 0x80_0000 as *mut u8, 4096 * 2, 4096),
        ];
        match read_index(&mut Cursor::new(&file), &other) {
            Err(SnapshotError::UnknownBlock { id }) => assert_eq!(id, "vram"),
            other => panic!("expected UnknownBlock, got {other:?}"),
        }
    }

    #[test]
    fn rejects_version_mismatch() {
        let (mut file, blocks) = sample_file(true);
        let index_offset = u64::from_le_bytes(file[..8].try_into().expect("header")) as usize;
        file[index_offset..index_offset + 4].copy_from_slice(&77u32.to_le_bytes());
        match read_index(&mut Cursor::new(&file), &blocks) {
            Err(SnapshotError::IncompatibleVersion { expected, found }) => {
                assert_eq!(expected, INDEX_VERSION);
                assert_eq!(found, 77);
            }
            other => panic!("expected IncompatibleVersion, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unfinished_header() {
        let (mut file, blocks) = sample_file(true);
        file[..8].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            read_index(&mut Cursor::new(&file), &blocks),
            Err(SnapshotError::CorruptIndex(_))
        ));
    }
}
