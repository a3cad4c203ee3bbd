//! Sequential texture store, `textures.bin`.
//!
//! Layout mirrors `ram.bin`'s header convention (all little-endian):
//!
//! ```text
//! [u64 index_offset]        <- patched by done(), 0 while writing
//! [texture byte runs]
//! index: [u32 version][u32 count] { [u32 tex_id][u64 file_pos] }*
//! ```
//!
//! Texture payloads are opaque to the store; the renderer's own encoding
//! knows where each one ends, so the index records start offsets only.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::{Result, SnapshotError};
use crate::index::DATA_START;

pub const TEXTURE_VERSION: u32 = 1;

pub struct TextureSaver {
    path: PathBuf,
    out: BufWriter<File>,
    entries: Vec<(u32, u64)>,
    finished: bool,
    has_error: bool,
}

impl TextureSaver {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(&0u64.to_le_bytes())?;
        Ok(Self {
            path,
            out,
            entries: Vec::new(),
            finished: false,
            has_error: false,
        })
    }

    /// Records the texture's start offset, then lets `write` stream the
    /// payload. Each id may be saved once per snapshot.
    pub fn save_texture<F>(&mut self, tex_id: u32, write: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        let result = self.save_texture_inner(tex_id, write);
        if result.is_err() {
            self.has_error = true;
        }
        result
    }

    fn save_texture_inner<F>(&mut self, tex_id: u32, write: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        if self.finished {
            return Err(SnapshotError::InvalidOperation("texture saver finished"));
        }
        if self.entries.iter().any(|&(id, _)| id == tex_id) {
            return Err(SnapshotError::DuplicateTexture { id: tex_id });
        }
        let pos = self.out.stream_position()?;
        write(&mut self.out)?;
        self.entries.push((tex_id, pos));
        Ok(())
    }

    /// Writes the index and patches the offset header; the file is only
    /// valid once this returns `Ok`.
    pub fn done(&mut self) -> Result<u64> {
        let result = self.done_inner();
        if result.is_err() {
            self.has_error = true;
        }
        result
    }

    fn done_inner(&mut self) -> Result<u64> {
        if self.finished {
            return Err(SnapshotError::InvalidOperation("texture saver finished"));
        }
        self.finished = true;

        let index_offset = self.out.stream_position()?;
        self.out.write_all(&TEXTURE_VERSION.to_le_bytes())?;
        let count = u32::try_from(self.entries.len())
            .map_err(|_| SnapshotError::CorruptIndex("too many textures"))?;
        self.out.write_all(&count.to_le_bytes())?;
        for &(tex_id, pos) in &self.entries {
            self.out.write_all(&tex_id.to_le_bytes())?;
            self.out.write_all(&pos.to_le_bytes())?;
        }
        self.out.flush()?;

        let file = self.out.get_mut();
        let disk_size = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&index_offset.to_le_bytes())?;
        file.sync_all()?;
        tracing::debug!(
            path = %self.path.display(),
            textures = self.entries.len(),
            "texture save complete"
        );
        Ok(disk_size)
    }

    /// True if any texture write or the final index write failed. A saver
    /// with an error must not be committed.
    pub fn has_error(&self) -> bool {
        self.has_error
    }
}

pub struct TextureLoader {
    input: BufReader<File>,
    /// In stored (file) order.
    entries: Vec<(u32, u64)>,
}

impl TextureLoader {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let mut input = BufReader::new(File::open(path.into())?);
        let file_len = input.seek(SeekFrom::End(0))?;
        input.seek(SeekFrom::Start(0))?;

        let mut header = [0u8; 8];
        input.read_exact(&mut header)?;
        let index_offset = u64::from_le_bytes(header);
        if index_offset < DATA_START || index_offset > file_len {
            return Err(SnapshotError::CorruptIndex("texture index offset out of range"));
        }
        input.seek(SeekFrom::Start(index_offset))?;

        let version = read_u32(&mut input)?;
        if version != TEXTURE_VERSION {
            return Err(SnapshotError::IncompatibleVersion {
                expected: TEXTURE_VERSION,
                found: version,
            });
        }
        let count = read_u32(&mut input)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let tex_id = read_u32(&mut input)?;
            let mut pos = [0u8; 8];
            input.read_exact(&mut pos)?;
            let pos = u64::from_le_bytes(pos);
            if pos < DATA_START || pos > index_offset {
                return Err(SnapshotError::CorruptIndex("texture offset out of range"));
            }
            if entries.iter().any(|&(id, _)| id == tex_id) {
                return Err(SnapshotError::CorruptIndex("duplicate texture id"));
            }
            entries.push((tex_id, pos));
        }
        Ok(Self { input, entries })
    }

    pub fn texture_count(&self) -> usize {
        self.entries.len()
    }

    pub fn has_texture(&self, tex_id: u32) -> bool {
        self.entries.iter().any(|&(id, _)| id == tex_id)
    }

    /// Positions the stream at the texture's payload and hands it to
    /// `read`, which consumes exactly as much as the renderer encoded.
    pub fn load_texture<F>(&mut self, tex_id: u32, read: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Read) -> std::io::Result<()>,
    {
        let &(_, pos) = self
            .entries
            .iter()
            .find(|&&(id, _)| id == tex_id)
            .ok_or(SnapshotError::UnknownTexture { id: tex_id })?;
        self.input.seek(SeekFrom::Start(pos))?;
        read(&mut self.input)?;
        Ok(())
    }

    /// Visits every texture in file order. Used by the background pass
    /// that warms all textures once after an on-demand load.
    pub fn for_each_texture<F>(&mut self, mut read: F) -> Result<()>
    where
        F: FnMut(u32, &mut dyn Read) -> std::io::Result<()>,
    {
        for i in 0..self.entries.len() {
            let (tex_id, pos) = self.entries[i];
            self.input.seek(SeekFrom::Start(pos))?;
            read(tex_id, &mut self.input)?;
        }
        Ok(())
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("textures.bin");
        (dir, path)
    }

    fn payload(tex_id: u32, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u32 ^ tex_id) as u8).collect()
    }

    #[test]
    fn roundtrip_with_length_prefixed_payloads() {
        let (_dir, path) = temp_store();
        let mut saver = TextureSaver::new(&path).expect("saver");
        for (tex_id, len) in [(7u32, 100usize), (3, 0), (900, 4096)] {
            let bytes = payload(tex_id, len);
            saver
                .save_texture(tex_id, |w| {
                    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
                    w.write_all(&bytes)
                })
                .expect("save texture");
        }
        saver.done().expect("done");

        let mut loader = TextureLoader::new(&path).expect("loader");
        assert_eq!(loader.texture_count(), 3);
        for (tex_id, len) in [(900u32, 4096usize), (7, 100), (3, 0)] {
            let mut got = Vec::new();
            loader
                .load_texture(tex_id, |r| {
                    let mut len_buf = [0u8; 4];
                    r.read_exact(&mut len_buf)?;
                    got.resize(u32::from_le_bytes(len_buf) as usize, 0);
                    r.read_exact(&mut got)
                })
                .expect("load texture");
            assert_eq!(got, payload(tex_id, len));
        }
    }

    #[test]
    fn duplicate_id_rejected_at_save() {
        let (_dir, path) = temp_store();
        let mut saver = TextureSaver::new(&path).expect("saver");
        saver.save_texture(5, |w| w.write_all(b"a")).expect("first");
        match saver.save_texture(5, |w| w.write_all(b"b")) {
            Err(SnapshotError::DuplicateTexture { id }) => assert_eq!(id, 5),
            other => panic!("expected DuplicateTexture, got {other:?}"),
        }
    }

    #[test]
    fn unknown_id_rejected_at_load() {
        let (_dir, path) = temp_store();
        let mut saver = TextureSaver::new(&path).expect("saver");
        saver.save_texture(1, |w| w.write_all(b"x")).expect("save");
        saver.done().expect("done");

        let mut loader = TextureLoader::new(&path).expect("loader");
        match loader.load_texture(2, |_| Ok(())) {
            Err(SnapshotError::UnknownTexture { id }) => assert_eq!(id, 2),
            other => panic!("expected UnknownTexture, got {other:?}"),
        }
    }

    #[test]
    fn unfinished_store_rejected() {
        let (_dir, path) = temp_store();
        let mut saver = TextureSaver::new(&path).expect("saver");
        saver.save_texture(1, |w| w.write_all(b"x")).expect("save");
        drop(saver); // no done(): header still zero
        assert!(matches!(
            TextureLoader::new(&path),
            Err(SnapshotError::CorruptIndex(_))
        ));
    }

    #[test]
    fn for_each_visits_in_file_order() {
        let (_dir, path) = temp_store();
        let mut saver = TextureSaver::new(&path).expect("saver");
        for tex_id in [30u32, 10, 20] {
            saver
                .save_texture(tex_id, |w| w.write_all(&tex_id.to_le_bytes()))
                .expect("save");
        }
        saver.done().expect("done");

        let mut seen = Vec::new();
        let mut loader = TextureLoader::new(&path).expect("loader");
        loader
            .for_each_texture(|tex_id, r| {
                let mut buf = [0u8; 4];
                r.read_exact(&mut buf)?;
                assert_eq!(u32::from_le_bytes(buf), tex_id);
                seen.push(tex_id);
                Ok(())
            })
            .expect("iterate");
        assert_eq!(seen, vec![30, 10, 20]);
    }
}
