// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Memory file buffer, used to stage recording output before it moves to
//! final storage.
//!
//! The segment muxer wants file semantics (write, seek back to patch
//! headers, read off the result) without touching the disk until a segment
//! is complete. Storage is chunked so a growing recording never reallocates
//! or copies what's already written.

use base::{bail, err, Error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_SIZE: usize = 512 * 1024 * 1024;

pub struct BufferedFile {
    name: String,
    chunk_size: usize,
    max_size: usize,
    /// Size of the file: the furthest position ever written.
    last_written: usize,
    write_pos: usize,
    invalid: bool,
    chunks: Vec<Vec<u8>>,
}

impl BufferedFile {
    pub fn new(name: &str) -> Self {
        Self::with_limits(name, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SIZE)
    }

    pub fn with_limits(name: &str, chunk_size: usize, max_size: usize) -> Self {
        assert!(chunk_size > 0);
        BufferedFile {
            name: name.to_owned(),
            chunk_size,
            max_size,
            last_written: 0,
            write_pos: 0,
            invalid: false,
            chunks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.last_written
    }

    pub fn is_empty(&self) -> bool {
        self.last_written == 0
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    /// Repositions the write cursor; never beyond the end of the file or
    /// before its start.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, Error> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(rel) => self.write_pos as i64 + rel,
            SeekFrom::End(rel) => self.last_written as i64 + rel,
        };
        if target < 0 || target > self.last_written as i64 || self.invalid {
            bail!(
                InvalidState,
                "seek to {target} out of range (size {})",
                self.last_written
            );
        }
        self.write_pos = target as usize;
        Ok(self.write_pos as u64)
    }

    /// Writes at the current position, splitting across as many chunks as
    /// needed and allocating new ones lazily. Exceeding the maximum size
    /// latches the invalid flag; all further writes fail.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.invalid {
            bail!(InvalidState, "{}: buffered file previously failed", self.name);
        }
        let mut total_written = 0;
        while total_written < data.len() {
            let n = std::cmp::min(data.len() - total_written, self.chunk_size);
            let written = self.write_to_chunk(&data[total_written..total_written + n]);
            if written == 0 {
                self.invalid = true;
                bail!(
                    InvalidState,
                    "{}: exceeded maximum buffered size {}",
                    self.name,
                    self.max_size
                );
            }
            total_written += written;
        }
        Ok(())
    }

    /// Writes into the chunk under the cursor; returns bytes written
    /// (zero when a needed allocation is refused).
    fn write_to_chunk(&mut self, data: &[u8]) -> usize {
        let current = self.write_pos / self.chunk_size;
        let offset = self.write_pos % self.chunk_size;

        // We should, at most, need one more chunk.
        if current > self.chunks.len() {
            return 0;
        }
        if current == self.chunks.len() {
            if self.chunk_size * self.chunks.len() >= self.max_size {
                return 0;
            }
            self.chunks.push(vec![0u8; self.chunk_size]);
        }

        let written = std::cmp::min(self.chunk_size - offset, data.len());
        if written > 0 {
            self.chunks[current][offset..offset + written].copy_from_slice(&data[..written]);
            self.write_pos += written;
            self.last_written = std::cmp::max(self.write_pos, self.last_written);
        }
        written
    }

    /// Streams the contents; the final chunk is truncated at the file size.
    pub fn save_to<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        if self.invalid {
            bail!(InvalidState, "{}: buffered file previously failed", self.name);
        }
        let n_chunks = self.chunks.len();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let n = if i + 1 != n_chunks {
                self.chunk_size
            } else {
                let tail = self.last_written % self.chunk_size;
                if tail == 0 && self.last_written > 0 {
                    self.chunk_size
                } else {
                    tail
                }
            };
            out.write_all(&chunk[..n])?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut f = std::fs::File::create(path)?;
        self.save_to(&mut f)?;
        f.flush()?;
        Ok(())
    }

    /// The logical byte sequence, for consumers that re-read the staged
    /// file (the playlist writer, tests).
    pub fn contents(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(self.last_written);
        self.save_to(&mut out)?;
        Ok(out)
    }
}

/// Buffered files keyed by name, so the muxer can stage a segment in
/// memory and the recorder can later move it into place.
#[derive(Default)]
pub struct FileRegistry {
    files: Mutex<HashMap<String, Arc<Mutex<BufferedFile>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        FileRegistry::default()
    }

    /// Creates (or replaces) a staged file under `name`.
    pub fn create(
        &self,
        name: &str,
        chunk_size: usize,
        max_size: usize,
    ) -> Arc<Mutex<BufferedFile>> {
        let f = Arc::new(Mutex::new(BufferedFile::with_limits(
            name, chunk_size, max_size,
        )));
        self.files.lock().insert(name.to_owned(), f.clone());
        f
    }

    pub fn open(&self, name: &str) -> Option<Arc<Mutex<BufferedFile>>> {
        self.files.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Mutex<BufferedFile>>> {
        self.files.lock().remove(name)
    }

    /// Moves a staged file into its destination path: writes a sibling
    /// temporary file, then renames it into place. On failure the contents
    /// are saved to `fallback` instead, preserving the data for a retry.
    pub fn publish(
        &self,
        name: &str,
        dest: &Path,
        fallback: Option<&Path>,
    ) -> Result<PathBuf, Error> {
        let staged = self
            .remove(name)
            .ok_or_else(|| err!(InvalidArgument, "no staged file named {name:?}"))?;
        let staged = staged.lock();

        let result = (|| -> Result<(), Error> {
            let tmp = dest.with_extension("tmp");
            staged.save(&tmp)?;
            std::fs::rename(&tmp, dest)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                debug!("published {name} to {}", dest.display());
                Ok(dest.to_path_buf())
            }
            Err(e) => match fallback {
                Some(fb) => {
                    warn!(
                        "failed to publish {name} to {}: {e}; saving to {}",
                        dest.display(),
                        fb.display()
                    );
                    staged.save(fb)?;
                    Ok(fb.to_path_buf())
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_overwrite_and_save() {
        let mut f = BufferedFile::with_limits("seg", 4, 16);
        f.write(b"HELLO").unwrap();
        f.write(b"WORLD!").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write(b"hel").unwrap();
        // Overlapping writes overwrite in order; the size stays at the
        // furthest position reached.
        assert_eq!(f.len(), 11);
        assert_eq!(f.contents().unwrap(), b"helLOWORLD!");
    }

    #[test]
    fn seek_bounds() {
        let mut f = BufferedFile::with_limits("seg", 4, 16);
        f.write(b"abcdef").unwrap();
        assert_eq!(f.seek(SeekFrom::End(-2)).unwrap(), 4);
        assert_eq!(f.seek(SeekFrom::Current(1)).unwrap(), 5);
        assert!(f.seek(SeekFrom::Start(7)).is_err());
        assert!(f.seek(SeekFrom::Current(-6)).is_err());
        assert_eq!(f.seek(SeekFrom::End(0)).unwrap(), 6);
    }

    #[test]
    fn exceeding_max_size_latches_invalid() {
        let mut f = BufferedFile::with_limits("seg", 4, 8);
        f.write(b"12345678").unwrap();
        let e = f.write(b"9").unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidState);
        assert!(!f.is_valid());
        // Everything fails after the latch.
        assert!(f.write(b"x").is_err());
        assert!(f.seek(SeekFrom::Start(0)).is_err());
        assert!(f.save_to(&mut Vec::new()).is_err());
    }

    #[test]
    fn chunk_boundary_write_spans_allocations() {
        let mut f = BufferedFile::with_limits("seg", 4, 64);
        f.write(b"abc").unwrap();
        f.write(b"defghij").unwrap(); // spans three chunks
        assert_eq!(f.contents().unwrap(), b"abcdefghij");
        // Exact multiple of the chunk size keeps the last chunk whole.
        f.write(b"kl").unwrap();
        assert_eq!(f.contents().unwrap(), b"abcdefghijkl");
    }

    #[test]
    fn save_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.ts");
        let mut f = BufferedFile::with_limits("seg", 8, 1024);
        f.write(&[7u8; 20]).unwrap();
        f.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 20]);
    }

    #[test]
    fn registry_publishes_with_rename() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        let staged = registry.create("cam1-0001.ts", 8, 1024);
        staged.lock().write(b"segment-bytes").unwrap();

        let dest = dir.path().join("cam1-0001.ts");
        let published = registry.publish("cam1-0001.ts", &dest, None).unwrap();
        assert_eq!(published, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"segment-bytes");
        assert!(registry.open("cam1-0001.ts").is_none());
    }

    #[test]
    fn registry_falls_back_when_destination_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        let staged = registry.create("seg", 8, 1024);
        staged.lock().write(b"data").unwrap();

        let bad_dest = dir.path().join("missing-subdir").join("seg.ts");
        let fallback = dir.path().join("seg.retry.ts");
        let published = registry
            .publish("seg", &bad_dest, Some(&fallback))
            .unwrap();
        assert_eq!(published, fallback);
        assert_eq!(std::fs::read(&fallback).unwrap(), b"data");
    }
}
