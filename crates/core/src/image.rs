// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Fixed-size file-backed buffers serving as non-volatile device storage.
//!
//! A device opens its image once at construction time with a declared size;
//! the file either exists with exactly that size or is created filled with
//! 0xFF (erased flash) or 0x00. Writes are eventually durable; peripherals
//! needing atomicity layer their own magic-header scheme on top.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image {path} does not exist and no create flag was given")]
    NotFound { path: PathBuf },
    #[error("image {path} has size {actual} but {expected} was requested")]
    SizeMismatch {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },
    #[error("image {path} was opened read-only")]
    ReadOnly { path: PathBuf },
    #[error("image {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type ImageResult<T> = Result<T, ImageError>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u32 {
        const RDONLY = 1 << 0;
        const RDWR = 1 << 1;
        /// Create the file 0xFF-filled when it does not exist.
        const CREAT_FF = 1 << 2;
        /// Create the file 0x00-filled when it does not exist.
        const CREAT_00 = 1 << 3;
    }
}

/// A persistent device image. Lives for the lifetime of its device; the
/// file is released when the image drops (normally at process exit).
#[derive(Debug)]
pub struct DiskImage {
    path: PathBuf,
    file: std::fs::File,
    size: u64,
    writable: bool,
    map: Option<MmapMut>,
}

impl DiskImage {
    pub fn open<P: AsRef<Path>>(path: P, size: u64, flags: ImageFlags) -> ImageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let writable = flags.contains(ImageFlags::RDWR);
        let exists = path.exists();
        if !exists && !flags.intersects(ImageFlags::CREAT_FF | ImageFlags::CREAT_00) {
            return Err(ImageError::NotFound { path });
        }
        let io_err = |path: &PathBuf| {
            let path = path.clone();
            move |source| ImageError::Io { path, source }
        };
        let file = OpenOptions::new()
            .read(true)
            .write(writable || !exists)
            .create(!exists)
            .open(&path)
            .map_err(io_err(&path))?;
        if exists {
            let actual = file.metadata().map_err(io_err(&path))?.len();
            if actual != size {
                return Err(ImageError::SizeMismatch {
                    path,
                    actual,
                    expected: size,
                });
            }
        } else {
            file.set_len(size).map_err(io_err(&path))?;
            if flags.contains(ImageFlags::CREAT_FF) {
                let chunk = vec![0xFFu8; 64 * 1024];
                let mut off = 0u64;
                while off < size {
                    let n = chunk.len().min((size - off) as usize);
                    file.write_all_at(&chunk[..n], off).map_err(io_err(&path))?;
                    off += n as u64;
                }
            }
            // CREAT_00 needs no fill: set_len zero-extends.
            tracing::info!("created image {} ({} bytes)", path.display(), size);
        }
        Ok(Self {
            path,
            file,
            size,
            writable,
            map: None,
        })
    }

    /// Open `<imagedir>/<devname>.img`, the conventional per-device path.
    pub fn open_in<P: AsRef<Path>>(
        imagedir: P,
        devname: &str,
        size: u64,
        flags: ImageFlags,
    ) -> ImageResult<Self> {
        Self::open(imagedir.as_ref().join(format!("{devname}.img")), size, flags)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map the whole image into memory, mutable. Requires `RDWR`; the
    /// mapping is established once and lives as long as the image.
    pub fn mmap(&mut self) -> ImageResult<&mut [u8]> {
        if !self.writable {
            return Err(ImageError::ReadOnly {
                path: self.path.clone(),
            });
        }
        if self.map.is_none() {
            let map = unsafe { MmapMut::map_mut(&self.file) }.map_err(|source| ImageError::Io {
                path: self.path.clone(),
                source,
            })?;
            self.map = Some(map);
        }
        Ok(self.map.as_mut().unwrap())
    }

    /// Bounded read at `offset`; returns the number of bytes transferred
    /// (short at end of image).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ImageResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - offset) as usize);
        if let Some(map) = &self.map {
            buf[..n].copy_from_slice(&map[offset as usize..offset as usize + n]);
            return Ok(n);
        }
        self.file
            .read_exact_at(&mut buf[..n], offset)
            .map_err(|source| ImageError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(n)
    }

    /// Bounded write at `offset`; returns the number of bytes transferred.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> ImageResult<usize> {
        if !self.writable {
            return Err(ImageError::ReadOnly {
                path: self.path.clone(),
            });
        }
        if offset >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - offset) as usize);
        if let Some(map) = &mut self.map {
            map[offset as usize..offset as usize + n].copy_from_slice(&buf[..n]);
            return Ok(n);
        }
        self.file
            .write_all_at(&buf[..n], offset)
            .map_err(|source| ImageError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(n)
    }
}
