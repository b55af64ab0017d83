//! Sparse byte-range copy between files and block devices.
//!
//! Holes in the source are found with `SEEK_DATA`/`SEEK_HOLE` and never
//! read. Inside data extents, all-zero blocks are skipped when they land
//! beyond the destination's previous end, where the file already reads as
//! zeros.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Copy granularity
const BLOCK_SIZE: usize = 1024 * 1024;

/// Where to read from and write to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyRange {
    /// Byte offset into the source
    pub skip: u64,
    /// Byte offset into the destination
    pub seek: u64,
    /// Number of bytes; `None` copies up to the end of the source
    pub length: Option<u64>,
}

impl CopyRange {
    /// Copy the whole source to the start of the destination
    pub fn whole() -> Self {
        Self::default()
    }

    /// Extract `length` bytes starting at `skip`
    pub fn extract(skip: u64, length: u64) -> Self {
        Self {
            skip,
            seek: 0,
            length: Some(length),
        }
    }

    /// Place the whole source at `seek`
    pub fn place(seek: u64) -> Self {
        Self {
            skip: 0,
            seek,
            length: None,
        }
    }

    /// First `length` bytes, in place
    pub fn head(length: u64) -> Self {
        Self {
            skip: 0,
            seek: 0,
            length: Some(length),
        }
    }
}

/// Copy a byte range from `src` into `dst`, creating `dst` if needed.
///
/// Returns the number of bytes actually written.
pub fn sparse_copy(src: &Path, dst: &Path, range: CopyRange) -> Result<u64> {
    let source = File::open(src)?;
    let src_size = file_size(&source)?;
    let end = match range.length {
        Some(len) => (range.skip + len).min(src_size),
        None => src_size,
    };
    let length = end.saturating_sub(range.skip);

    let dest = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dst)?;
    let dest_meta = dest.metadata()?;
    let dest_is_file = dest_meta.is_file();
    let dest_len = if dest_is_file { dest_meta.len() } else { u64::MAX };

    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut written = 0u64;

    for (extent_start, extent_end) in data_extents(&source, range.skip, end) {
        let mut pos = extent_start;
        while pos < extent_end {
            let chunk = ((extent_end - pos) as usize).min(BLOCK_SIZE);
            let buf = &mut buffer[..chunk];
            source.read_exact_at(buf, pos)?;

            let dst_offset = range.seek + (pos - range.skip);
            let fresh = dst_offset >= dest_len;
            if !(fresh && buf.iter().all(|b| *b == 0)) {
                dest.write_all_at(buf, dst_offset)?;
                written += chunk as u64;
            }
            pos += chunk as u64;
        }
    }

    if dest_is_file && dest_len < range.seek + length {
        dest.set_len(range.seek + length)?;
    }
    dest.sync_all()?;

    Ok(written)
}

fn file_size(file: &File) -> Result<u64> {
    let meta = file.metadata()?;
    if meta.is_file() {
        Ok(meta.len())
    } else {
        use std::io::{Seek, SeekFrom};
        let mut f = file.try_clone()?;
        Ok(f.seek(SeekFrom::End(0))?)
    }
}

/// Data extents of `file` within `[start, end)`
fn data_extents(file: &File, start: u64, end: u64) -> Vec<(u64, u64)> {
    let fd = file.as_raw_fd();
    let mut extents = Vec::new();
    let mut pos = start;

    while pos < end {
        let data = unsafe { libc::lseek(fd, pos as libc::off_t, libc::SEEK_DATA) };
        if data < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::ENXIO) {
                // no more data past pos
                break;
            }
            // filesystem or device without hole reporting
            return vec![(start, end)];
        }
        let data = data as u64;
        if data >= end {
            break;
        }

        let hole = unsafe { libc::lseek(fd, data as libc::off_t, libc::SEEK_HOLE) };
        let hole = if hole < 0 { end } else { (hole as u64).min(end) };

        extents.push((data, hole));
        pos = hole;
    }

    extents
}
