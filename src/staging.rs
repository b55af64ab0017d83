//! Staging copies of individual partitions.
//!
//! A partition's byte range is extracted into a private temporary file the
//! first time it is needed and reused afterwards. Mutations happen on the
//! staging copy, which is then flushed back into the full image. Every
//! staging file is removed when the store is dropped.

use crate::error::{Error, Result};
use crate::fs::FsFamily;
use crate::sparse::{sparse_copy, CopyRange};
use crate::table::TableLayout;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::debug;

pub struct PartitionImageStore {
    image: PathBuf,
    accepted: &'static [FsFamily],
    staging_dir: Option<PathBuf>,
    staged: HashMap<u32, NamedTempFile>,
    dirty: BTreeSet<u32>,
}

impl PartitionImageStore {
    pub fn new(
        image: impl Into<PathBuf>,
        accepted: &'static [FsFamily],
        staging_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            image: image.into(),
            accepted,
            staging_dir,
            staged: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Path of the staging copy of partition `pnum`, extracting it on first use
    pub fn stage(&mut self, layout: &TableLayout, pnum: u32) -> Result<PathBuf> {
        let part = layout.get(pnum)?;
        if !self.accepted.contains(&part.family()) {
            return Err(Error::UnsupportedFilesystem {
                partition: pnum,
                fstype: part.fstype.clone(),
            });
        }

        if let Some(file) = self.staged.get(&pnum) {
            return Ok(file.path().to_path_buf());
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("wim-part");
        let file = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        sparse_copy(&self.image, file.path(), CopyRange::extract(part.start, part.size))?;
        debug!(
            "Staged partition {} ({} bytes at {}) in {:?}",
            pnum,
            part.size,
            part.start,
            file.path()
        );

        let path = file.path().to_path_buf();
        self.staged.insert(pnum, file);
        Ok(path)
    }

    /// Record that the staging copy of `pnum` no longer matches the image
    pub fn mark_dirty(&mut self, pnum: u32) {
        if self.staged.contains_key(&pnum) {
            self.dirty.insert(pnum);
        }
    }

    pub fn is_dirty(&self, pnum: u32) -> bool {
        self.dirty.contains(&pnum)
    }

    /// Write the staging copy of `pnum` back into the image at the partition start
    pub fn flush(&mut self, layout: &TableLayout, pnum: u32) -> Result<()> {
        let part = layout.get(pnum)?;
        let file = self.staged.get(&pnum).ok_or(Error::PartitionNotFound(pnum))?;
        sparse_copy(file.path(), &self.image, CopyRange::place(part.start))?;
        self.dirty.remove(&pnum);
        debug!("Flushed partition {} back into {:?}", pnum, self.image);
        Ok(())
    }

    /// Flush every staging copy that has pending changes
    pub fn flush_dirty(&mut self, layout: &TableLayout) -> Result<()> {
        let pending: Vec<u32> = self.dirty.iter().copied().collect();
        for pnum in pending {
            self.flush(layout, pnum)?;
        }
        Ok(())
    }

    /// Number of staging files currently held
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}
