use crate::error::{Error, Result};
use crate::fs::FsFamily;
use crate::staging::PartitionImageStore;
use crate::table::{read_table, PartitionRecord, TableLayout};
use crate::tools::{Tool, ToolConfig, ToolPaths};
use std::fmt;
use std::path::{Path, PathBuf};

/// A partitioned disk image opened for inspection or modification.
///
/// Owns the parsed partition table, the resolved tool paths and the staging
/// copies of any partitions touched so far. Staging copies are deleted when
/// the `Disk` is dropped, on success and on error alike.
pub struct Disk {
    pub(crate) image: PathBuf,
    pub(crate) config: ToolConfig,
    pub(crate) tools: ToolPaths,
    pub(crate) layout: TableLayout,
    pub(crate) store: PartitionImageStore,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("image", &self.image)
            .field("logical_sector_size", &self.layout.logical_sector_size)
            .field("physical_sector_size", &self.layout.physical_sector_size)
            .field("table_format", &self.layout.table_format)
            .field("partitions", &self.layout.partitions.len())
            .finish_non_exhaustive()
    }
}

impl Disk {
    /// Open `image`, resolving tools from `config` and reading its partition table.
    ///
    /// `accepted` lists the filesystem families whose partitions may be staged.
    pub fn open(
        image: impl AsRef<Path>,
        config: ToolConfig,
        accepted: &'static [FsFamily],
    ) -> Result<Self> {
        let tools = ToolPaths::resolve(&config);
        Self::open_with_tools(image, config, tools, accepted)
    }

    pub fn open_with_tools(
        image: impl AsRef<Path>,
        config: ToolConfig,
        tools: ToolPaths,
        accepted: &'static [FsFamily],
    ) -> Result<Self> {
        let image = image.as_ref().to_path_buf();
        tools.require(&[Tool::Parted])?;

        let layout = read_table(&tools, &image, config.sector_size)?;
        let store = PartitionImageStore::new(&image, accepted, config.staging_dir.clone());

        Ok(Self {
            image,
            config,
            tools,
            layout,
            store,
        })
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn logical_sector_size(&self) -> u64 {
        self.layout.logical_sector_size
    }

    pub fn partition(&self, pnum: u32) -> Result<&PartitionRecord> {
        self.layout.get(pnum)
    }

    /// Re-read the partition table; sector geometry must not change underneath us
    pub fn reload_table(&mut self) -> Result<()> {
        self.store.flush_dirty(&self.layout)?;
        let layout = read_table(&self.tools, &self.image, self.config.sector_size)?;
        if layout.logical_sector_size != self.layout.logical_sector_size {
            return Err(Error::SectorSizeMismatch {
                expected: self.layout.logical_sector_size,
                found: layout.logical_sector_size,
            });
        }
        self.layout = layout;
        Ok(())
    }

    /// Staging copy of partition `pnum`
    pub(crate) fn stage(&mut self, pnum: u32) -> Result<PathBuf> {
        self.store.stage(&self.layout, pnum)
    }

    /// Write the staging copy of `pnum` back into the image
    pub(crate) fn commit(&mut self, pnum: u32) -> Result<()> {
        self.store.mark_dirty(pnum);
        self.store.flush(&self.layout, pnum)
    }

    /// Number of staging files currently held
    pub fn staged_partitions(&self) -> usize {
        self.store.len()
    }
}
