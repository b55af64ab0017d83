use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::expand::calculator::{
    align_free_space, calculate_layout, LayoutCalculation, ALIGNMENT_SECTORS,
};
use crate::expand::rules::ExpandPlan;
use crate::fs::FsFamily;
use crate::sparse::{sparse_copy, CopyRange};
use crate::system::{check_not_mounted, get_block_device_size};
use crate::table::{
    query_free_sectors, read_document, write_document, PartitionEntry, PartitionRecord,
};
use crate::tools::Tool;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// Longest volume label mkdosfs accepts
const FAT_LABEL_MAX: usize = 11;

/// What happened to one partition's data during an expanding write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAction {
    /// Size unchanged, bytes copied verbatim
    Copied,
    /// ext filesystem checked and resized
    ResizedExt,
    /// FAT filesystem rebuilt at the new size and refilled
    RebuiltFat,
    /// Swap area recreated at the new size
    RecreatedSwap,
    /// Container entry, holds no data of its own
    Container,
    /// Size changed but the filesystem cannot be resized; data not written
    Skipped,
}

impl fmt::Display for PartitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PartitionAction::Copied => "copied unchanged",
            PartitionAction::ResizedExt => "resized ext filesystem",
            PartitionAction::RebuiltFat => "rebuilt fat filesystem",
            PartitionAction::RecreatedSwap => "recreated swap",
            PartitionAction::Container => "container, no data",
            PartitionAction::Skipped => "SKIPPED",
        };
        f.write_str(text)
    }
}

/// Per-partition result of an expanding write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub pnum: u32,
    pub old_sectors: u64,
    pub new_sectors: u64,
    pub start_sector: u64,
    pub action: PartitionAction,
}

/// Result of [`Disk::write`]
#[derive(Debug)]
pub struct WriteReport {
    pub target: PathBuf,
    /// Size of the target before writing, if it already existed
    pub target_size_bytes: Option<u64>,
    /// Free-space distribution; `None` for a verbatim copy
    pub calculation: Option<LayoutCalculation>,
    pub partitions: Vec<PartitionOutcome>,
    /// List of operations performed (for logging)
    pub operations: Vec<String>,
    pub warnings: Vec<String>,
}

impl WriteReport {
    fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            target_size_bytes: get_block_device_size(target).ok(),
            calculation: None,
            partitions: Vec::new(),
            operations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn op(&mut self, text: String) {
        info!("{}", text);
        self.operations.push(text);
    }

    fn warn(&mut self, text: String) {
        warn!("{}", text);
        self.warnings.push(text);
    }
}

impl Disk {
    /// Write the image to `target`, a file or block device.
    ///
    /// Without a plan the image is copied byte for byte. With a plan the
    /// partition table is rewritten to spread the target's free space and
    /// each partition is copied, resized or recreated to match. A failure
    /// part way leaves the target partially written.
    pub fn write(&mut self, target: &Path, plan: Option<&ExpandPlan>) -> Result<WriteReport> {
        check_not_mounted(target)?;
        // pending staging changes must reach the image before it is read whole
        self.reload_table()?;

        let mut report = WriteReport::new(target);
        match plan {
            None => {
                let written = sparse_copy(&self.image, target, CopyRange::whole())?;
                report.op(format!(
                    "Copied {} verbatim to {} ({} bytes of data)",
                    self.image.display(),
                    target.display(),
                    written
                ));
            }
            Some(plan) => self.expand_to(target, plan, &mut report)?,
        }
        Ok(report)
    }

    fn expand_to(
        &mut self,
        target: &Path,
        plan: &ExpandPlan,
        report: &mut WriteReport,
    ) -> Result<()> {
        let sector = self.layout.logical_sector_size;
        let header_bytes = ALIGNMENT_SECTORS * sector;

        let target_size = report
            .target_size_bytes
            .ok_or_else(|| Error::TargetNotFound(target.display().to_string()))?;
        if target_size < header_bytes {
            return Err(Error::InsufficientFreeSpace(format!(
                "target is {} bytes, smaller than the {}-byte header area",
                target_size, header_bytes
            )));
        }

        // boot code and table headers live in the first sectors
        sparse_copy(&self.image, target, CopyRange::head(header_bytes))?;
        report.op(format!("Copied first {} sectors", ALIGNMENT_SECTORS));

        let mut doc = read_document(&self.tools, &self.image)?;
        doc.check_sector_size(sector)?;
        write_document(&self.tools, &doc, target)?;
        report.op("Wrote source partition table to target".to_string());

        let free = align_free_space(query_free_sectors(&self.tools, target)?);
        report.op(format!("Target has {} aligned free sectors", free));

        let calculation = calculate_layout(&mut doc, plan, free, sector)?;
        report.op(format!(
            "Distributing {} sectors over {} auto-resized partition(s), {} each",
            calculation.pool_sectors,
            calculation.auto_partitions.len(),
            calculation.share_sectors
        ));
        report.calculation = Some(calculation);

        write_document(&self.tools, &doc, target)?;
        report.op("Wrote resized partition table to target".to_string());

        // the table writer may have moved starts for alignment
        let written = read_document(&self.tools, target)?;
        written.check_sector_size(sector)?;
        if written.partitiontable.partitions.len() != doc.partitiontable.partitions.len() {
            return Err(Error::TableParse(format!(
                "target reports {} partitions, expected {}",
                written.partitiontable.partitions.len(),
                doc.partitiontable.partitions.len()
            )));
        }

        for (pnum, entry) in written.numbered() {
            let source = self.layout.get(pnum)?.clone();
            let action = self.write_partition(target, &source, entry, report)?;
            report.partitions.push(PartitionOutcome {
                pnum,
                old_sectors: source.size / sector,
                new_sectors: entry.size,
                start_sector: entry.start,
                action,
            });
        }

        Ok(())
    }

    fn write_partition(
        &mut self,
        target: &Path,
        source: &PartitionRecord,
        entry: &PartitionEntry,
        report: &mut WriteReport,
    ) -> Result<PartitionAction> {
        let sector = self.layout.logical_sector_size;
        let pnum = source.pnum;
        let dest_offset = entry.start * sector;

        if entry.is_container() {
            return Ok(PartitionAction::Container);
        }

        if entry.size == source.size / sector {
            sparse_copy(
                &self.image,
                target,
                CopyRange {
                    skip: source.start,
                    seek: dest_offset,
                    length: Some(source.size),
                },
            )?;
            report.op(format!("Copying unchanged partition {}", pnum));
            return Ok(PartitionAction::Copied);
        }

        let family = source.family();
        if family == FsFamily::Unsupported {
            report.warn(format!(
                "Skipping partition {}: unsupported fstype '{}'",
                pnum, source.fstype
            ));
            return Ok(PartitionAction::Skipped);
        }

        let scratch = self.scratch_dir()?;
        let part_image = scratch.path().join(format!("part{}.img", pnum));
        let action = match family {
            FsFamily::Ext => {
                report.op(format!(
                    "Resizing ext partition {} to {} sectors",
                    pnum, entry.size
                ));
                self.resize_ext(pnum, &part_image, entry.size)?;
                PartitionAction::ResizedExt
            }
            FsFamily::Fat => {
                report.op(format!(
                    "Rebuilding fat partition {} at {} sectors",
                    pnum, entry.size
                ));
                self.rebuild_fat(pnum, scratch.path(), &part_image, entry)?;
                PartitionAction::RebuiltFat
            }
            FsFamily::Swap => {
                report.op(format!(
                    "Creating swap partition {} of {} sectors",
                    pnum, entry.size
                ));
                self.recreate_swap(pnum, &part_image, entry)?;
                PartitionAction::RecreatedSwap
            }
            FsFamily::Unsupported => return Ok(PartitionAction::Skipped),
        };

        sparse_copy(&part_image, target, CopyRange::place(dest_offset))?;
        Ok(action)
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("wim-scratch");
        Ok(match &self.config.staging_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        })
    }

    fn resize_ext(&mut self, pnum: u32, part_image: &Path, sectors: u64) -> Result<()> {
        let size = resize2fs_size(sectors, self.layout.logical_sector_size);
        let staged = self.stage(pnum)?;
        sparse_copy(&staged, part_image, CopyRange::whole())?;

        // exit code 1 means errors were corrected
        self.tools
            .command(Tool::E2fsck)?
            .arg("-pf")
            .arg_path(part_image)
            .ok_codes(&[0, 1])
            .run()?;
        self.tools
            .command(Tool::Resize2fs)?
            .arg_path(part_image)
            .arg(size)
            .run()?;
        Ok(())
    }

    fn rebuild_fat(
        &mut self,
        pnum: u32,
        scratch: &Path,
        part_image: &Path,
        entry: &PartitionEntry,
    ) -> Result<()> {
        let staged = self.stage(pnum)?;
        let content = scratch.join("content");
        std::fs::create_dir(&content)?;

        self.tools
            .command(Tool::Mcopy)?
            .arg("-snomp")
            .arg("-i")
            .arg_path(&staged)
            .arg("::")
            .arg_path(&content)
            .run()?;

        // mkdosfs -C counts 1 KiB blocks
        let blocks = entry.size * self.layout.logical_sector_size / 1024;
        let mut mkfs = self.tools.command(Tool::Mkdosfs)?;
        if let Some(label) = entry.name.as_deref().filter(|n| !n.is_empty()) {
            mkfs = mkfs.arg("-n").arg(label.chars().take(FAT_LABEL_MAX).collect::<String>());
        }
        mkfs.arg("-C").arg_path(part_image).arg(blocks.to_string()).run()?;

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&content)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();
        if !entries.is_empty() {
            let mut copy = self
                .tools
                .command(Tool::Mcopy)?
                .arg("-snomp")
                .arg("-i")
                .arg_path(part_image);
            for path in &entries {
                copy = copy.arg_path(path);
            }
            copy.arg("::").run()?;
        }
        Ok(())
    }

    fn recreate_swap(
        &mut self,
        pnum: u32,
        part_image: &Path,
        entry: &PartitionEntry,
    ) -> Result<()> {
        let staged = self.stage(pnum)?;
        // blkid exits 2 when it finds nothing; an unlabelled area is fine
        let found = self
            .tools
            .command(Tool::Blkid)?
            .arg("--probe")
            .arg_path(&staged)
            .allow_fail()
            .run()?;

        let size = entry.size * self.layout.logical_sector_size;
        File::create(part_image)?.set_len(size)?;

        let mut mkswap = self.tools.command(Tool::Mkswap)?;
        let label = blkid_value(&found, "LABEL")
            .or_else(|| entry.name.clone().filter(|n| !n.is_empty()));
        if let Some(label) = label {
            mkswap = mkswap.arg("-L").arg(label);
        }
        if let Some(uuid) = blkid_value(&found, "UUID") {
            mkswap = mkswap.arg("-U").arg(uuid);
        }
        mkswap.arg_path(part_image).run()?;
        Ok(())
    }
}

/// resize2fs size argument for `sectors` of `sector_size` bytes.
///
/// resize2fs reads an `s` suffix as 512-byte sectors whatever the device uses.
pub fn resize2fs_size(sectors: u64, sector_size: u64) -> String {
    format!("{}s", sectors * sector_size / 512)
}

/// Value of `KEY="..."` in blkid output, matched as a whole word
pub fn blkid_value(output: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let mut search = output;
    while let Some(idx) = search.find(&needle) {
        let preceded_ok = idx == 0
            || search[..idx]
                .chars()
                .last()
                .is_some_and(|c| c.is_whitespace());
        let rest = &search[idx + needle.len()..];
        if preceded_ok {
            let end = rest.find('"')?;
            let value = &rest[..end];
            return (!value.is_empty()).then(|| value.to_string());
        }
        search = rest;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubHost;

    const MIB: u64 = 1024 * 1024;
    const SWAP_UUID: &str = "0b5e6f1c-7a0d-4c55-9d1e-3f7b2a1c9e42";

    fn document(device: &str, entries: &[(u32, u64, u64, &str)]) -> String {
        let parts: Vec<String> = entries
            .iter()
            .map(|(n, start, size, kind)| {
                format!(
                    r#"{{"node": "{}{}", "start": {}, "size": {}, "type": "{}"}}"#,
                    device, n, start, size, kind
                )
            })
            .collect();
        format!(
            r#"{{"partitiontable": {{"label": "dos", "id": "0x1234abcd", "device": "{}",
"unit": "sectors", "sectorsize": 512, "partitions": [{}]}}}}"#,
            device,
            parts.join(", ")
        )
    }

    /// Swap at 1, an extended container at 2 holding btrfs at 5; 4096 free
    /// sectors on the target are shared by 1 and 5
    fn expand_host() -> (StubHost, PathBuf) {
        let mut host = StubHost::new(
            8 * MIB,
            512,
            &[
                "1:1048576B:2097151B:1048576B:linux-swap(v1)::;",
                "2:2097152B:4194303B:2097152B::::lba;",
                "5:3145728B:4194303B:1048576B:btrfs::;",
            ],
        );
        let target = host.dir.path().join("target.img");
        File::create(&target).unwrap().set_len(16 * MIB).unwrap();

        let image = host.image.display().to_string();
        let source = document(
            &image,
            &[(1, 2048, 2048, "82"), (2, 4096, 4096, "5"), (5, 6144, 2048, "83")],
        );
        let written = document(
            &target.display().to_string(),
            &[(1, 2048, 4096, "82"), (2, 6144, 6144, "5"), (5, 8192, 4096, "83")],
        );
        std::fs::write(host.dir.path().join("source.json"), source).unwrap();
        std::fs::write(host.dir.path().join("written.json"), written).unwrap();

        let dir = host.dir.path().display().to_string();
        host.tool(
            Tool::Sfdisk,
            &format!(
                r#"case "$1" in
  -J) if [ "$2" = '{target}' ]; then cat '{dir}/written.json'; else cat '{dir}/source.json'; fi ;;
  -F) echo "Unpartitioned space $2: 2 MiB, 2097152 bytes, 4096 sectors" ;;
  --no-reread) echo "sfdisk script:" >> "$log"; cat >> "$log" ;;
esac"#,
                target = target.display(),
                dir = dir,
            ),
        );
        host.tool(
            Tool::Blkid,
            &format!(r#"echo "$1: LABEL=\"swap0\" UUID=\"{}\" TYPE=\"swap\"""#, SWAP_UUID),
        );
        host.tool(Tool::Mkswap, r#"echo "mkswap $*" >> "$log""#);
        (host, target)
    }

    #[test]
    fn test_expand_recreates_swap_and_skips_unsupported() {
        let (host, target) = expand_host();
        let mut disk = host.open(FsFamily::RESIZABLE);

        let report = disk.write(&target, Some(&ExpandPlan::auto())).unwrap();

        let calc = report.calculation.as_ref().unwrap();
        assert_eq!(calc.free_sectors, 4096);
        assert_eq!(calc.auto_partitions, vec![1, 5]);
        assert_eq!(calc.share_sectors, 2048);

        let outcomes: Vec<(u32, PartitionAction)> =
            report.partitions.iter().map(|p| (p.pnum, p.action)).collect();
        assert_eq!(
            outcomes,
            vec![
                (1, PartitionAction::RecreatedSwap),
                (2, PartitionAction::Container),
                (5, PartitionAction::Skipped),
            ]
        );
        assert_eq!(report.partitions[0].old_sectors, 2048);
        assert_eq!(report.partitions[0].new_sectors, 4096);

        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("btrfs"));

        let calls = host.calls();
        // first table write replays the source sizes, the second the grown ones
        assert!(calls.contains("size=2048, type=82\ntype=5\nsize=2048, type=83"));
        assert!(calls.contains("size=4096, type=82\ntype=5\nsize=4096, type=83"));
        assert!(calls.contains(&format!("mkswap -L swap0 -U {} ", SWAP_UUID)));

        // the swap area was placed at its new start and the target kept its size
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 16 * MIB);
    }

    #[test]
    fn test_expand_rejects_tiny_target() {
        let (host, target) = expand_host();
        File::create(&target).unwrap().set_len(4096).unwrap();
        let mut disk = host.open(FsFamily::RESIZABLE);

        assert!(matches!(
            disk.write(&target, Some(&ExpandPlan::auto())),
            Err(Error::InsufficientFreeSpace(_))
        ));
    }

    #[test]
    fn test_write_checks_sector_size_is_stable() {
        let (host, target) = expand_host();
        let mut disk = host.open(FsFamily::RESIZABLE);

        host.set_table(8 * MIB, 4096, &[]);
        assert!(matches!(
            disk.write(&target, None),
            Err(Error::SectorSizeMismatch { expected: 512, found: 4096 })
        ));
    }

    #[test]
    fn test_resize2fs_size_uses_512_byte_units() {
        assert_eq!(resize2fs_size(40000, 512), "40000s");
        assert_eq!(resize2fs_size(10000, 4096), "80000s");
    }

    #[test]
    fn test_blkid_value() {
        let out = concat!(
            r#"/tmp/wim-partXYZ: LABEL="swap0" UUID="4d2c1f8e-5a7b-4c3d-9e1f-0a1b2c3d4e5f" "#,
            r#"TYPE="swap" PARTUUID="deadbeef-02""#
        );
        assert_eq!(
            blkid_value(out, "UUID").as_deref(),
            Some("4d2c1f8e-5a7b-4c3d-9e1f-0a1b2c3d4e5f")
        );
        assert_eq!(blkid_value(out, "LABEL").as_deref(), Some("swap0"));
        assert_eq!(blkid_value(out, "TYPE").as_deref(), Some("swap"));
        assert_eq!(blkid_value(out, "SEC_TYPE"), None);
    }

    #[test]
    fn test_blkid_value_ignores_partuuid() {
        let out = r#"/tmp/p: PARTUUID="deadbeef-02" TYPE="swap""#;
        assert_eq!(blkid_value(out, "UUID"), None);
        assert_eq!(blkid_value("", "UUID"), None);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(PartitionAction::Skipped.to_string(), "SKIPPED");
        assert_eq!(PartitionAction::Copied.to_string(), "copied unchanged");
    }
}
