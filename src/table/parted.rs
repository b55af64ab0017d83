use crate::error::{Error, Result};
use crate::fs::FsFamily;
use crate::tools::{Tool, ToolPaths};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Line that precedes the machine-readable table in `parted -m` output
const HEADER_MARKER: &str = "BYT;";

/// One partition as reported by the table reader. Offsets and sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub pnum: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub fstype: String,
}

impl PartitionRecord {
    pub fn family(&self) -> FsFamily {
        FsFamily::from_fstype(&self.fstype)
    }
}

/// Parsed partition table of an image: sector geometry plus partitions in table order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub logical_sector_size: u64,
    pub physical_sector_size: u64,
    pub table_format: String,
    pub partitions: BTreeMap<u32, PartitionRecord>,
}

impl TableLayout {
    pub fn get(&self, pnum: u32) -> Result<&PartitionRecord> {
        self.partitions
            .get(&pnum)
            .ok_or(Error::PartitionNotFound(pnum))
    }
}

/// Read the partition table of `image` with `parted -sm <image> unit B print`
pub fn read_table(
    tools: &ToolPaths,
    image: &Path,
    sector_size: Option<u32>,
) -> Result<TableLayout> {
    let mut cmd = tools
        .command(Tool::Parted)?
        .arg("-sm")
        .arg_path(image)
        .args(["unit", "B", "print"]);
    if let Some(size) = sector_size {
        cmd = cmd.env("PARTED_SECTOR_SIZE", size.to_string());
    }
    parse_table(&cmd.run()?)
}

/// Parse `parted -m` output. Anything before the header marker is diagnostic noise.
pub fn parse_table(output: &str) -> Result<TableLayout> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let idx = lines
        .iter()
        .position(|line| *line == HEADER_MARKER)
        .ok_or_else(|| {
            let msg = format!("no '{}' marker in parted output:\n{}", HEADER_MARKER, output);
            Error::TableParse(msg)
        })?;

    let meta = lines
        .get(idx + 1)
        .ok_or_else(|| Error::TableParse("missing disk description line".to_string()))?;
    let fields: Vec<&str> = meta.trim_end_matches(';').split(':').collect();
    if fields.len() < 6 {
        return Err(Error::TableParse(format!("short disk description: {}", meta)));
    }
    let logical_sector_size = parse_number(fields[3], meta)?;
    let physical_sector_size = parse_number(fields[4], meta)?;
    let table_format = fields[5].to_string();

    let mut partitions = BTreeMap::new();
    for line in lines.iter().skip(idx + 2).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        if fields.len() < 5 {
            return Err(Error::TableParse(format!("short partition line: {}", line)));
        }
        let record = PartitionRecord {
            pnum: parse_number(fields[0], line)? as u32,
            start: parse_number(fields[1], line)?,
            end: parse_number(fields[2], line)?,
            size: parse_number(fields[3], line)?,
            fstype: fields[4].to_string(),
        };
        partitions.insert(record.pnum, record);
    }

    Ok(TableLayout {
        logical_sector_size,
        physical_sector_size,
        table_format,
        partitions,
    })
}

/// Parse a numeric field, dropping a trailing unit suffix such as `B`
fn parse_number(field: &str, line: &str) -> Result<u64> {
    field
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .map_err(|_| Error::TableParse(format!("bad number '{}' in line: {}", field, line)))
}

/// Human-readable listing of a whole image's partitions
pub struct PartitionListing<'a>(pub &'a TableLayout);

impl fmt::Display for PartitionListing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.partitions.is_empty() {
            return Ok(());
        }
        write!(f, "Num     Start        End          Size      Fstype")?;
        for part in self.0.partitions.values() {
            write!(
                f,
                "\n{:2}  {:12} {:12} {:12}  {}",
                part.pnum, part.start, part.end, part.size, part.fstype
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
BYT;
/tmp/test.wic:104857600B:file:512:512:msdos::;
1:1048576B:22020095B:20971520B:fat16::boot, lba;
2:22020096B:53477375B:31457280B:ext4::;
5:53478400B:60000255B:6521856B:linux-swap(v1)::;
";

    #[test]
    fn test_parse_table() {
        let layout = parse_table(SAMPLE).unwrap();

        assert_eq!(layout.logical_sector_size, 512);
        assert_eq!(layout.physical_sector_size, 512);
        assert_eq!(layout.table_format, "msdos");
        assert_eq!(layout.partitions.len(), 3);

        let p1 = layout.get(1).unwrap();
        assert_eq!(p1.start, 1_048_576);
        assert_eq!(p1.end, 22_020_095);
        assert_eq!(p1.size, 20_971_520);
        assert_eq!(p1.family(), FsFamily::Fat);

        // numbering gaps are legal
        assert_eq!(layout.get(5).unwrap().family(), FsFamily::Swap);
        assert!(matches!(layout.get(3), Err(Error::PartitionNotFound(3))));

        let order: Vec<u32> = layout.partitions.keys().copied().collect();
        assert_eq!(order, vec![1, 2, 5]);
    }

    #[test]
    fn test_parse_skips_leading_diagnostics() {
        let output = format!("Warning: something odd\n{}", SAMPLE);
        let layout = parse_table(&output).unwrap();
        assert_eq!(layout.partitions.len(), 3);
    }

    #[test]
    fn test_parse_missing_marker() {
        let result = parse_table("Error: /tmp/x: unrecognised disk label\n");
        assert!(matches!(result, Err(Error::TableParse(_))));
    }

    #[test]
    fn test_parse_empty_table() {
        let layout = parse_table("BYT;\n/tmp/e.img:1048576B:file:4096:4096:gpt::;\n").unwrap();
        assert_eq!(layout.logical_sector_size, 4096);
        assert_eq!(layout.table_format, "gpt");
        assert!(layout.partitions.is_empty());
        assert_eq!(PartitionListing(&layout).to_string(), "");
    }

    #[test]
    fn test_listing_format() {
        let layout = parse_table(SAMPLE).unwrap();
        let text = PartitionListing(&layout).to_string();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Num     Start        End          Size      Fstype");
        assert_eq!(
            lines[1],
            " 1       1048576     22020095     20971520  fat16"
        );
    }
}
