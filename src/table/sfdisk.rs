//! Structured-document form of the partition table, read with `sfdisk -J`
//! and written back as an sfdisk script.

use crate::error::{Error, Result};
use crate::tools::{Tool, ToolPaths};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// MBR type codes of extended (container) partitions
const CONTAINER_TYPES: &[&str] = &["5", "f", "85"];

/// Top-level `sfdisk -J` document
#[derive(Debug, Clone, Deserialize)]
pub struct TableDocument {
    pub partitiontable: PartitionTable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionTable {
    pub label: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub firstlba: Option<u64>,
    #[serde(default)]
    pub lastlba: Option<u64>,
    #[serde(default)]
    pub sectorsize: Option<u64>,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
    /// Header fields this crate does not interpret, replayed verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One partition entry; `start` and `size` are in sectors
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionEntry {
    pub node: String,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attrs: Option<String>,
    #[serde(default)]
    pub bootable: bool,
}

impl PartitionEntry {
    /// True for entries that hold nested partitions rather than data
    pub fn is_container(&self) -> bool {
        CONTAINER_TYPES.contains(&self.kind.to_ascii_lowercase().as_str())
    }
}

impl TableDocument {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Partition entries paired with their partition numbers
    pub fn numbered(&self) -> impl Iterator<Item = (u32, &PartitionEntry)> {
        let device = self.partitiontable.device.as_deref();
        self.partitiontable
            .partitions
            .iter()
            .enumerate()
            .map(move |(idx, entry)| (partition_number(device, &entry.node, idx), entry))
    }

    pub fn numbered_mut(&mut self) -> impl Iterator<Item = (u32, &mut PartitionEntry)> {
        let device = self.partitiontable.device.clone();
        self.partitiontable
            .partitions
            .iter_mut()
            .enumerate()
            .map(move |(idx, entry)| {
                let num = partition_number(device.as_deref(), &entry.node, idx);
                (num, entry)
            })
    }

    /// Fail if the document's sector size disagrees with the image's
    pub fn check_sector_size(&self, expected: u64) -> Result<()> {
        match self.partitiontable.sectorsize {
            Some(found) if found != expected => Err(Error::SectorSizeMismatch { expected, found }),
            _ => Ok(()),
        }
    }

    /// Render as an sfdisk input script
    pub fn to_script(&self) -> String {
        let table = &self.partitiontable;
        let mut script = String::new();

        let mut header = |key: &str, value: &str| {
            script.push_str(&format!("{}: {}\n", key, script_value(value)));
        };
        header("label", &table.label);
        if let Some(id) = &table.id {
            header("label-id", id);
        }
        if let Some(unit) = &table.unit {
            header("unit", unit);
        }
        for (key, value) in &table.extra {
            match value {
                Value::String(s) => header(key, s),
                Value::Number(n) => header(key, &n.to_string()),
                _ => {}
            }
        }
        script.push('\n');

        for part in &table.partitions {
            let mut fields: Vec<String> = Vec::new();
            if let Some(attrs) = part.attrs.as_deref().filter(|s| !s.is_empty()) {
                fields.push(format!("attrs={}", script_value(attrs)));
            }
            if let Some(name) = part.name.as_deref().filter(|s| !s.is_empty()) {
                fields.push(format!("name={}", script_value(name)));
            }
            if !part.is_container() && part.size != 0 {
                fields.push(format!("size={}", part.size));
            }
            if !part.kind.is_empty() {
                fields.push(format!("type={}", script_value(&part.kind)));
            }
            if let Some(uuid) = part.uuid.as_deref().filter(|s| !s.is_empty()) {
                fields.push(format!("uuid={}", script_value(uuid)));
            }
            if part.bootable {
                fields.push("bootable".to_string());
            }
            script.push_str(&fields.join(", "));
            script.push('\n');
        }

        script
    }
}

/// Quote a script value when it contains separators. sfdisk has no escape
/// for `"` inside a quoted value, so embedded quotes are dropped.
fn script_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ',' | '=' | '"' | ';'));
    if needs_quotes {
        format!("\"{}\"", value.replace('"', ""))
    } else {
        value.to_string()
    }
}

/// Partition number from a device node such as `disk.img2` or `/dev/mmcblk0p2`.
/// Falls back to the 1-based table position.
pub fn partition_number(device: Option<&str>, node: &str, index: usize) -> u32 {
    let fallback = index as u32 + 1;
    let Some(suffix) = device.and_then(|dev| node.strip_prefix(dev)) else {
        return fallback;
    };
    let digits = suffix.strip_prefix('p').unwrap_or(suffix);
    digits.parse().unwrap_or(fallback)
}

/// Read the table of `path` as a structured document
pub fn read_document(tools: &ToolPaths, path: &Path) -> Result<TableDocument> {
    let out = tools.command(Tool::Sfdisk)?.arg("-J").arg_path(path).run()?;
    // stderr warnings are appended after the JSON body
    let body = match (out.find('{'), out.rfind('}')) {
        (Some(start), Some(end)) if start < end => &out[start..=end],
        _ => out.as_str(),
    };
    TableDocument::parse(body)
}

/// Write `doc` to `target` through an sfdisk script on stdin
pub fn write_document(tools: &ToolPaths, doc: &TableDocument, target: &Path) -> Result<()> {
    tools
        .command(Tool::Sfdisk)?
        .arg("--no-reread")
        .arg_path(target)
        .stdin(doc.to_script())
        .run()?;
    Ok(())
}

/// Unpartitioned space on `target` in sectors, as reported by `sfdisk -F`
pub fn query_free_sectors(tools: &ToolPaths, target: &Path) -> Result<u64> {
    let out = tools.command(Tool::Sfdisk)?.arg("-F").arg_path(target).run()?;
    parse_free_sectors(&out).ok_or_else(|| {
        Error::InsufficientFreeSpace(format!("can't get size of unpartitioned space:\n{}", out))
    })
}

pub fn parse_free_sectors(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Unpartitioned space ") && line.ends_with("sectors"))
        .filter_map(|line| line.split_whitespace().rev().nth(1)?.parse().ok())
        .last()
}
