//! Shell-script stand-ins for the host tools, so `Disk` flows run without
//! parted, sfdisk, mtools or e2fsprogs installed.

use crate::disk::Disk;
use crate::fs::FsFamily;
use crate::tools::{Tool, ToolConfig, ToolPaths};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

/// A scratch image plus fake tools that append their requests to one call log
pub struct StubHost {
    pub dir: TempDir,
    pub image: PathBuf,
    pub log: PathBuf,
    tools: Vec<(Tool, PathBuf)>,
}

impl StubHost {
    /// Sparse `size`-byte image whose table reads back as `partitions`
    /// (partition lines in `parted -m` form)
    pub fn new(size: u64, sector_size: u64, partitions: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("disk.img");
        File::create(&image).unwrap().set_len(size).unwrap();
        let log = dir.path().join("calls.log");
        fs::write(&log, "").unwrap();

        let mut host = Self {
            dir,
            image,
            log,
            tools: Vec::new(),
        };
        host.set_table(size, sector_size, partitions);
        let table = host.dir.path().join("parted.out");
        host.tool(Tool::Parted, &format!("cat '{}'", table.display()));
        host
    }

    /// Change what the fake parted reports from now on
    pub fn set_table(&self, size: u64, sector_size: u64, partitions: &[&str]) {
        let mut out = format!(
            "BYT;\n{}:{}B:file:{}:{}:msdos::;\n",
            self.image.display(),
            size,
            sector_size,
            sector_size
        );
        for line in partitions {
            out.push_str(line);
            out.push('\n');
        }
        fs::write(self.dir.path().join("parted.out"), out).unwrap();
    }

    /// Install a shell script standing in for `tool`; `$log` names the call log
    pub fn tool(&mut self, tool: Tool, body: &str) {
        let path = self.dir.path().join(tool.name());
        let script = format!("#!/bin/sh\nlog='{}'\n{}\n", self.log.display(), body);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        self.tools.push((tool, path));
    }

    /// A debugfs that answers `-R` requests with `requests` and `-f -` scripts
    /// with `scripts`, both bodies of a shell `case`
    pub fn debugfs(&mut self, requests: &str, scripts: &str) {
        let body = format!(
            r#"req=''
while [ $# -gt 0 ]; do
  case "$1" in -R) req="$2"; shift ;; esac
  shift
done
if [ -n "$req" ]; then
  printf '%s\n' "$req" >> "$log"
  case "$req" in
{requests}
  esac
else
  script=$(cat)
  printf '%s\n' "$script" >> "$log"
  case "$script" in
{scripts}
  esac
fi"#
        );
        self.tool(Tool::Debugfs, &body);
    }

    pub fn open(&self, accepted: &'static [FsFamily]) -> Disk {
        let tools = ToolPaths::from_paths(self.tools.clone());
        Disk::open_with_tools(&self.image, ToolConfig::default(), tools, accepted).unwrap()
    }

    /// Everything the fake tools appended to the call log
    pub fn calls(&self) -> String {
        fs::read_to_string(&self.log).unwrap()
    }
}
