//! File-level operations inside a partition: list, copy in/out, remove.
//!
//! Each operation picks its tool by filesystem family: `debugfs` for ext,
//! mtools for FAT. Mutations run against the partition's staging copy and
//! are flushed back into the image before the operation returns.

pub mod debugfs;

use crate::address::{base_name, normalize_path, parent_dir, ImageSpec};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::fs::FsFamily;
use crate::tools::Tool;
use debugfs::Script;
use std::path::PathBuf;
use tracing::{debug, info};

/// mtools diagnostics that make `mdel` fall back to `mdeltree`
const MDEL_FALLBACK_MARKERS: &[&str] = &["not found", "non empty"];

/// One side of a copy: a local path or a path inside an image partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEndpoint {
    Local(PathBuf),
    Image(ImageSpec),
}

impl CopyEndpoint {
    /// Anything containing `:` is an image spec, everything else a local path
    pub fn parse(arg: &str) -> Result<Self> {
        if arg.contains(':') {
            Ok(CopyEndpoint::Image(ImageSpec::parse_partition(arg)?))
        } else {
            Ok(CopyEndpoint::Local(PathBuf::from(arg)))
        }
    }
}

/// Direction of a copy, with exactly one side inside the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    In { local: PathBuf, dest: ImageSpec },
    Out { src: ImageSpec, local: PathBuf },
}

impl Transfer {
    pub fn new(src: CopyEndpoint, dest: CopyEndpoint) -> Result<Self> {
        match (src, dest) {
            (CopyEndpoint::Local(local), CopyEndpoint::Image(dest)) => {
                Ok(Transfer::In { local, dest })
            }
            (CopyEndpoint::Image(src), CopyEndpoint::Local(local)) => {
                Ok(Transfer::Out { src, local })
            }
            (CopyEndpoint::Local(_), CopyEndpoint::Local(_)) => Err(Error::InvalidImageSpec(
                "no image or partition number specified".to_string(),
            )),
            (CopyEndpoint::Image(_), CopyEndpoint::Image(_)) => Err(Error::InvalidImageSpec(
                "copying between two images is not supported".to_string(),
            )),
        }
    }

    /// The image side of the transfer
    pub fn spec(&self) -> &ImageSpec {
        match self {
            Transfer::In { dest, .. } => dest,
            Transfer::Out { src, .. } => src,
        }
    }
}

fn local_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Families with file-level access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileSystem {
    Fat,
    Ext,
}

impl Disk {
    fn file_family(&self, pnum: u32) -> Result<FileSystem> {
        let part = self.partition(pnum)?;
        match part.family() {
            FsFamily::Fat => Ok(FileSystem::Fat),
            FsFamily::Ext => Ok(FileSystem::Ext),
            FsFamily::Swap | FsFamily::Unsupported => Err(Error::UnsupportedFilesystem {
                partition: pnum,
                fstype: part.fstype.clone(),
            }),
        }
    }

    /// Raw directory listing of `path` inside partition `pnum`
    pub fn list(&mut self, pnum: u32, path: &str) -> Result<String> {
        let family = self.file_family(pnum)?;
        let image = self.stage(pnum)?;

        match family {
            FileSystem::Ext => debugfs::request(&self.tools, &image, false, "ls -l", path),
            FileSystem::Fat => self
                .tools
                .command(Tool::Mdir)?
                .arg("-i")
                .arg_path(&image)
                .arg(format!("::{}", path))
                .run(),
        }
    }

    /// Copy a file or directory into or out of a partition
    pub fn copy(&mut self, transfer: &Transfer) -> Result<()> {
        let pnum = transfer.spec().require_partition()?;
        let family = self.file_family(pnum)?;
        let image = self.stage(pnum)?;

        match (family, transfer) {
            (FileSystem::Ext, Transfer::In { local, dest }) => {
                // an existing directory receives the file under its local name,
                // anything else names the new file
                let local = local_arg(local);
                let into_dir = dest.path.ends_with('/')
                    || debugfs::is_directory(&self.tools, &image, &dest.path)?;
                let (dir, name) = if into_dir {
                    (dest.path.as_str(), base_name(&local))
                } else {
                    (parent_dir(&dest.path), base_name(&dest.path))
                };
                let script = Script::new().cd(dir).write(&local, name);
                let out = debugfs::run_script(&self.tools, &image, true, &script)?;
                debug!("debugfs write: {}", out);

                let errors = debugfs::command_errors(&out, &["cd", "write"]);
                if !errors.is_empty() {
                    return Err(Error::CopyFailed {
                        path: dest.path.clone(),
                        detail: errors.join("\n"),
                    });
                }
            }
            (FileSystem::Ext, Transfer::Out { src, local }) => {
                // dump handles files, rdump handles directories; one of them fails quietly
                let local = local_arg(local);
                let script = Script::new()
                    .cd(parent_dir(&src.path))
                    .dump(&src.path, &local)
                    .rdump(&src.path, &local);
                let out = debugfs::run_script(&self.tools, &image, false, &script)?;
                debug!("debugfs dump: {}", out);

                let cd_errors = debugfs::command_errors(&out, &["cd"]);
                let dump_errors = debugfs::command_errors(&out, &["dump"]);
                let rdump_errors = debugfs::command_errors(&out, &["rdump"]);
                if !cd_errors.is_empty() || (!dump_errors.is_empty() && !rdump_errors.is_empty()) {
                    let mut errors = cd_errors;
                    errors.extend(dump_errors);
                    errors.extend(rdump_errors);
                    return Err(Error::CopyFailed {
                        path: src.path.clone(),
                        detail: errors.join("\n"),
                    });
                }
            }
            (FileSystem::Fat, Transfer::In { local, dest }) => {
                self.tools
                    .command(Tool::Mcopy)?
                    .arg("-i")
                    .arg_path(&image)
                    .arg("-snop")
                    .arg_path(local)
                    .arg(format!("::{}", dest.path))
                    .run()?;
            }
            (FileSystem::Fat, Transfer::Out { src, local }) => {
                self.tools
                    .command(Tool::Mcopy)?
                    .arg("-i")
                    .arg_path(&image)
                    .arg("-snop")
                    .arg(format!("::{}", src.path))
                    .arg_path(local)
                    .run()?;
            }
        }

        self.commit(pnum)?;
        info!("Copied {:?} on partition {}", transfer, pnum);
        Ok(())
    }

    /// Remove `path` from partition `pnum`; directories need `recursive` on ext
    pub fn remove(&mut self, pnum: u32, path: &str, recursive: bool) -> Result<()> {
        let family = self.file_family(pnum)?;
        let image = self.stage(pnum)?;

        match family {
            FileSystem::Ext => self.remove_ext(pnum, &normalize_path(path), recursive)?,
            FileSystem::Fat => {
                let target = format!("::{}", path);
                let deleted = self
                    .tools
                    .command(Tool::Mdel)?
                    .arg("-i")
                    .arg_path(&image)
                    .arg(&target)
                    .run();
                match deleted {
                    Ok(_) => {}
                    Err(Error::ToolFailed { output, .. })
                        if MDEL_FALLBACK_MARKERS.iter().any(|m| output.contains(m)) =>
                    {
                        debug!("mdel refused {}: {}; retrying with mdeltree", path, output);
                        self.tools
                            .command(Tool::Mdeltree)?
                            .arg("-i")
                            .arg_path(&image)
                            .arg(&target)
                            .run()?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.commit(pnum)?;
        info!("Removed {} from partition {}", path, pnum);
        Ok(())
    }

    /// debugfs has no recursive delete: walk the tree and remove entries bottom-up
    fn remove_ext(&mut self, pnum: u32, path: &str, recursive: bool) -> Result<()> {
        let image = self.stage(pnum)?;
        let out = debugfs::request(&self.tools, &image, true, "rm", path)?;

        let Some(failure) = debugfs::command_errors(&out, &["rm"]).first().copied() else {
            return Ok(());
        };
        if !failure.contains("file is a directory") {
            return Err(Error::RemoveFailed {
                path: path.to_string(),
                detail: failure.to_string(),
            });
        }

        if recursive {
            let listing = self.list(pnum, path)?;
            for entry in debugfs::parse_listing(&listing) {
                if entry == "." || entry == ".." {
                    continue;
                }
                let child = format!("{}/{}", path.trim_end_matches('/'), entry);
                self.remove_ext(pnum, &child, recursive)?;
            }
        }

        let dir = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        let out = debugfs::request(&self.tools, &image, true, "rmdir", dir)?;
        for line in out.lines() {
            if line.contains("directory not empty") {
                let detail = line.to_string();
                let path = path.to_string();
                return Err(if recursive {
                    Error::DirectoryNotEmpty { path, detail }
                } else {
                    Error::RecursiveRequired { path, detail }
                });
            }
            if line.starts_with("rmdir:") {
                return Err(Error::RemoveFailed {
                    path: path.to_string(),
                    detail: format!("{}\n{}", failure, line),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubHost;

    const IMAGE_SIZE: u64 = 4 * 1024 * 1024;
    const PARTITIONS: &[&str] = &[
        "1:1048576B:2097151B:1048576B:fat16::;",
        "2:2097152B:3145727B:1048576B:ext4::;",
        "3:3145728B:4194303B:1048576B:btrfs::;",
    ];

    /// Shell command printing an `ls -l` reply with the given entry names
    fn ls_reply(names: &[&str]) -> String {
        let lines: Vec<String> = names
            .iter()
            .map(|name| format!("'  12   40755 (2)   0   0   1024 17-Oct-2026 10:21 {}'", name))
            .collect();
        format!("printf '%s\\n' {}", lines.join(" "))
    }

    fn ext_host() -> StubHost {
        let mut host = StubHost::new(IMAGE_SIZE, 512, PARTITIONS);
        let requests = format!(
            r#"    'rm "/data"'|'rm "/data/sub"'|'rm "/full"') echo 'rm: file is a directory' ;;
    'ls -l "/data"') {} ;;
    'ls -l "/data/sub"') {} ;;
    'ls -l "/full"') {} ;;
    'rmdir "/full"') echo 'rmdir: directory not empty' ;;
    'rm "/missing"') echo 'rm: File not found by ext2_lookup while trying to resolve filename' ;;
    'cd "/"'|'cd "/data"') ;;
    'cd '*) echo 'cd: File not found by ext2_lookup' ;;"#,
            ls_reply(&[".", "..", "notes.txt", "sub"]),
            ls_reply(&[".", "..", "deep.txt"]),
            ls_reply(&[".", ".."]),
        );
        let scripts = r#"    *'cd "/nodir/"'*) echo 'cd: File not found by ext2_lookup' ;;
    *'"exists.txt"'*) echo 'write: Ext2 file already exists' ;;
    *'dump "/missing"'*)
      echo 'dump: File not found by ext2_lookup'
      echo 'rdump: File not found by ext2_lookup' ;;"#;
        host.debugfs(&requests, scripts);
        host
    }

    fn fat_host() -> StubHost {
        let mut host = StubHost::new(IMAGE_SIZE, 512, PARTITIONS);
        host.tool(
            Tool::Mdel,
            r#"echo "mdel $*" >> "$log"
case "$*" in
  *::/dir) echo 'mdel: Cannot remove /dir: non empty directory' >&2; exit 1 ;;
  *::/gone) echo 'File "/gone" not found' >&2; exit 1 ;;
  *::/locked) echo 'mdel: Permission denied' >&2; exit 1 ;;
esac"#,
        );
        host.tool(Tool::Mdeltree, r#"echo "mdeltree $*" >> "$log""#);
        host
    }

    fn image_arg(host: &StubHost, partition_path: &str) -> CopyEndpoint {
        CopyEndpoint::parse(&format!("{}:{}", host.image.display(), partition_path)).unwrap()
    }

    #[test]
    fn test_copy_endpoint_parse() {
        assert_eq!(
            CopyEndpoint::parse("notes.txt").unwrap(),
            CopyEndpoint::Local(PathBuf::from("notes.txt"))
        );
        match CopyEndpoint::parse("disk.wic:2/etc/").unwrap() {
            CopyEndpoint::Image(spec) => {
                assert_eq!(spec.partition, Some(2));
                assert_eq!(spec.path, "/etc/");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(CopyEndpoint::parse("disk.wic:/etc").is_err());
    }

    #[test]
    fn test_transfer_direction() {
        let local = CopyEndpoint::parse("notes.txt").unwrap();
        let image = CopyEndpoint::parse("disk.wic:1/").unwrap();

        let t = Transfer::new(local.clone(), image.clone()).unwrap();
        assert!(matches!(t, Transfer::In { .. }));
        assert_eq!(t.spec().partition, Some(1));

        let t = Transfer::new(image.clone(), local.clone()).unwrap();
        assert!(matches!(t, Transfer::Out { .. }));

        assert!(Transfer::new(local.clone(), local).is_err());
        assert!(Transfer::new(image.clone(), image).is_err());
    }

    #[test]
    fn test_unsupported_partition_is_rejected() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        assert!(matches!(
            disk.list(3, "/"),
            Err(Error::UnsupportedFilesystem { partition: 3, .. })
        ));
        assert!(matches!(disk.list(7, "/"), Err(Error::PartitionNotFound(7))));
        assert_eq!(disk.staged_partitions(), 0);
    }

    #[test]
    fn test_ext_list() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        let listing = disk.list(2, "/data").unwrap();
        assert!(listing.contains("notes.txt"));
        assert_eq!(host.calls(), "ls -l \"/data\"\n");
        assert_eq!(disk.staged_partitions(), 1);
    }

    #[test]
    fn test_ext_copy_into_existing_directory() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        let local = host.dir.path().join("notes.txt");

        let transfer =
            Transfer::new(CopyEndpoint::Local(local.clone()), image_arg(&host, "2/data")).unwrap();
        disk.copy(&transfer).unwrap();

        let calls = host.calls();
        assert!(calls.starts_with("cd \"/data\"\n"));
        let expected = format!("cd \"/data\"\nwrite \"{}\" \"notes.txt\"", local.display());
        assert!(calls.contains(&expected));
    }

    #[test]
    fn test_ext_copy_names_new_file() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        let local = host.dir.path().join("notes.txt");

        let transfer =
            Transfer::new(CopyEndpoint::Local(local.clone()), image_arg(&host, "2/renamed.txt"))
                .unwrap();
        disk.copy(&transfer).unwrap();

        let expected = format!("cd \"/\"\nwrite \"{}\" \"renamed.txt\"", local.display());
        assert!(host.calls().contains(&expected));
    }

    #[test]
    fn test_ext_copy_into_missing_directory_fails() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        let local = host.dir.path().join("notes.txt");

        let transfer =
            Transfer::new(CopyEndpoint::Local(local), image_arg(&host, "2/nodir/")).unwrap();
        match disk.copy(&transfer) {
            Err(Error::CopyFailed { path, detail }) => {
                assert_eq!(path, "/nodir/");
                assert!(detail.starts_with("cd:"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ext_copy_onto_existing_file_fails() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        let local = host.dir.path().join("notes.txt");

        let transfer =
            Transfer::new(CopyEndpoint::Local(local), image_arg(&host, "2/data/exists.txt"))
                .unwrap();
        match disk.copy(&transfer) {
            Err(Error::CopyFailed { detail, .. }) => {
                assert_eq!(detail, "write: Ext2 file already exists");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ext_copy_out() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);
        let local = host.dir.path().join("out");

        let found = Transfer::new(
            image_arg(&host, "2/data/notes.txt"),
            CopyEndpoint::Local(local.clone()),
        )
        .unwrap();
        disk.copy(&found).unwrap();

        let missing =
            Transfer::new(image_arg(&host, "2/missing"), CopyEndpoint::Local(local)).unwrap();
        assert!(matches!(disk.copy(&missing), Err(Error::CopyFailed { .. })));
    }

    #[test]
    fn test_ext_recursive_remove_walks_tree() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);

        disk.remove(2, "/data", true).unwrap();

        let calls = host.calls();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                r#"rm "/data""#,
                r#"ls -l "/data""#,
                r#"rm "/data/notes.txt""#,
                r#"rm "/data/sub""#,
                r#"ls -l "/data/sub""#,
                r#"rm "/data/sub/deep.txt""#,
                r#"rmdir "/data/sub""#,
                r#"rmdir "/data""#,
            ]
        );
    }

    #[test]
    fn test_ext_directory_not_empty() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);

        let err = disk.remove(2, "/full", false).unwrap_err();
        assert!(matches!(err, Error::RecursiveRequired { .. }));
        assert!(err.is_directory_not_empty());
        // without -r nothing inside the directory is touched
        assert_eq!(host.calls(), "rm \"/full\"\nrmdir \"/full\"\n");

        let err = disk.remove(2, "/full", true).unwrap_err();
        assert!(matches!(err, Error::DirectoryNotEmpty { .. }));
        assert!(err.is_directory_not_empty());
    }

    #[test]
    fn test_ext_remove_missing_path() {
        let host = ext_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);

        match disk.remove(2, "missing", false) {
            Err(Error::RemoveFailed { path, detail }) => {
                assert_eq!(path, "/missing");
                assert!(detail.contains("File not found"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_fat_remove_falls_back_to_mdeltree() {
        let host = fat_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);

        disk.remove(1, "/dir", false).unwrap();
        disk.remove(1, "/gone", false).unwrap();

        let calls = host.calls();
        let trees: Vec<&str> = calls.lines().filter(|l| l.starts_with("mdeltree")).collect();
        assert_eq!(trees.len(), 2);
        assert!(trees[0].ends_with("::/dir"));
        assert!(trees[1].ends_with("::/gone"));
    }

    #[test]
    fn test_fat_remove_file_and_other_failures() {
        let host = fat_host();
        let mut disk = host.open(FsFamily::FILE_ACCESS);

        disk.remove(1, "/file.txt", false).unwrap();
        match disk.remove(1, "/locked", false) {
            Err(Error::ToolFailed { status, output, .. }) => {
                assert_eq!(status, 1);
                assert_eq!(output, "mdel: Permission denied");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!host.calls().contains("mdeltree"));
    }
}
