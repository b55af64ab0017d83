use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Fail if the write target is currently mounted
///
/// On Linux, this parses /proc/mounts. Missing /proc/mounts is not an error,
/// since image files in a build sandbox are never mounted.
pub fn check_not_mounted(target: impl AsRef<Path>) -> Result<()> {
    let target = resolve_path(target.as_ref());

    let mounts = match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::Io(std::io::Error::other(format!(
                "Failed to read /proc/mounts: {}",
                e
            ))))
        }
    };

    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };

        if resolve_path(Path::new(source)) == target {
            return Err(Error::TargetMounted(target, mount_point.to_string()));
        }
    }

    Ok(())
}

/// Canonical form of a path, following symlinks such as /dev/disk/by-id/...
fn resolve_path(path: &Path) -> String {
    match path.canonicalize() {
        Ok(canonical) => canonical.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

/// Check if running as root (required for block device access)
pub fn check_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// True if `path` names a block device rather than an image file
pub fn is_block_device(path: impl AsRef<Path>) -> bool {
    use std::os::unix::fs::FileTypeExt;

    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

/// Get the size of a target block device or image file in bytes
#[cfg(target_os = "linux")]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    let path = path.as_ref();
    let file = File::open(path).map_err(|_| Error::TargetNotFound(path.display().to_string()))?;
    if file.metadata()?.is_file() {
        return Ok(file.metadata()?.len());
    }

    let mut size: u64 = 0;

    // BLKGETSIZE64 = 0x80081272
    // Cast to Ioctl type (i32 on musl, u64 on glibc)
    #[allow(overflowing_literals)]
    const BLKGETSIZE64: libc::Ioctl = 0x80081272u32 as libc::Ioctl;

    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };

    if result == -1 {
        use std::io::{Seek, SeekFrom};
        let mut file = file;
        Ok(file.seek(SeekFrom::End(0))?)
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::fs::File;
    use std::io::{Seek, SeekFrom};

    let path = path.as_ref();
    let mut file =
        File::open(path).map_err(|_| Error::TargetNotFound(path.display().to_string()))?;
    Ok(file.seek(SeekFrom::End(0))?)
}
