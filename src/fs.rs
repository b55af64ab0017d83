use std::fmt;

/// Filesystem family of a partition, derived once from the table reader's type string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsFamily {
    Fat,
    Ext,
    Swap,
    Unsupported,
}

impl FsFamily {
    /// Classify a type string such as `fat16`, `ext4` or `linux-swap(v1)`
    pub fn from_fstype(fstype: &str) -> Self {
        if fstype.starts_with("fat") {
            FsFamily::Fat
        } else if fstype.starts_with("ext") {
            FsFamily::Ext
        } else if fstype.starts_with("linux-swap") {
            FsFamily::Swap
        } else {
            FsFamily::Unsupported
        }
    }

    /// Families whose contents can be browsed and modified file by file
    pub const FILE_ACCESS: &'static [FsFamily] = &[FsFamily::Fat, FsFamily::Ext];

    /// Families the write engine can stage for resizing
    pub const RESIZABLE: &'static [FsFamily] = &[FsFamily::Fat, FsFamily::Ext, FsFamily::Swap];
}

impl fmt::Display for FsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsFamily::Fat => "fat",
            FsFamily::Ext => "ext",
            FsFamily::Swap => "swap",
            FsFamily::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}
