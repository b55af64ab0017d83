use thiserror::Error;

/// All errors that can occur while inspecting or rewriting a disk image
#[derive(Debug, Error)]
pub enum Error {
    #[error("Can't find executable '{tool}'. {hint}")]
    ToolNotFound { tool: String, hint: String },

    #[error("'{command}' returned {status} instead of 0\noutput: {output}")]
    ToolFailed {
        command: String,
        status: i32,
        output: String,
    },

    #[error("Error getting partition information: {0}")]
    TableParse(String),

    #[error("Partition {0} is not in the image")]
    PartitionNotFound(u32),

    #[error("Partition {partition}: not supported fstype '{fstype}'")]
    UnsupportedFilesystem { partition: u32, fstype: String },

    #[error("Not enough free space on target: {0}")]
    InsufficientFreeSpace(String),

    #[error("Could not complete operation:\n{detail}\nuse -r to remove non-empty directory {path}")]
    RecursiveRequired { path: String, detail: String },

    #[error("Could not complete operation:\n{detail}\ndirectory {path} is still not empty")]
    DirectoryNotEmpty { path: String, detail: String },

    #[error("Could not complete operation:\n{detail}\nUnable to remove {path}")]
    RemoveFailed { path: String, detail: String },

    #[error("Could not complete operation:\n{detail}\nUnable to copy {path}")]
    CopyFailed { path: String, detail: String },

    #[error("Sector size mismatch: image uses {expected}-byte sectors, table reports {found}")]
    SectorSizeMismatch { expected: u64, found: u64 },

    #[error("Target '{0}' not found or cannot be opened")]
    TargetNotFound(String),

    #[error("Target '{0}' is currently mounted at '{1}'")]
    TargetMounted(String, String),

    #[error("Invalid image spec: {0}")]
    InvalidImageSpec(String),

    #[error("Invalid expand rule: {0}")]
    InvalidExpandRule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed partition table document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for both flavours of "directory still has entries"
    pub fn is_directory_not_empty(&self) -> bool {
        matches!(
            self,
            Error::RecursiveRequired { .. } | Error::DirectoryNotEmpty { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
