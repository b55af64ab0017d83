pub mod address;
pub mod disk;
pub mod error;
pub mod expand;
pub mod files;
pub mod fs;
pub mod sparse;
pub mod staging;
pub mod system;
pub mod table;
#[cfg(test)]
mod testing;
pub mod tools;

pub use address::ImageSpec;
pub use disk::Disk;
pub use error::{Error, Result};
pub use expand::{ExpandPlan, PartitionAction, PartitionOutcome, SizeRule, WriteReport};
pub use files::{CopyEndpoint, Transfer};
pub use fs::FsFamily;
pub use sparse::{sparse_copy, CopyRange};
pub use system::{check_not_mounted, check_root, get_block_device_size, is_block_device};
pub use table::{PartitionListing, PartitionRecord, TableLayout};
pub use tools::{Tool, ToolConfig, ToolPaths};
