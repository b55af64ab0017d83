pub mod parted;
pub mod sfdisk;

pub use parted::{parse_table, read_table, PartitionListing, PartitionRecord, TableLayout};
pub use sfdisk::{
    parse_free_sectors, query_free_sectors, read_document, write_document, PartitionEntry,
    PartitionTable, TableDocument,
};
