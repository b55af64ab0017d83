//! Writing an image to a target, optionally growing its partitions to fill it.

pub mod calculator;
pub mod executor;
pub mod rules;

pub use calculator::{align_free_space, calculate_layout, LayoutCalculation, ALIGNMENT_SECTORS};
pub use executor::{blkid_value, PartitionAction, PartitionOutcome, WriteReport};
pub use rules::{parse_size, ExpandPlan, SizeRule};
