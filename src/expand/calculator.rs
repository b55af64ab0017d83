use crate::error::{Error, Result};
use crate::expand::rules::{ExpandPlan, SizeRule};
use crate::table::TableDocument;

/// Partition boundaries and the header reserve are multiples of this many sectors
pub const ALIGNMENT_SECTORS: u64 = 2048;

/// Result of distributing the target's free space over the partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutCalculation {
    /// Aligned free space reported by the target before resizing
    pub free_sectors: u64,
    /// Pool left after explicit sizes were applied; negative when they outgrow the free space
    pub pool_sectors: i64,
    /// Partitions that share the pool
    pub auto_partitions: Vec<u32>,
    /// Sectors added to each auto-resized partition
    pub share_sectors: i64,
    /// Sectors of the pool nobody received
    pub undistributed_sectors: i64,
}

/// Round a free-space figure down to the alignment boundary
pub fn align_free_space(sectors: u64) -> u64 {
    sectors - sectors % ALIGNMENT_SECTORS
}

/// Apply `plan` to `doc` in place, given `free_sectors` of aligned unpartitioned space.
///
/// Explicit sizes are set first and charged against the pool. The pool is
/// then split evenly over the auto-resized partitions; the remainder of the
/// division is left unallocated.
pub fn calculate_layout(
    doc: &mut TableDocument,
    plan: &ExpandPlan,
    free_sectors: u64,
    sector_size: u64,
) -> Result<LayoutCalculation> {
    let mut pool = free_sectors as i64;
    let mut auto_partitions = Vec::new();

    for (pnum, entry) in doc.numbered_mut() {
        match plan.rule(pnum) {
            Some(SizeRule::Unchanged) => {}
            Some(SizeRule::Bytes(bytes)) => {
                let sectors = bytes / sector_size;
                if sectors == 0 {
                    return Err(Error::InvalidExpandRule(format!(
                        "partition {}: {} bytes is less than one {}-byte sector",
                        pnum, bytes, sector_size
                    )));
                }
                pool -= sectors as i64 - entry.size as i64;
                entry.size = sectors;
            }
            None if !entry.is_container() => auto_partitions.push(pnum),
            None => {}
        }
    }

    let (share, undistributed) = if auto_partitions.is_empty() {
        (0, pool)
    } else {
        let count = auto_partitions.len() as i64;
        let share = pool.div_euclid(count);
        (share, pool - share * count)
    };

    for (pnum, entry) in doc.numbered_mut() {
        if !auto_partitions.contains(&pnum) {
            continue;
        }
        let size = entry.size as i64 + share;
        if size <= 0 {
            return Err(Error::InsufficientFreeSpace(format!(
                "partition {} would shrink to {} sectors",
                pnum, size
            )));
        }
        entry.size = size as u64;
    }

    Ok(LayoutCalculation {
        free_sectors,
        pool_sectors: pool,
        auto_partitions,
        share_sectors: share,
        undistributed_sectors: undistributed,
    })
}
