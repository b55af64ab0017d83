use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Requested size of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    /// `0` in the rule list: keep the source size
    Unchanged,
    /// Explicit size in bytes
    Bytes(u64),
}

/// Which partitions get an explicit size when writing to a larger target.
///
/// Partitions without a rule share the remaining free space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandPlan {
    rules: BTreeMap<u32, SizeRule>,
}

impl ExpandPlan {
    /// Every non-container partition grows automatically
    pub fn auto() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, pnum: u32, rule: SizeRule) -> Self {
        self.rules.insert(pnum, rule);
        self
    }

    /// Rule for `pnum`; `None` means auto-resize
    pub fn rule(&self, pnum: u32) -> Option<SizeRule> {
        self.rules.get(&pnum).copied()
    }

    pub fn is_auto(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromStr for ExpandPlan {
    type Err = Error;

    /// Parse `auto` or `<partition>:<size>[,<partition>:<size>...]`
    fn from_str(rules: &str) -> Result<Self> {
        if rules == "auto" {
            return Ok(Self::auto());
        }

        let mut plan = Self::default();
        for rule in rules.split(',') {
            let (part, size) = rule.split_once(':').ok_or_else(|| {
                Error::InvalidExpandRule(format!("incorrect rule format: {}", rule))
            })?;
            let pnum: u32 = part.trim().parse().map_err(|_| {
                let msg = format!("rule '{}': partition number must be integer", rule);
                Error::InvalidExpandRule(msg)
            })?;
            let bytes = parse_size(size.trim()).ok_or_else(|| {
                Error::InvalidExpandRule(format!("rule '{}': size must be integer", rule))
            })?;

            let rule = if bytes == 0 {
                SizeRule::Unchanged
            } else {
                SizeRule::Bytes(bytes)
            };
            plan.rules.insert(pnum, rule);
        }
        Ok(plan)
    }
}

/// Parse a byte count with an optional `K`, `M` or `G` suffix (also `Ki`, `KiB`, ...)
pub fn parse_size(size: &str) -> Option<u64> {
    let upper = size.to_ascii_uppercase();
    let mut digits = upper.as_str();
    digits = digits.strip_suffix('B').unwrap_or(digits);
    digits = digits.strip_suffix('I').unwrap_or(digits);

    let (digits, multiplier) = match digits.chars().last()? {
        'K' => (&digits[..digits.len() - 1], 1024),
        'M' => (&digits[..digits.len() - 1], 1024 * 1024),
        'G' => (&digits[..digits.len() - 1], 1024 * 1024 * 1024),
        _ if digits.len() == upper.len() => (digits, 1),
        // a bare "B" or "iB" suffix without a unit
        _ => return None,
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}
