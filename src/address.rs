use crate::error::{Error, Result};
use std::path::PathBuf;

/// Address of an image, one of its partitions, or a path inside a partition.
///
/// Syntax: `<image>[:<partition>[<path>]]`, e.g. `disk.wic:1/EFI/BOOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image: PathBuf,
    pub partition: Option<u32>,
    /// Absolute in-partition path; `/` when omitted
    pub path: String,
}

impl ImageSpec {
    pub fn parse(arg: &str) -> Result<Self> {
        let Some((image, rest)) = arg.split_once(':') else {
            return Ok(Self {
                image: PathBuf::from(arg),
                partition: None,
                path: "/".to_string(),
            });
        };
        if image.is_empty() {
            return Err(Error::InvalidImageSpec(format!("missing image in '{}'", arg)));
        }

        let (part, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        let partition = part.parse::<u32>().map_err(|_| {
            Error::InvalidImageSpec(format!("partition number must be integer: '{}'", arg))
        })?;

        Ok(Self {
            image: PathBuf::from(image),
            partition: Some(partition),
            path: normalize_path(path),
        })
    }

    /// Like [`ImageSpec::parse`] but a partition number is mandatory
    pub fn parse_partition(arg: &str) -> Result<Self> {
        let spec = Self::parse(arg)?;
        if spec.partition.is_none() {
            return Err(Error::InvalidImageSpec(format!(
                "partition number is not specified: '{}'",
                arg
            )));
        }
        Ok(spec)
    }

    pub fn require_partition(&self) -> Result<u32> {
        self.partition.ok_or_else(|| {
            Error::InvalidImageSpec(format!(
                "partition number is not specified for {}",
                self.image.display()
            ))
        })
    }
}

/// Make `path` absolute and collapse runs of `/`
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Directory part of an absolute in-partition path
pub fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last component of a path
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
