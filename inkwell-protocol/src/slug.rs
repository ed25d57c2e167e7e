//! Hierarchical document identifiers.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Maximum length of a single `/`-separated path segment, in bytes.
pub const MAX_SEGMENT_LEN: usize = 255;
/// Maximum total length of a slug, in bytes.
pub const MAX_SLUG_LEN: usize = 1024;

/// A validated, `/`-separated document path such as `team/notes/roadmap`.
///
/// Case-sensitive; every segment is non-empty after trimming. Implements
/// [`AsRef<str>`] and [`Display`](fmt::Display) so it can stand in for the
/// original string wherever slugs are logged or used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slug(String);

impl Slug {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The slug's segments, split on `/`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// A filesystem-safe relative path for this slug (segments joined with
    /// the platform separator); callers are expected to join this under a
    /// trusted vault root.
    pub fn as_path_components(&self) -> impl Iterator<Item = &str> {
        self.segments()
    }
}

impl FromStr for Slug {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("slug must not be empty");
        }
        if s.len() > MAX_SLUG_LEN {
            bail!("slug exceeds {MAX_SLUG_LEN} bytes");
        }
        for segment in s.split('/') {
            let trimmed = segment.trim();
            if trimmed.is_empty() {
                bail!("slug contains an empty path segment");
            }
            if trimmed == "." || trimmed == ".." {
                bail!("slug segment '{segment}' is a reserved path component");
            }
            if segment.len() > MAX_SEGMENT_LEN {
                bail!("slug segment '{segment}' exceeds {MAX_SEGMENT_LEN} bytes");
            }
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Slug {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Slug {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
