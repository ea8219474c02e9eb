//! Container id validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{StowageError, StowageResult};

/// File extension carried by secure-container images on disk.
pub const ASEC_SUFFIX: &str = ".asec";

/// A validated secure-container id.
///
/// Container ids name ASEC images (`<id>.asec`) and their mountpoints
/// (`/mnt/asec/<id>`), so they must be safe as a single path component:
/// - 1-64 characters long
/// - alphanumeric characters, hyphens, underscores, and dots only
///   (package-style ids such as `com.example.app-1`)
/// - starting with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container id.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new container id, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the id format is invalid.
    pub fn new(id: impl Into<String>) -> StowageResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the container id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The image file name for this container (`<id>.asec`).
    #[must_use]
    pub fn image_name(&self) -> String {
        format!("{}{}", self.0, ASEC_SUFFIX)
    }

    /// Recover a container id from an image file name, stripping the
    /// `.asec` suffix. Returns `None` for non-image names.
    pub fn from_image_name(name: &str) -> Option<Self> {
        let id = name.strip_suffix(ASEC_SUFFIX)?;
        Self::new(id).ok()
    }

    fn validate(id: &str) -> StowageResult<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(StowageError::InvalidContainerId { id: id.to_string() });
        }

        let first_char = id.chars().next().unwrap();
        if !first_char.is_ascii_alphanumeric() {
            return Err(StowageError::InvalidContainerId { id: id.to_string() });
        }

        for c in id.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
                return Err(StowageError::InvalidContainerId { id: id.to_string() });
            }
        }

        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
