//! Core identifier types for devbox.
//!
//! Deployment IDs are derived from the owner, the user-supplied name, and the
//! creation date, so they stay readable in `kind` cluster names and kubeconfig
//! contexts. Source IDs name entries in the shared data-source catalog.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Maximum length of a derived deployment ID before collision suffixes.
pub const DERIVED_ID_MAX_LEN: usize = 40;

/// Maximum length accepted when parsing a deployment ID (leaves room for suffixes).
const DEPLOYMENT_ID_MAX_LEN: usize = 48;

/// Maximum length of a source ID or a user-supplied name.
const NAME_MAX_LEN: usize = 63;

const OWNER_PART_MAX_LEN: usize = 15;
const NAME_PART_MAX_LEN: usize = 20;

/// Errors produced while parsing or deriving identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier must not be empty")]
    Empty,

    /// The identifier contained a character outside the allowed set.
    #[error("invalid character {ch:?} in {value:?}")]
    InvalidCharacter {
        /// The rejected input.
        value: String,
        /// The first offending character.
        ch: char,
    },

    /// The identifier was too long.
    #[error("identifier too long: {got} characters (max {max})")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        got: usize,
    },

    /// The identifier started or ended with a hyphen.
    #[error("{0:?} must not start or end with a hyphen")]
    EdgeHyphen(String),
}

/// Identifier of a deployment record.
///
/// Unique across every record ever created, including destroyed ones.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Derive a deployment ID as `<owner>-<name>-<MMDD>`.
    ///
    /// The owner part is the local part of the email with dots replaced by
    /// hyphens, capped at 15 characters; the name is sanitized and capped at
    /// 20 characters. The whole ID never exceeds 40 characters.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid deployment name.
    pub fn derive(name: &str, owner: &str, date: NaiveDate) -> Result<Self, IdError> {
        validate_name(name)?;

        let local = owner.split('@').next().unwrap_or_default().replace('.', "-");
        let mut owner_part = sanitize(&local, OWNER_PART_MAX_LEN);
        if owner_part.is_empty() {
            owner_part = "user".to_string();
        }
        let mut name_part = sanitize_name(name, NAME_PART_MAX_LEN);
        let stamp = date.format("%m%d").to_string();

        if owner_part.len() + name_part.len() + stamp.len() + 2 > DERIVED_ID_MAX_LEN {
            let available = DERIVED_ID_MAX_LEN - stamp.len() - 2;
            let owner_len = owner_part.len().min(available / 2);
            let name_len = available - owner_len;
            owner_part = truncate(&owner_part, owner_len);
            name_part = truncate(&name_part, name_len);
        }

        Ok(Self(format!("{owner_part}-{name_part}-{stamp}")))
    }

    /// Parse a deployment ID from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, too long, or contains
    /// characters other than lowercase letters, digits, and hyphens.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        check_slug(s, DEPLOYMENT_ID_MAX_LEN)?;
        Ok(Self(s.to_string()))
    }

    /// Return this ID with a numeric collision suffix appended.
    #[must_use]
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}-{n}", self.0))
    }

    /// Return the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeploymentId({})", self.0)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeploymentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        check_slug(&value, DEPLOYMENT_ID_MAX_LEN)?;
        Ok(Self(value))
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.0
    }
}

/// Identifier of a shared data source (e.g. `aws-postgres`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Parse a source ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a lowercase slug.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        check_slug(s, NAME_MAX_LEN)?;
        Ok(Self(s.to_string()))
    }

    /// Return the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SourceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        check_slug(&value, NAME_MAX_LEN)?;
        Ok(Self(value))
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

/// Validate a user-supplied deployment name.
///
/// Names may contain ASCII letters, digits, and hyphens, and may not start
/// or end with a hyphen.
///
/// # Errors
///
/// Returns the first rule the name violates.
pub fn validate_name(name: &str) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::Empty);
    }
    if name.len() > NAME_MAX_LEN {
        return Err(IdError::TooLong {
            max: NAME_MAX_LEN,
            got: name.len(),
        });
    }
    if let Some(ch) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
        return Err(IdError::InvalidCharacter {
            value: name.to_string(),
            ch,
        });
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(IdError::EdgeHyphen(name.to_string()));
    }
    Ok(())
}

/// Sanitize a name for use in resource names.
///
/// Lowercases, replaces anything outside `[a-z0-9-]` with a hyphen, collapses
/// runs of hyphens, trims edge hyphens, and truncates to `max_len`. Falls back
/// to `"cluster"` when nothing usable remains.
#[must_use]
pub fn sanitize_name(name: &str, max_len: usize) -> String {
    let sanitized = sanitize(name, max_len);
    if sanitized.is_empty() {
        "cluster".to_string()
    } else {
        sanitized
    }
}

fn sanitize(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars().map(|c| c.to_ascii_lowercase()) {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            '-'
        };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }
    truncate(out.trim_matches('-'), max_len)
}

fn truncate(value: &str, max_len: usize) -> String {
    let cut: String = value.chars().take(max_len).collect();
    cut.trim_end_matches('-').to_string()
}

fn check_slug(s: &str, max: usize) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > max {
        return Err(IdError::TooLong { max, got: s.len() });
    }
    if let Some(ch) = s
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(IdError::InvalidCharacter {
            value: s.to_string(),
            ch,
        });
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(IdError::EdgeHyphen(s.to_string()));
    }
    Ok(())
}
