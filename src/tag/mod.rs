//! Tags: contextual key/value labels attached to recorded measurements.
//!
//! A [`TagSet`] is an ordered-by-key collection with at most one value per
//! key. Views project a tag set onto their grouping keys to decide which row
//! a measurement lands in.

pub mod codec;
pub mod context;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Maximum length of a tag key or value in bytes.
pub const MAX_LEN: usize = 255;

/// Errors produced when building or decoding tags.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("invalid tag key {key:?}: must be 1-{MAX_LEN} printable ASCII bytes")]
    InvalidKey { key: String },

    #[error("invalid value for tag key {key}: must be at most {MAX_LEN} printable ASCII bytes")]
    InvalidValue { key: String },

    #[error("unsupported tag encoding version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("tag encoding truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("encoded tag set is {size} bytes, limit is {limit}")]
    EncodedTooLarge { size: usize, limit: usize },
}

/// Name of a tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagKey(Cow<'static, str>);

impl TagKey {
    /// Creates a validated tag key.
    pub fn new(name: impl Into<String>) -> Result<Self, TagError> {
        let name = name.into();
        if !is_valid_key(&name) {
            return Err(TagError::InvalidKey { key: name });
        }
        Ok(Self(Cow::Owned(name)))
    }

    /// Creates a key from a static name without validation. Intended for
    /// well-known keys declared as constants.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub key: TagKey,
    pub value: String,
}

impl Tag {
    pub fn new(key: TagKey, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Ordered set of tags, unique per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: BTreeMap<TagKey, String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the tag only if `key` is not present. Returns whether it was added.
    pub fn insert(&mut self, key: TagKey, value: impl Into<String>) -> Result<bool, TagError> {
        let value = checked_value(&key, value.into())?;
        if self.tags.contains_key(&key) {
            return Ok(false);
        }
        self.tags.insert(key, value);
        Ok(true)
    }

    /// Replaces the value only if `key` is present. Returns whether it was updated.
    pub fn update(&mut self, key: &TagKey, value: impl Into<String>) -> Result<bool, TagError> {
        let value = checked_value(key, value.into())?;
        match self.tags.get_mut(key) {
            Some(existing) => {
                *existing = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Adds or replaces the tag.
    pub fn upsert(&mut self, key: TagKey, value: impl Into<String>) -> Result<(), TagError> {
        let value = checked_value(&key, value.into())?;
        self.tags.insert(key, value);
        Ok(())
    }

    /// Removes the tag, returning its previous value.
    pub fn delete(&mut self, key: &TagKey) -> Option<String> {
        self.tags.remove(key)
    }

    /// Builder-style [`TagSet::upsert`].
    pub fn with(mut self, key: TagKey, value: impl Into<String>) -> Result<Self, TagError> {
        self.upsert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &TagKey) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterates tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&TagKey, &str)> {
        self.tags.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Returns the tags as a sorted vector.
    pub fn to_tags(&self) -> Vec<Tag> {
        self.tags
            .iter()
            .map(|(k, v)| Tag::new(k.clone(), v.clone()))
            .collect()
    }
}

fn is_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..0x7f).contains(&b))
}

pub(crate) fn is_valid_key(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_LEN && is_printable(name)
}

pub(crate) fn is_valid_value(value: &str) -> bool {
    value.len() <= MAX_LEN && is_printable(value)
}

fn checked_value(key: &TagKey, value: String) -> Result<String, TagError> {
    if !is_valid_value(&value) {
        return Err(TagError::InvalidValue {
            key: key.name().to_string(),
        });
    }
    Ok(value)
}
