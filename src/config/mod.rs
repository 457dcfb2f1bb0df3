//! # Cache Parameters
//!
//! This module centralizes the page store's configuration surface. The
//! enclosing engine resolves these parameters from its own configuration
//! machinery and hands the result to [`PageStore::open`]; at runtime it
//! funnels `SET`-style mutations through [`Params::set`] under its lock.
//!
//! ## Parameter Table
//!
//! | key                                | default        | runtime |
//! |------------------------------------|----------------|---------|
//! | `wscache.dir`                      | (required)     | read-only |
//! | `wscache.name`                     | wscache.cache  | read-only |
//! | `wscache.page_size`                | 128M           | mutable |
//! | `wscache.keep_pages_size`          | 0              | mutable |
//! | `wscache.keep_pages_count`         | 0              | mutable |
//! | `wscache.encryption`               | no             | read-only |
//! | `wscache.encryption_cache_page_size` | 32K          | read-only |
//! | `wscache.encryption_cache_size`    | 16M            | read-only |
//! | `wscache.debug`                    | 0              | mutable |
//!
//! `wscache.name` is the ring buffer file of the enclosing cache; page files
//! borrow its directory. The encryption keys size the encrypting mapping
//! factory's internal cache and are consumed when the engine installs that
//! factory.
//!
//! ## Mutation Errors
//!
//! Changing a read-only key at runtime is a distinct error from naming a key
//! that does not exist, and both are distinct from an unparsable value. The
//! engine maps these onto different operator-facing failures.
//!
//! [`PageStore::open`]: crate::store::PageStore::open

use std::path::{Path, PathBuf};

pub const PARAM_DIR: &str = "wscache.dir";
pub const PARAM_RB_NAME: &str = "wscache.name";
pub const PARAM_PAGE_SIZE: &str = "wscache.page_size";
pub const PARAM_KEEP_PAGES_SIZE: &str = "wscache.keep_pages_size";
pub const PARAM_KEEP_PAGES_COUNT: &str = "wscache.keep_pages_count";
pub const PARAM_ENCRYPTION: &str = "wscache.encryption";
pub const PARAM_ENCRYPTION_CACHE_PAGE_SIZE: &str = "wscache.encryption_cache_page_size";
pub const PARAM_ENCRYPTION_CACHE_SIZE: &str = "wscache.encryption_cache_size";
pub const PARAM_DEBUG: &str = "wscache.debug";

pub const DEFAULT_RB_NAME: &str = "wscache.cache";
pub const DEFAULT_PAGE_SIZE: usize = 128 << 20;
pub const DEFAULT_ENCRYPTION_CACHE_PAGE_SIZE: usize = 32 << 10;
pub const DEFAULT_ENCRYPTION_CACHE_SIZE: usize = 16 << 20;

/// Runtime parameter mutation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("parameter '{0}' cannot be changed at runtime")]
    ReadOnly(String),

    #[error("unknown parameter '{0}'")]
    Unknown(String),

    #[error("invalid value '{value}' for parameter '{key}'")]
    InvalidValue { key: String, value: String },
}

/// A successfully parsed mutation, to be applied to the store under the
/// coordinator's lock via `PageStore::apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamUpdate {
    PageSize(usize),
    KeepPagesSize(usize),
    KeepPagesCount(usize),
    Debug(u32),
}

/// Parses a byte size with an optional binary `K`/`M`/`G` suffix.
pub fn parse_size(input: &str) -> Option<usize> {
    let input = input.trim();
    let (digits, multiplier) = match input.as_bytes().last()? {
        b'k' | b'K' => (&input[..input.len() - 1], 1usize << 10),
        b'm' | b'M' => (&input[..input.len() - 1], 1usize << 20),
        b'g' | b'G' => (&input[..input.len() - 1], 1usize << 30),
        _ => (input, 1),
    };
    let count: usize = digits.parse().ok()?;
    count.checked_mul(multiplier)
}

/// Resolved page store parameters.
#[derive(Debug, Clone)]
pub struct Params {
    dir: PathBuf,
    name: String,
    page_size: usize,
    keep_pages_size: usize,
    keep_pages_count: usize,
    encryption: bool,
    encryption_cache_page_size: usize,
    encryption_cache_size: usize,
    debug: u32,
}

impl Params {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            name: DEFAULT_RB_NAME.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            keep_pages_size: 0,
            keep_pages_count: 0,
            encryption: false,
            encryption_cache_page_size: DEFAULT_ENCRYPTION_CACHE_PAGE_SIZE,
            encryption_cache_size: DEFAULT_ENCRYPTION_CACHE_SIZE,
            debug: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_keep_pages_size(mut self, size: usize) -> Self {
        self.keep_pages_size = size;
        self
    }

    pub fn with_keep_pages_count(mut self, count: usize) -> Self {
        self.keep_pages_count = count;
        self
    }

    pub fn with_encryption(mut self, cache_page_size: usize, cache_size: usize) -> Self {
        self.encryption = true;
        self.encryption_cache_page_size = cache_page_size;
        self.encryption_cache_size = cache_size;
        self
    }

    pub fn with_debug(mut self, debug: u32) -> Self {
        self.debug = debug;
        self
    }

    /// Applies a runtime `key = value` mutation.
    ///
    /// Read-only keys are rejected with [`ParamError::ReadOnly`]; keys this
    /// store does not own with [`ParamError::Unknown`]. On success the
    /// parsed update is returned for the coordinator to hand to the store.
    pub fn set(&mut self, key: &str, value: &str) -> Result<ParamUpdate, ParamError> {
        match key {
            PARAM_DIR
            | PARAM_RB_NAME
            | PARAM_ENCRYPTION
            | PARAM_ENCRYPTION_CACHE_PAGE_SIZE
            | PARAM_ENCRYPTION_CACHE_SIZE => Err(ParamError::ReadOnly(key.to_string())),

            PARAM_PAGE_SIZE => {
                let size = self.size_value(key, value)?;
                self.page_size = size;
                Ok(ParamUpdate::PageSize(size))
            }

            PARAM_KEEP_PAGES_SIZE => {
                let size = self.size_value(key, value)?;
                self.keep_pages_size = size;
                Ok(ParamUpdate::KeepPagesSize(size))
            }

            PARAM_KEEP_PAGES_COUNT => {
                let count = self.size_value(key, value)?;
                self.keep_pages_count = count;
                Ok(ParamUpdate::KeepPagesCount(count))
            }

            PARAM_DEBUG => {
                let debug = value.trim().parse().map_err(|_| ParamError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                self.debug = debug;
                Ok(ParamUpdate::Debug(debug))
            }

            _ => Err(ParamError::Unknown(key.to_string())),
        }
    }

    fn size_value(&self, key: &str, value: &str) -> Result<usize, ParamError> {
        parse_size(value).ok_or_else(|| ParamError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ring buffer file name; page files live in its directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn keep_pages_size(&self) -> usize {
        self.keep_pages_size
    }

    pub fn keep_pages_count(&self) -> usize {
        self.keep_pages_count
    }

    pub fn encryption(&self) -> bool {
        self.encryption
    }

    pub fn encryption_cache_page_size(&self) -> usize {
        self.encryption_cache_page_size
    }

    pub fn encryption_cache_size(&self) -> usize {
        self.encryption_cache_size
    }

    pub fn debug(&self) -> u32 {
        self.debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let params = Params::new("/var/lib/cache");

        assert_eq!(params.name(), "wscache.cache");
        assert_eq!(params.page_size(), 128 << 20);
        assert_eq!(params.keep_pages_size(), 0);
        assert_eq!(params.keep_pages_count(), 0);
        assert!(!params.encryption());
        assert_eq!(params.encryption_cache_page_size(), 32 << 10);
        assert_eq!(params.encryption_cache_size(), 16 << 20);
    }

    #[test]
    fn parse_size_accepts_binary_suffixes() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("32K"), Some(32 << 10));
        assert_eq!(parse_size("128M"), Some(128 << 20));
        assert_eq!(parse_size("2g"), Some(2 << 30));
        assert_eq!(parse_size(" 16m "), Some(16 << 20));
    }

    #[test]
    fn parse_size_rejects_garbage_and_overflow() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("M"), None);
        assert_eq!(parse_size("12Q"), None);
        assert_eq!(parse_size("-1"), None);
        assert_eq!(parse_size("99999999999999999999G"), None);
    }

    #[test]
    fn mutable_keys_update_and_report() {
        let mut params = Params::new("/tmp");

        assert_eq!(
            params.set(PARAM_PAGE_SIZE, "1M"),
            Ok(ParamUpdate::PageSize(1 << 20))
        );
        assert_eq!(params.page_size(), 1 << 20);

        assert_eq!(
            params.set(PARAM_KEEP_PAGES_COUNT, "2"),
            Ok(ParamUpdate::KeepPagesCount(2))
        );
        assert_eq!(params.keep_pages_count(), 2);

        assert_eq!(params.set(PARAM_DEBUG, "4"), Ok(ParamUpdate::Debug(4)));
    }

    #[test]
    fn read_only_keys_are_rejected_distinctly() {
        let mut params = Params::new("/tmp");

        assert_eq!(
            params.set(PARAM_DIR, "/elsewhere"),
            Err(ParamError::ReadOnly(PARAM_DIR.to_string()))
        );
        assert_eq!(
            params.set(PARAM_ENCRYPTION, "yes"),
            Err(ParamError::ReadOnly(PARAM_ENCRYPTION.to_string()))
        );
        assert_eq!(
            params.set("wscache.no_such_knob", "1"),
            Err(ParamError::Unknown("wscache.no_such_knob".to_string()))
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut params = Params::new("/tmp");
        let before = params.page_size();

        let err = params.set(PARAM_PAGE_SIZE, "lots").unwrap_err();
        assert!(matches!(err, ParamError::InvalidValue { .. }));
        assert_eq!(params.page_size(), before);
    }
}
