//! Table options: defaults, JSON file loading and environment overrides.

use crate::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Default number of rows per stored pack.
pub const DEFAULT_PACK_SIZE: usize = 1 << 16;

/// Default journal capacity in rows (and tombstones).
pub const DEFAULT_JOURNAL_SIZE: usize = 1 << 17;

/// Default number of decoded packs kept for reads.
pub const DEFAULT_CACHE_SIZE: usize = 128;

const ENV_PACK_SIZE: &str = "TESSERA_PACK_SIZE";
const ENV_JOURNAL_SIZE: &str = "TESSERA_JOURNAL_SIZE";
const ENV_READ_ONLY: &str = "TESSERA_READ_ONLY";
const ENV_CACHE_SIZE: &str = "TESSERA_CACHE_SIZE";

/// Per-table tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Maximum rows per pack.
    pub pack_size: usize,
    /// Journal capacity; reaching it forces a synchronous merge.
    pub journal_size: usize,
    /// Reject all writes.
    pub read_only: bool,
    /// Decoded packs kept in the read cache; 0 disables it.
    pub cache_size: usize,
}

impl TableOptions {
    pub fn new() -> Self {
        Self {
            pack_size: DEFAULT_PACK_SIZE,
            journal_size: DEFAULT_JOURNAL_SIZE,
            read_only: false,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    pub fn with_pack_size(mut self, n: usize) -> Self {
        self.pack_size = n;
        self
    }

    pub fn with_journal_size(mut self, n: usize) -> Self {
        self.journal_size = n;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_cache_size(mut self, n: usize) -> Self {
        self.cache_size = n;
        self
    }

    /// Load options from a JSON file. Missing fields fall back to defaults.
    pub fn load_from_file(path: &Path) -> TesseraResult<Self> {
        let json = fs::read_to_string(path)?;
        let opts: TableOptions = serde_json::from_str(&json)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Write options to a JSON file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> TesseraResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// Apply `TESSERA_*` environment overrides.
    pub fn apply_env(mut self) -> TesseraResult<Self> {
        if let Ok(v) = env::var(ENV_PACK_SIZE) {
            self.pack_size = parse_usize(ENV_PACK_SIZE, &v)?;
        }
        if let Ok(v) = env::var(ENV_JOURNAL_SIZE) {
            self.journal_size = parse_usize(ENV_JOURNAL_SIZE, &v)?;
        }
        if let Ok(v) = env::var(ENV_READ_ONLY) {
            self.read_only = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = env::var(ENV_CACHE_SIZE) {
            self.cache_size = parse_usize(ENV_CACHE_SIZE, &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.pack_size < 2 {
            return Err(TesseraError::Config(format!(
                "pack_size must be at least 2, got {}",
                self.pack_size
            )));
        }
        if self.journal_size == 0 {
            return Err(TesseraError::Config(
                "journal_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_usize(name: &str, value: &str) -> TesseraResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| TesseraError::Config(format!("{name}: invalid number '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = TableOptions::default();
        assert_eq!(opts.pack_size, 65536);
        assert_eq!(opts.journal_size, 131072);
        assert!(!opts.read_only);
        assert_eq!(opts.cache_size, DEFAULT_CACHE_SIZE);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_packs() {
        let opts = TableOptions::new().with_pack_size(1);
        assert!(matches!(opts.validate(), Err(TesseraError::Config(_))));
        let opts = TableOptions::new().with_journal_size(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/table.json");
        let opts = TableOptions::new().with_pack_size(128).with_journal_size(64);
        opts.save_to_file(&path).unwrap();

        let loaded = TableOptions::load_from_file(&path).unwrap();
        assert_eq!(loaded, opts);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        fs::write(&path, r#"{ "pack_size": 16 }"#).unwrap();

        let loaded = TableOptions::load_from_file(&path).unwrap();
        assert_eq!(loaded.pack_size, 16);
        assert_eq!(loaded.journal_size, DEFAULT_JOURNAL_SIZE);
    }

    #[test]
    fn test_parse_usize_error() {
        assert!(parse_usize("X", "abc").is_err());
        assert_eq!(parse_usize("X", " 42 ").unwrap(), 42);
    }
}
