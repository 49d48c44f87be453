//! On-disk layout
//!
//! ```text
//! {root}/ticks/{symbol}/{YYYY-MM-DD}.ticks       active or sealed partition
//! {root}/ticks/{symbol}/{YYYY-MM-DD}.ticks.zst   compressed partition
//! {root}/ticks/{symbol}/{YYYY-MM-DD}.ticks.corrupt-{ms}  quarantined partition
//! {root}/ticks/{symbol}/catalog.json             partition catalog
//! {root}/ticks/{symbol}/.partition.lock          lifecycle lock
//! {root}/archive/{symbol}/{YYYY-MM-DD}.ticks.zst archived partition
//! ```
//!
//! `{symbol}` is [`Symbol::path_component`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use market_types::ids::Symbol;

pub const PARTITION_EXT: &str = "ticks";
pub const COMPRESSED_EXT: &str = "ticks.zst";
const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = ".partition.lock";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ticks_dir(&self) -> PathBuf {
        self.root.join("ticks")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn symbol_dir(&self, symbol: &Symbol) -> PathBuf {
        self.ticks_dir().join(symbol.path_component())
    }

    pub fn partition_path(&self, symbol: &Symbol, day: NaiveDate) -> PathBuf {
        self.symbol_dir(symbol).join(format!("{day}.{PARTITION_EXT}"))
    }

    pub fn compressed_path(&self, symbol: &Symbol, day: NaiveDate) -> PathBuf {
        self.symbol_dir(symbol).join(format!("{day}.{COMPRESSED_EXT}"))
    }

    /// Sibling used while a compressed artifact is being written.
    pub fn compressed_temp_path(&self, symbol: &Symbol, day: NaiveDate) -> PathBuf {
        self.symbol_dir(symbol).join(format!("{day}.{COMPRESSED_EXT}.tmp"))
    }

    /// Where a partition with mid-file corruption is set aside, untouched.
    pub fn quarantine_path(&self, symbol: &Symbol, day: NaiveDate, stamp_ms: i64) -> PathBuf {
        self.symbol_dir(symbol)
            .join(format!("{day}.{PARTITION_EXT}.corrupt-{stamp_ms}"))
    }

    pub fn archive_path(&self, symbol: &Symbol, day: NaiveDate) -> PathBuf {
        self.archive_dir()
            .join(symbol.path_component())
            .join(format!("{day}.{COMPRESSED_EXT}"))
    }

    pub fn catalog_path(&self, symbol: &Symbol) -> PathBuf {
        self.symbol_dir(symbol).join(CATALOG_FILE)
    }

    pub fn lock_path(&self, symbol: &Symbol) -> PathBuf {
        self.symbol_dir(symbol).join(LOCK_FILE)
    }

    /// Symbols with a directory under `ticks/`.
    pub fn discover_symbols(&self) -> io::Result<Vec<Symbol>> {
        let dir = self.ticks_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut symbols = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(symbol) = entry
                .file_name()
                .to_str()
                .and_then(Symbol::from_path_component)
            {
                symbols.push(symbol);
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}

/// fsync a directory so renames and creations inside it are durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}
