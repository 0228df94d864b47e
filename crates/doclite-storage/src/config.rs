//! Database options.
//!
//! Options are built programmatically; [`DbOptions::from_env`] additionally
//! merges `DOCLITE_`-prefixed environment variables over the defaults, so
//! pragmas and retry behavior can be tuned without code changes.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use doclite_core::error::{DbError, Result};
use doclite_query::TemplateCache;

use crate::retry::RetrySetting;

/// SQLite journaling mode applied at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Wal,
    Delete,
    Memory,
}

impl JournalMode {
    /// The pragma value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Tunables applied when a [`Database`](crate::Database) is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbOptions {
    /// Journal mode pragma.
    pub journal_mode: JournalMode,
    /// `busy_timeout` pragma in milliseconds.
    pub busy_timeout_ms: u32,
    /// `foreign_keys` pragma.
    pub foreign_keys: bool,
    /// Per-collection SQL template cache capacity; 0 disables caching.
    pub template_cache_capacity: usize,
    /// Database-level retry setting, inherited by collections and calls.
    pub retry: RetrySetting,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5_000,
            foreign_keys: true,
            template_cache_capacity: TemplateCache::DEFAULT_CAPACITY,
            retry: RetrySetting::default(),
        }
    }
}

impl DbOptions {
    /// Creates the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads options from the environment: defaults merged with
    /// `DOCLITE_`-prefixed variables (e.g. `DOCLITE_BUSY_TIMEOUT_MS=250`).
    pub fn from_env() -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("DOCLITE_"))
            .extract()
            .map_err(|e| {
                DbError::invalid_operation(format!("invalid environment configuration: {e}"))
            })
    }

    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn template_cache_capacity(mut self, capacity: usize) -> Self {
        self.template_cache_capacity = capacity;
        self
    }

    pub fn retry(mut self, setting: RetrySetting) -> Self {
        self.retry = setting;
        self
    }

    /// Disables retries database-wide.
    pub fn no_retry(mut self) -> Self {
        self.retry = RetrySetting::Disabled;
        self
    }

    /// Pragma batch applied right after the connection opens.
    pub(crate) fn pragma_sql(&self) -> String {
        format!(
            "PRAGMA journal_mode = {};\nPRAGMA foreign_keys = {};\nPRAGMA busy_timeout = {};",
            self.journal_mode.as_str(),
            if self.foreign_keys { "ON" } else { "OFF" },
            self.busy_timeout_ms,
        )
    }
}
