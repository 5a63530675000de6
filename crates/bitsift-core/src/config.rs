//! Planner configuration
//!
//! Configuration is resolved with the usual priority:
//! environment variables > config file > defaults.
//!
//! ```toml
//! target_row_count = 500
//! target_cross_product_term_count = 180
//! register_count = 7
//! unresolved_term_policy = "match_none"
//! diagnostics = ["planning/compile"]
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::row::{MAX_RANK, Rank};

/// Environment variable naming a TOML config file
pub const CONFIG_FILE_ENV: &str = "BITSIFT_CONFIG";

/// What the term-plan converter does with a term that has no rows in a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedTermPolicy {
    /// Bind the term to the shard's match-none row
    #[default]
    MatchNone,
    /// Fail the query with `NoMatchPossible`
    Reject,
}

impl std::str::FromStr for UnresolvedTermPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "match_none" | "match-none" => Ok(Self::MatchNone),
            "reject" => Ok(Self::Reject),
            other => Err(Error::config(format!(
                "unknown unresolved term policy '{}'",
                other
            ))),
        }
    }
}

/// Query planner configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Upper bound on row leaves the rewriter may expand a tree to
    pub target_row_count: usize,
    /// Upper bound on row leaves in one conjunctive clause produced by
    /// cross-product expansion
    pub target_cross_product_term_count: usize,
    /// Highest rank the backend accepts
    pub max_rank: Rank,
    /// First accumulator register
    pub register_base: usize,
    /// Number of accumulator registers
    pub register_count: usize,
    /// Handling of terms without rows
    pub unresolved_term_policy: UnresolvedTermPolicy,
    /// AND the document-active row into every plan
    pub filter_inactive_documents: bool,
    /// Planning attempts before register pressure is reported
    pub max_plan_attempts: usize,
    /// Node budget of each per-query arena
    pub node_budget: usize,
    /// Enabled diagnostic channels (prefix match, `"*"` enables all)
    pub diagnostics: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            target_row_count: 500,
            target_cross_product_term_count: 180,
            max_rank: MAX_RANK,
            register_base: 8,
            register_count: 7,
            unresolved_term_policy: UnresolvedTermPolicy::MatchNone,
            filter_inactive_documents: true,
            max_plan_attempts: 3,
            node_budget: 64 * 1024,
            diagnostics: Vec::new(),
        }
    }
}

impl PlannerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config(format!("invalid planner config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded planner configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration from `BITSIFT_CONFIG` (if set) and `BITSIFT_*`
    /// overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                tracing::debug!("{} not set, using default planner config", CONFIG_FILE_ENV);
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BITSIFT_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("BITSIFT_TARGET_ROW_COUNT") {
            self.target_row_count = parse_var("BITSIFT_TARGET_ROW_COUNT", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_TARGET_CROSS_PRODUCT_TERM_COUNT") {
            self.target_cross_product_term_count =
                parse_var("BITSIFT_TARGET_CROSS_PRODUCT_TERM_COUNT", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_MAX_RANK") {
            self.max_rank = parse_var("BITSIFT_MAX_RANK", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_REGISTER_BASE") {
            self.register_base = parse_var("BITSIFT_REGISTER_BASE", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_REGISTER_COUNT") {
            self.register_count = parse_var("BITSIFT_REGISTER_COUNT", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_UNRESOLVED_TERM_POLICY") {
            self.unresolved_term_policy = v.parse()?;
        }
        if let Some(v) = lookup("BITSIFT_FILTER_INACTIVE_DOCUMENTS") {
            self.filter_inactive_documents = parse_var("BITSIFT_FILTER_INACTIVE_DOCUMENTS", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_MAX_PLAN_ATTEMPTS") {
            self.max_plan_attempts = parse_var("BITSIFT_MAX_PLAN_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_NODE_BUDGET") {
            self.node_budget = parse_var("BITSIFT_NODE_BUDGET", &v)?;
        }
        if let Some(v) = lookup("BITSIFT_DIAGNOSTICS") {
            self.diagnostics = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    /// Reject settings no query could be planned with
    pub fn validate(&self) -> Result<()> {
        if self.max_rank > MAX_RANK {
            return Err(Error::config(format!(
                "max_rank {} exceeds {}",
                self.max_rank, MAX_RANK
            )));
        }
        if self.register_count == 0 {
            return Err(Error::config("register_count must be at least 1"));
        }
        if self.target_row_count == 0 || self.target_cross_product_term_count == 0 {
            return Err(Error::config("row count targets must be positive"));
        }
        if self.max_plan_attempts == 0 {
            return Err(Error::config("max_plan_attempts must be at least 1"));
        }
        if self.node_budget == 0 {
            return Err(Error::config("node_budget must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{}={}: {}", key, value, e)))
}
