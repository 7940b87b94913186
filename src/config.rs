//! Layered configuration for the index.
//!
//! Settings are resolved from, in increasing priority:
//! - built-in defaults
//! - `.navigraph/settings.toml`, found by walking up from the current directory
//! - environment variables
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `NG_` and use double underscores
//! to separate nested levels:
//! - `NG_INDEX__M=32` sets `index.m`
//! - `NG_SEARCH__ITERATIVE_SCAN=strict` sets `search.iterative_scan`
//! - `NG_BUILD__MAINTENANCE_WORK_MEM=1048576` sets `build.maintenance_work_mem`

use crate::error::{HnswError, HnswResult};
use crate::metric::MetricKind;
use crate::storage::tuple::max_dimensions;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".navigraph";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "NG_";

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Settings {
    /// Graph shape, fixed when an index is created
    #[serde(default)]
    pub index: IndexConfig,

    /// Query-time behaviour
    #[serde(default)]
    pub search: SearchConfig,

    /// Bulk build
    #[serde(default)]
    pub build: BuildConfig,

    /// Page file durability
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub vacuum: VacuumConfig,

    /// Sampled recall tracking
    #[serde(default)]
    pub recall: RecallConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexConfig {
    /// Base degree bound (layer 0 holds twice as many neighbors)
    #[serde(default = "default_m")]
    pub m: usize,

    /// Candidate list size while inserting
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    #[serde(default)]
    pub metric: MetricKind,

    /// Upper bound on vector dimensions accepted at creation
    #[serde(default = "default_max_dimensions")]
    pub max_dimensions: usize,
}

/// How a scan continues once its first candidate list is used up.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IterativeScan {
    /// Return only the first pass.
    Off,
    /// Keep searching with a doubled candidate list; order across passes
    /// is approximate.
    #[default]
    Relaxed,
    /// Like `Relaxed`, but never return a row closer than one already returned.
    Strict,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    /// Candidate list size for queries
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    #[serde(default)]
    pub iterative_scan: IterativeScan,

    /// Elements a single scan may visit before it stops expanding
    #[serde(default = "default_max_scan_tuples")]
    pub max_scan_tuples: usize,

    /// Ceiling for the doubled candidate list
    #[serde(default = "default_max_ef_search")]
    pub max_ef_search: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BuildConfig {
    /// Memory budget of the in-memory build graph, in bytes
    #[serde(default = "default_maintenance_work_mem")]
    pub maintenance_work_mem: usize,

    /// Worker threads used when a build asks for the default parallelism
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,

    /// Rows buffered between the feeding thread and the workers
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Fsync the journal before pages are written in place
    #[serde(default = "default_true")]
    pub synchronous: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VacuumConfig {
    /// Also re-attach live elements whose layer-0 list is not full
    #[serde(default = "default_false")]
    pub repair_unfilled: bool,

    /// Pages processed between two cancellation checks
    #[serde(default = "default_check_interval")]
    pub check_interval: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecallConfig {
    #[serde(default = "default_false")]
    pub track_recall: bool,

    /// Every n-th query is checked against an exhaustive walk
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u64,

    /// Elements the exhaustive walk may visit
    #[serde(default = "default_recall_max_scan_tuples")]
    pub max_scan_tuples: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// One of "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Print the module path of each event
    #[serde(default = "default_false")]
    pub show_target: bool,
}

fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    64
}
fn default_max_dimensions() -> usize {
    2000
}
fn default_ef_search() -> usize {
    40
}
fn default_max_scan_tuples() -> usize {
    20_000
}
fn default_max_ef_search() -> usize {
    1000 * 16
}
fn default_maintenance_work_mem() -> usize {
    64 * 1024 * 1024
}
fn default_parallel_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}
fn default_queue_depth() -> usize {
    1024
}
fn default_check_interval() -> usize {
    1
}
fn default_sample_rate() -> u64 {
    100
}
fn default_recall_max_scan_tuples() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            metric: MetricKind::default(),
            max_dimensions: default_max_dimensions(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ef_search: default_ef_search(),
            iterative_scan: IterativeScan::default(),
            max_scan_tuples: default_max_scan_tuples(),
            max_ef_search: default_max_ef_search(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            maintenance_work_mem: default_maintenance_work_mem(),
            parallel_workers: default_parallel_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            synchronous: true,
        }
    }
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            repair_unfilled: false,
            check_interval: default_check_interval(),
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            track_recall: false,
            sample_rate: default_sample_rate(),
            max_scan_tuples: default_recall_max_scan_tuples(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            show_target: false,
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::figment(config_path).extract().map_err(Box::new)
    }

    /// Load configuration from a specific file, still honouring `NG_` overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref().to_path_buf())
            .extract()
            .map_err(Box::new)
    }

    fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore separates nested levels; single underscores
            // stay part of the field name.
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find `.navigraph/settings.toml` from the current directory upwards
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> HnswResult<()> {
        let search = &self.search;
        if !(1..=1000).contains(&search.ef_search) {
            return Err(invalid(
                "search.ef_search",
                format!("{} is outside 1..=1000", search.ef_search),
            ));
        }
        if search.max_ef_search < search.ef_search {
            return Err(invalid(
                "search.max_ef_search",
                format!(
                    "{} is below search.ef_search ({})",
                    search.max_ef_search, search.ef_search
                ),
            ));
        }
        if self.index.max_dimensions == 0 || self.index.max_dimensions > max_dimensions() {
            return Err(invalid(
                "index.max_dimensions",
                format!(
                    "{} is outside 1..={}",
                    self.index.max_dimensions,
                    max_dimensions()
                ),
            ));
        }
        if self.build.queue_depth == 0 {
            return Err(invalid("build.queue_depth", "must be at least 1".to_string()));
        }
        if self.recall.sample_rate == 0 {
            return Err(invalid("recall.sample_rate", "must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn invalid(option: &'static str, reason: String) -> HnswError {
    HnswError::InvalidOption { option, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.index.m, 16);
        assert_eq!(settings.index.ef_construction, 64);
        assert_eq!(settings.search.ef_search, 40);
        assert_eq!(settings.search.iterative_scan, IterativeScan::Relaxed);
        assert_eq!(settings.build.maintenance_work_mem, 64 * 1024 * 1024);
        assert!(settings.build.parallel_workers >= 1);
        assert!(!settings.vacuum.repair_unfilled);
        assert!(!settings.recall.track_recall);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
[index]
m = 8
metric = "cosine"

[search]
ef_search = 100
iterative_scan = "strict"

[vacuum]
repair_unfilled = true
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.index.m, 8);
        assert_eq!(settings.index.metric, MetricKind::Cosine);
        assert_eq!(settings.search.ef_search, 100);
        assert_eq!(settings.search.iterative_scan, IterativeScan::Strict);
        assert!(settings.vacuum.repair_unfilled);
        // untouched sections keep their defaults
        assert_eq!(settings.index.ef_construction, 64);
        assert_eq!(settings.recall.sample_rate, 100);
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.build.parallel_workers = 3;
        settings.recall.track_recall = true;

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.build.parallel_workers, 3);
        assert!(loaded.recall.track_recall);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut settings = Settings::default();
        settings.search.ef_search = 0;
        let err = settings.validate().unwrap_err();
        assert_eq!(err.status_code(), "INVALID_OPTION");

        let mut settings = Settings::default();
        settings.search.max_ef_search = 10;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.index.max_dimensions = max_dimensions() + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_layered_config() {
        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config_dir = temp_dir.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();

        let toml_content = r#"
[build]
parallel_workers = 2
queue_depth = 64

[logging]
level = "debug"
"#;
        fs::write(config_dir.join(CONFIG_FILE), toml_content).unwrap();

        // Environment variables override the config file
        unsafe {
            std::env::set_var("NG_BUILD__PARALLEL_WORKERS", "6");
            std::env::set_var("NG_LOGGING__SHOW_TARGET", "true");
        }

        let settings = Settings::load().unwrap();

        assert_eq!(settings.build.parallel_workers, 6);
        assert_eq!(settings.build.queue_depth, 64);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.show_target);

        unsafe {
            std::env::remove_var("NG_BUILD__PARALLEL_WORKERS");
            std::env::remove_var("NG_LOGGING__SHOW_TARGET");
        }
        std::env::set_current_dir(original_dir).unwrap();
    }
}
