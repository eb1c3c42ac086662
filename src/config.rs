use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Index configuration, usually read from the `[index]` table of a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_snippet_tokens")]
    pub snippet_tokens: u32,
    #[serde(default = "default_build_on_open")]
    pub build_on_open: bool,
}

fn default_enabled() -> bool {
    true
}
fn default_batch_size() -> usize {
    512
}
fn default_limit() -> usize {
    20
}
fn default_max_limit() -> usize {
    200
}
fn default_max_connections() -> u32 {
    4
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_snippet_tokens() -> u32 {
    16
}
fn default_build_on_open() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    index: IndexConfig,
}

impl IndexConfig {
    /// Configuration with every default applied, rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            enabled: default_enabled(),
            batch_size: default_batch_size(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            snippet_tokens: default_snippet_tokens(),
            build_on_open: default_build_on_open(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            bail!("index.base_dir must not be empty");
        }
        if self.batch_size == 0 {
            bail!("index.batch_size must be > 0");
        }
        if self.default_limit == 0 {
            bail!("index.default_limit must be >= 1");
        }
        if self.max_limit < self.default_limit {
            bail!(
                "index.max_limit ({}) must be >= index.default_limit ({})",
                self.max_limit,
                self.default_limit
            );
        }
        if self.max_connections == 0 {
            bail!("index.max_connections must be >= 1");
        }
        if !(1..=64).contains(&self.snippet_tokens) {
            bail!("index.snippet_tokens must be in [1, 64]");
        }
        Ok(())
    }

    /// Clamp a requested page size into `[1, max_limit]`, mapping 0 to the default.
    pub fn page_limit(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_limit
        } else {
            requested.min(self.max_limit)
        }
    }
}

pub fn parse_config(content: &str) -> Result<IndexConfig> {
    let file: ConfigFile = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    file.index.validate()?;
    Ok(file.index)
}

pub fn load_config(path: &Path) -> Result<IndexConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
