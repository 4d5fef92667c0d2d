use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::schema::Kind;

/// File name of the project configuration, relative to the project root.
pub const CONFIG_FILE: &str = "subtally.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub counters: CountersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_store")]
    pub store: PathBuf,
    #[serde(default = "default_archive")]
    pub archive: PathBuf,
    #[serde(default = "default_daily")]
    pub daily: PathBuf,
    #[serde(default = "default_counters")]
    pub counters: PathBuf,
    #[serde(default = "default_mapping")]
    pub mapping: PathBuf,
    #[serde(default = "default_excluded_users")]
    pub excluded_users: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            archive: default_archive(),
            daily: default_daily(),
            counters: default_counters(),
            mapping: default_mapping(),
            excluded_users: default_excluded_users(),
        }
    }
}

/// Raw file name prefixes, one per transaction kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_act_prefix")]
    pub act: String,
    #[serde(default = "default_reno_prefix")]
    pub reno: String,
    #[serde(default = "default_dct_prefix")]
    pub dct: String,
    #[serde(default = "default_cnr_prefix")]
    pub cnr: String,
    #[serde(default = "default_rfnd_prefix")]
    pub rfnd: String,
    #[serde(default = "default_ppd_prefix")]
    pub ppd: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            act: default_act_prefix(),
            reno: default_reno_prefix(),
            dct: default_dct_prefix(),
            cnr: default_cnr_prefix(),
            rfnd: default_rfnd_prefix(),
            ppd: default_ppd_prefix(),
        }
    }
}

impl SourcesConfig {
    #[must_use]
    pub fn prefix_for(&self, kind: Kind) -> &str {
        match kind {
            Kind::Activation => &self.act,
            Kind::Renewal => &self.reno,
            Kind::Deactivation => &self.dct,
            Kind::Cancellation => &self.cnr,
            Kind::Refund => &self.rfnd,
            Kind::OneTimePurchase => &self.ppd,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_unknown_name")]
    pub unknown_name: String,
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            unknown_name: default_unknown_name(),
            denylist: default_denylist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersConfig {
    #[serde(default = "default_upgrade_channel")]
    pub upgrade_channel: String,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            upgrade_channel: default_upgrade_channel(),
        }
    }
}

/// Absolute locations derived from a [`ProjectConfig`] and a project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub root: PathBuf,
    pub store: PathBuf,
    pub archive: PathBuf,
    pub daily: PathBuf,
    pub counters: PathBuf,
    pub mapping: PathBuf,
    pub excluded_users: PathBuf,
}

impl ProjectConfig {
    /// Resolve every configured path against `root`. Absolute paths are kept.
    #[must_use]
    pub fn resolve_paths(&self, root: &Path) -> ResolvedPaths {
        let join = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        ResolvedPaths {
            root: root.to_path_buf(),
            store: join(&self.paths.store),
            archive: join(&self.paths.archive),
            daily: join(&self.paths.daily),
            counters: join(&self.paths.counters),
            mapping: join(&self.paths.mapping),
            excluded_users: join(&self.paths.excluded_users),
        }
    }
}

/// Load `<root>/subtally.toml`. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ProjectConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn default_store() -> PathBuf {
    PathBuf::from("store/transactions")
}

fn default_archive() -> PathBuf {
    PathBuf::from("archive")
}

fn default_daily() -> PathBuf {
    PathBuf::from("daily")
}

fn default_counters() -> PathBuf {
    PathBuf::from("counters")
}

fn default_mapping() -> PathBuf {
    PathBuf::from("MASTERCPC.csv")
}

fn default_excluded_users() -> PathBuf {
    PathBuf::from("Users_No_Limits.csv")
}

fn default_act_prefix() -> String {
    "act_atlas".to_string()
}

fn default_reno_prefix() -> String {
    "reno_atlas".to_string()
}

fn default_dct_prefix() -> String {
    "dct_atlas".to_string()
}

fn default_cnr_prefix() -> String {
    "cnr_atlas".to_string()
}

fn default_rfnd_prefix() -> String {
    "rfnd_atlas".to_string()
}

fn default_ppd_prefix() -> String {
    "ppd_atlas".to_string()
}

fn default_unknown_name() -> String {
    "UNKNOWN".to_string()
}

fn default_denylist() -> Vec<String> {
    vec!["nubico".to_string(), "movistar apple music".to_string()]
}

fn default_upgrade_channel() -> String {
    "UPGRADE".to_string()
}
