// ⚙️ Configuration - config.toml with an embedded default
//
// Search order:
// 1. --config path given on the command line
// 2. config.toml in the working directory
// 3. config.toml next to the executable
// 4. embedded default

use crate::importer::{BeamUsageKpis, PublicationMapping};
use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub server: ServerConfig,

    /// Directory relative database paths resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "https://user.lightsource.ca/api/v1/".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    pub normal_shifts_kpi: i64,
    pub shifts_used_kpi: i64,
    /// Facility time zone as minutes east of UTC (Saskatoon is -360)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub publications: Vec<PublicationMapping>,
}

fn default_utc_offset_minutes() -> i32 {
    -360
}

impl ImportConfig {
    pub fn beam_usage_kpis(&self) -> BeamUsageKpis {
        BeamUsageKpis {
            normal_shifts: self.normal_shifts_kpi,
            shifts_used: self.shifts_used_kpi,
        }
    }

    /// Offset used to place month boundaries at local midnight
    pub fn facility_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .with_context(|| format!("utc_offset_minutes out of range: {}", self.utc_offset_minutes))
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            normal_shifts_kpi: 8,
            shifts_used_kpi: 9,
            utc_offset_minutes: default_utc_offset_minutes(),
            publications: vec![
                PublicationMapping { kpi: 5, kinds: vec!["article".into()] },
                PublicationMapping { kpi: 14, kinds: vec!["msc_thesis".into(), "phd_thesis".into()] },
                PublicationMapping { kpi: 15, kinds: vec!["pdb".into()] },
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccessConfig {
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default)]
    pub admin_roles: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Default configuration embedded in the binary
const DEFAULT_CONFIG: &str = r#"
[database]
path = "kpis.db"

[api]
base_url = "https://user.lightsource.ca/api/v1/"

[import]
normal_shifts_kpi = 8
shifts_used_kpi = 9
utc_offset_minutes = -360

[[import.publications]]
kpi = 5
kinds = ["article"]

[[import.publications]]
kpi = 14
kinds = ["msc_thesis", "phd_thesis"]

[[import.publications]]
kpi = 15
kinds = ["pdb"]

[access]
admin_users = []
admin_roles = ["administrator:uso"]

[server]
addr = "0.0.0.0:3000"
"#;

pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Invalid configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<Config> {
    tracing::info!("Loading config from: {}", path.display());
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut config = parse_config(&contents)?;
    config.base_dir = path.parent().map(Path::to_path_buf);
    Ok(config)
}

/// Load configuration, falling back to the embedded default
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        return read_config(path);
    }

    let local = PathBuf::from("config.toml");
    if local.exists() {
        return read_config(&local);
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let config_path = exe_dir.join("config.toml");
            if config_path.exists() {
                return read_config(&config_path);
            }
            tracing::debug!("config.toml not found at: {}", config_path.display());
        }
    }

    tracing::info!("Using default embedded configuration");
    parse_config(DEFAULT_CONFIG)
}

/// Database file path; relative paths resolve against the config file's
/// directory (or the working directory for the embedded default)
pub fn get_database_path(config: &Config) -> PathBuf {
    let db_path = Path::new(&config.database.path);
    if db_path.is_absolute() {
        return db_path.to_path_buf();
    }

    match &config.base_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(db_path),
        _ => db_path.to_path_buf(),
    }
}
