use std::error::Error;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Application configuration, read from a TOML file with a `[mysql]` and an
/// `[api]` section.  Missing keys abort startup with a descriptive error.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mysql: MysqlConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3306
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// URL template with `{limit}` and `{offset}` placeholders
    pub base_url: String,
}

impl AppConfig {
    pub fn from_path(path: &Path) -> Result<AppConfig, Box<dyn Error>> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file {}: {}", path.display(), e))?;
        AppConfig::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<AppConfig, Box<dyn Error>> {
        toml::from_str(content).map_err(|e| format!("invalid config file: {}", e).into())
    }
}
