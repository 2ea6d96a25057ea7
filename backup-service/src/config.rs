use std::path::PathBuf;

/// Service-level settings; everything about the pipeline itself lives in
/// `backup_pipeline::Config`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Optional TOML file for the pipeline configuration
    pub backup_config: Option<PathBuf>,
    /// Serve the HTTP status API
    pub api_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            backup_config: std::env::var("BACKUP_CONFIG")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            api_enabled: std::env::var("API_ENABLED")
                .ok()
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
