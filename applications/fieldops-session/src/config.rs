use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Backend paths, relative to `api.base_url`, plus the host's login route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_current_user_path")]
    pub current_user_path: String,
    #[serde(default = "default_login_route")]
    pub login_route: String,
}

fn default_refresh_path() -> String {
    "token/refresh/".into()
}

fn default_login_path() -> String {
    "token/".into()
}

fn default_current_user_path() -> String {
    "users/me/".into()
}

fn default_login_route() -> String {
    "/login".into()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            current_user_path: default_current_user_path(),
            login_route: default_login_route(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_refresh_buffer_secs() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
        }
    }
}

impl SessionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }
}

/// Where the session survives restarts. Without a path the session lives in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding `$(VAR)` placeholders first
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        let mut config: Config = serde_yaml::from_str(&expanded)?;

        if let Ok(url) = std::env::var("FIELDOPS_API_URL") {
            config.api.base_url = url;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    /// Storage file path with `~` and `$VAR` expanded, if one is configured.
    pub fn storage_path(&self) -> Result<Option<PathBuf>> {
        match self.storage.path.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let expanded = shellexpand::full(raw).map_err(|e| {
                    AppError::Config(format!("Invalid storage path {}: {}", raw, e))
                })?;
                Ok(Some(PathBuf::from(expanded.as_ref())))
            }
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(AppError::Config("API base_url cannot be empty".to_string()));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "API request_timeout_secs cannot be 0".to_string(),
            ));
        }

        if self.session.check_interval_secs == 0 {
            return Err(AppError::Config(
                "Session check_interval_secs cannot be 0".to_string(),
            ));
        }

        if self.auth.refresh_path.is_empty() || self.auth.current_user_path.is_empty() {
            return Err(AppError::Config(
                "Auth refresh_path and current_user_path are required".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in the format $(VAR_NAME)
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    let re = match regex::Regex::new(r"\$\(([A-Z_][A-Z0-9_]*)\)") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(full_match, &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        std::env::set_var("FIELDOPS_TEST_VAR", "test_value");

        let input = "base_url: $(FIELDOPS_TEST_VAR)";
        let output = expand_env_vars(input);

        assert_eq!(output, "base_url: test_value");

        std::env::remove_var("FIELDOPS_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_not_found() {
        let input = "base_url: $(FIELDOPS_NONEXISTENT_VAR)";
        let output = expand_env_vars(input);

        // Should leave it unchanged if not found
        assert_eq!(output, "base_url: $(FIELDOPS_NONEXISTENT_VAR)");
    }

    #[test]
    #[serial]
    fn test_defaults_fill_missing_sections() {
        std::env::remove_var("FIELDOPS_API_URL");
        let config = Config::from_yaml("api:\n  base_url: \"http://localhost:8000/api\"\n").unwrap();

        assert_eq!(config.api.request_timeout_secs, 30);
        assert_eq!(config.auth.refresh_path, "token/refresh/");
        assert_eq!(config.auth.login_route, "/login");
        assert_eq!(config.session.check_interval(), Duration::from_secs(60));
        assert_eq!(config.session.refresh_buffer(), Duration::from_secs(300));
        assert!(config.storage_path().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_zero_timeout_rejected() {
        std::env::remove_var("FIELDOPS_API_URL");
        let yaml = "api:\n  base_url: \"http://localhost\"\n  request_timeout_secs: 0\n";

        assert!(matches!(Config::from_yaml(yaml), Err(AppError::Config(_))));
    }
}
