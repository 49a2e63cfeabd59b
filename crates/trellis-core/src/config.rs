//! Store configuration
//!
//! Handles configuration from environment variables and TOML files,
//! with defaults matching a local single-instance Neo4j server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USERNAME: &str = "neo4j";
pub const DEFAULT_DATABASE: &str = "neo4j";
pub const DEFAULT_GRAPH_LABEL_PREFIX: &str = "__Graph_";
pub const DEFAULT_NAMESPACE_PROPERTY: &str = "__graph_namespace";

/// Top-level store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend identifier, expected to be "neo4j"
    pub store_type: String,

    /// Bolt/neo4j URL, may carry credentials in its userinfo
    pub database_url: String,

    /// Driver-level settings
    pub driver_config: DriverConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: "neo4j".to_string(),
            database_url: String::new(),
            driver_config: DriverConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration for the given URL and password
    pub fn new(database_url: impl Into<String>, password: impl Into<String>) -> Self {
        let mut config = Self {
            database_url: database_url.into(),
            ..Default::default()
        };
        config.driver_config.password = Some(password.into());
        config
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_override()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(self) -> Result<Self, ConfigError> {
        self.override_from(|key| std::env::var(key).ok())
    }

    /// Apply every variable that is set, whatever its value
    fn override_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(store_type) = lookup("TRELLIS_STORE_TYPE") {
            self.store_type = store_type;
        }
        if let Some(url) = lookup("NEO4J_URL").filter(|u| !u.is_empty()) {
            self.database_url = url;
        }
        if let Some(user) = lookup("NEO4J_USERNAME") {
            self.driver_config.username = user;
        }
        if let Some(pass) = lookup("NEO4J_PASSWORD") {
            self.driver_config.password = Some(pass);
        }
        if let Some(flag) = lookup("NEO4J_USE_SEPARATE_DATABASE") {
            self.driver_config.use_separate_database =
                parse_bool(&flag).ok_or_else(|| ConfigError::InvalidValue {
                    key: "NEO4J_USE_SEPARATE_DATABASE".to_string(),
                    value: flag.clone(),
                })?;
        }
        if let Some(prefix) = lookup("NEO4J_GRAPH_LABEL_PREFIX") {
            self.driver_config.graph_label_prefix = prefix;
        }
        if let Some(property) = lookup("NEO4J_GRAPH_NAMESPACE_PROPERTY") {
            self.driver_config.graph_namespace_property = property;
        }

        Ok(self)
    }

    /// Resolve the credentials to use, URL userinfo acting as fallback.
    ///
    /// Returns the URL stripped of its userinfo along with username and password.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("database_url".to_string()));
        }

        let mut uri = self.database_url.clone();
        let mut url_user = None;
        let mut url_pass = None;

        if let Ok(mut parsed) = url::Url::parse(&self.database_url) {
            if !parsed.username().is_empty() {
                url_user = Some(decode(parsed.username()));
            }
            url_pass = parsed.password().map(decode);
            if url_user.is_some() || url_pass.is_some() {
                // set_username/set_password only fail for cannot-be-a-base URLs
                let _ = parsed.set_username("");
                let _ = parsed.set_password(None);
                uri = parsed.to_string().trim_end_matches('/').to_string();
            }
        }

        let username = if self.driver_config.username != DEFAULT_USERNAME {
            self.driver_config.username.clone()
        } else {
            url_user.unwrap_or_else(|| self.driver_config.username.clone())
        };

        let password = self
            .driver_config
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .or(url_pass.filter(|p| !p.is_empty()))
            .ok_or_else(|| ConfigError::MissingRequired("password".to_string()))?;

        Ok(Credentials {
            uri,
            username,
            password,
        })
    }
}

fn decode(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={raw}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolved connection credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uri: String,
    pub username: String,
    pub password: String,
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Basic-auth user name
    pub username: String,

    /// Basic-auth password (required, here or in the URL)
    pub password: Option<String>,

    /// One database per logical graph (Enterprise only)
    pub use_separate_database: bool,

    /// Prefix of the partition label in label mode
    pub graph_label_prefix: String,

    /// Property name reserved for the label-mode namespace constraint
    pub graph_namespace_property: String,

    /// Shared database used in label mode
    pub default_database: String,

    /// Connection pool size
    pub max_connections: usize,

    /// Rows fetched per round trip
    pub fetch_size: usize,

    /// How long to wait for a freshly created database to come online
    pub availability_timeout_secs: u64,

    /// Freeform settings forwarded to the driver
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password: None,
            use_separate_database: false,
            graph_label_prefix: DEFAULT_GRAPH_LABEL_PREFIX.to_string(),
            graph_namespace_property: DEFAULT_NAMESPACE_PROPERTY.to_string(),
            default_database: DEFAULT_DATABASE.to_string(),
            max_connections: 16,
            fetch_size: 500,
            availability_timeout_secs: 5,
            extra: HashMap::new(),
        }
    }
}

impl DriverConfig {
    /// Label prefix, falling back to the default for an empty override
    pub fn label_prefix(&self) -> &str {
        if self.graph_label_prefix.is_empty() {
            DEFAULT_GRAPH_LABEL_PREFIX
        } else {
            &self.graph_label_prefix
        }
    }

    /// Namespace property, falling back to the default for an empty override
    pub fn namespace_property(&self) -> &str {
        if self.graph_namespace_property.is_empty() {
            DEFAULT_NAMESPACE_PROPERTY
        } else {
            &self.graph_namespace_property
        }
    }

    /// Default database, falling back to `neo4j`
    pub fn default_database(&self) -> &str {
        if self.default_database.is_empty() {
            DEFAULT_DATABASE
        } else {
            &self.default_database
        }
    }

    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout_secs.max(1))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
