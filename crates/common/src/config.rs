//! Application configuration.
//!
//! Read once at startup; handlers receive the resulting value through the
//! application context instead of consulting the environment themselves.

use serde::Deserialize;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Federation configuration.
    pub federation: FederationConfig,
    /// Index table handles.
    #[serde(default)]
    pub tables: TableConfig,
    /// Blob bucket handles.
    #[serde(default)]
    pub buckets: BucketConfig,
    /// Collection page sizes.
    #[serde(default)]
    pub pages: PageConfig,
    /// Optional user seeded at startup.
    #[serde(default)]
    pub seed_user: Option<SeedUserConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Federation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Domain name carried by every URI this server generates. Recipients on
    /// this host are treated as internal during fan-out.
    pub domain: String,
}

/// Handles to the index tables.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// User table id.
    #[serde(default = "default_user_table")]
    pub user_table: String,
    /// Object table id.
    #[serde(default = "default_object_table")]
    pub object_table: String,
}

/// Handles to the blob buckets.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Bucket holding activity, post, inbox and staging blobs.
    #[serde(default = "default_objects_bucket")]
    pub objects: String,
    /// Write-only forensic bucket for rejected payloads.
    #[serde(default = "default_quarantine_bucket")]
    pub quarantine: String,
}

/// Page sizes of the paginated collection endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PageConfig {
    #[serde(default = "default_follower_page_size")]
    pub followers: usize,
    #[serde(default = "default_follower_page_size")]
    pub following: usize,
    #[serde(default = "default_outbox_page_size")]
    pub outbox: usize,
    #[serde(default = "default_reply_page_size")]
    pub replies: usize,
}

/// User record seeded by the server binary at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUserConfig {
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            user_table: default_user_table(),
            object_table: default_object_table(),
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            objects: default_objects_bucket(),
            quarantine: default_quarantine_bucket(),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            followers: default_follower_page_size(),
            following: default_follower_page_size(),
            outbox: default_outbox_page_size(),
            replies: default_reply_page_size(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_user_table() -> String {
    "users".to_string()
}

fn default_object_table() -> String {
    "objects".to_string()
}

fn default_objects_bucket() -> String {
    "objects".to_string()
}

fn default_quarantine_bucket() -> String {
    "quarantine".to_string()
}

const fn default_follower_page_size() -> usize {
    12
}

const fn default_outbox_page_size() -> usize {
    20
}

const fn default_reply_page_size() -> usize {
    12
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `QUILL_ENV`)
    /// 3. Environment variables with `QUILL_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("QUILL_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("QUILL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("QUILL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults() {
        let pages = PageConfig::default();
        assert_eq!(pages.followers, 12);
        assert_eq!(pages.following, 12);
        assert_eq!(pages.outbox, 20);
        assert_eq!(pages.replies, 12);
    }
}
