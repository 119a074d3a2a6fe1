use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{Actor, IdentityProvider};

pub const DEFAULT_USER_AGENT: &str = "docpub/0.1";
pub const DEFAULT_PUBLISH_SUMMARY: &str = "Published";
pub const DEFAULT_REFRESH_SUMMARY: &str = "Refreshed";
pub const DEFAULT_MAX_INLINE_BODY_BYTES: usize = 65_535;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DocpubConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub actors: Vec<ActorEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PublishSection {
    pub edit_summary: Option<String>,
    pub refresh_summary: Option<String>,
    pub max_inline_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ActorEntry {
    pub id: i64,
    pub name: String,
}

impl DocpubConfig {
    /// Resolve the remote API URL: env DOCPUB_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        if let Ok(value) = env::var("DOCPUB_API_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        self.site.api_url.clone()
    }

    /// Resolve user agent: env DOCPUB_USER_AGENT > config > default.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("DOCPUB_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.site
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn edit_summary(&self) -> String {
        self.publish
            .edit_summary
            .clone()
            .unwrap_or_else(|| DEFAULT_PUBLISH_SUMMARY.to_string())
    }

    pub fn refresh_summary(&self) -> String {
        self.publish
            .refresh_summary
            .clone()
            .unwrap_or_else(|| DEFAULT_REFRESH_SUMMARY.to_string())
    }

    pub fn max_inline_body_bytes(&self) -> usize {
        self.publish
            .max_inline_body_bytes
            .unwrap_or(DEFAULT_MAX_INLINE_BODY_BYTES)
    }
}

/// Load a DocpubConfig from a TOML file. Returns default if the file
/// does not exist.
pub fn load_config(config_path: &Path) -> Result<DocpubConfig> {
    if !config_path.exists() {
        return Ok(DocpubConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DocpubConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Identity lookup backed by the `[[actors]]` config table. Unknown ids
/// get a synthetic `user-{id}` name so attribution never blocks a write.
pub struct ConfigIdentityProvider {
    actors: Vec<ActorEntry>,
}

impl ConfigIdentityProvider {
    pub fn new(config: &DocpubConfig) -> Self {
        Self {
            actors: config.actors.clone(),
        }
    }
}

impl IdentityProvider for ConfigIdentityProvider {
    fn actor_by_id(&self, id: i64) -> Result<Actor> {
        let name = self
            .actors
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| format!("user-{id}"));
        Ok(Actor { id, name })
    }
}
