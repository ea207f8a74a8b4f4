//! Settings and filesystem paths.
//!
//! Settings come from a YAML file in the data dir with `TABULA_*`
//! environment overrides layered on top. The upstream API key is never
//! logged; callers log the base URL and model names only.

use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::security::Role;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub chunks_db_path: PathBuf,
    pub history_db_path: PathBuf,
    pub settings_path: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        let data_dir = discover_data_dir();
        let log_dir = data_dir.join("logs");
        let chunks_db_path = data_dir.join("tabula_chunks.db");
        let history_db_path = data_dir.join("tabula_history.db");
        let settings_path = data_dir.join("config.yml");

        for dir in [&data_dir, &log_dir] {
            let _ = fs::create_dir_all(dir);
        }

        AppPaths {
            data_dir,
            log_dir,
            chunks_db_path,
            history_db_path,
            settings_path,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

fn discover_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("TABULA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if cfg!(target_os = "windows") {
        let base = env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string()));
        return PathBuf::from(base).join("Tabula");
    }

    if cfg!(target_os = "macos") {
        return home_dir()
            .join("Library")
            .join("Application Support")
            .join("Tabula");
    }

    let xdg = env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        home_dir()
            .join(".local/share")
            .to_string_lossy()
            .to_string()
    });
    PathBuf::from(xdg).join("tabula")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub retrieval: RetrievalSettings,
    pub auth: AuthSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
            retrieval: RetrievalSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            port: 0,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    /// Presence selects vector retrieval; absence selects keyword retrieval.
    pub embedding_model: Option<String>,
    pub temperature: f64,
    pub max_tokens: i32,
    pub chat_timeout_secs: u64,
    pub embed_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: None,
            temperature: 0.2,
            max_tokens: 1024,
            chat_timeout_secs: 120,
            embed_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Logical id of the current knowledge source generation.
    pub doc_id: String,
    pub similarity_threshold: f32,
    pub vector_top_k: usize,
    pub keyword_top_k: usize,
    pub keyword_candidates: usize,
    pub max_keywords: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        RetrievalSettings {
            doc_id: "knowledge-base".to_string(),
            similarity_threshold: 0.25,
            vector_top_k: 5,
            keyword_top_k: 6,
            keyword_candidates: 12,
            max_keywords: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub role: Role,
}

impl Settings {
    /// Load settings from the YAML file (missing file means defaults),
    /// then apply environment overrides.
    pub fn load(paths: &AppPaths) -> Self {
        let mut settings = match fs::read_to_string(&paths.settings_path) {
            Ok(contents) => match serde_yaml::from_str::<Settings>(&contents) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(
                        "Failed to parse {}: {}; using defaults",
                        paths.settings_path.display(),
                        err
                    );
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };

        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("TABULA_BASE_URL") {
            if !value.trim().is_empty() {
                self.upstream.base_url = value;
            }
        }
        if let Ok(value) = env::var("TABULA_API_KEY") {
            if !value.trim().is_empty() {
                self.upstream.api_key = value;
            }
        }
        if let Ok(value) = env::var("TABULA_CHAT_MODEL") {
            if !value.trim().is_empty() {
                self.upstream.chat_model = value;
            }
        }
        if let Ok(value) = env::var("TABULA_EMBEDDING_MODEL") {
            if !value.trim().is_empty() {
                self.upstream.embedding_model = Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_keyword_retrieval() {
        let settings = Settings::default();
        assert!(settings.upstream.embedding_model.is_none());
        assert_eq!(settings.retrieval.keyword_top_k, 6);
        assert_eq!(settings.retrieval.doc_id, "knowledge-base");
    }

    #[test]
    fn yaml_round_trip_preserves_auth_tokens() {
        let mut settings = Settings::default();
        settings.auth.tokens.push(TokenEntry {
            token: "t-1".to_string(),
            user_id: "alice".to_string(),
            role: Role::Admin,
        });

        let yaml = serde_yaml::to_string(&settings).unwrap();
        let parsed: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.auth.tokens.len(), 1);
        assert_eq!(parsed.auth.tokens[0].user_id, "alice");
        assert_eq!(parsed.auth.tokens[0].role, Role::Admin);
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let parsed: Settings =
            serde_yaml::from_str("upstream:\n  chat_model: my-model\n").unwrap();
        assert_eq!(parsed.upstream.chat_model, "my-model");
        assert_eq!(parsed.retrieval.similarity_threshold, 0.25);
    }
}
