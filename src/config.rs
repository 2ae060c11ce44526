use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::orchestrator::ChatSettings;
use crate::types::{ChatflowError, ConversationId, Result};

/// Environment variable holding the bearer token for the assistant backend.
pub const TOKEN_ENV: &str = "CHATFLOW_TOKEN";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value_t = false)]
    pub thinking: bool,
    /// Knowledge bases to search, comma separated
    #[arg(long, value_delimiter = ',')]
    pub kb_ids: Vec<String>,
    /// Resume an existing conversation
    #[arg(long)]
    pub conversation: Option<String>,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.model.clone(),
            thinking_enabled: self.thinking,
            kb_ids: self
                .kb_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(ConversationId::from)
    }

    pub fn build_http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
            .map_err(|e| ChatflowError::Network(e).into())
    }
}

/// Reads the bearer token after `.env` has been loaded. Empty means anonymous.
pub fn token_from_env() -> Option<String> {
    match std::env::var(TOKEN_ENV) {
        Ok(t) if !t.trim().is_empty() => Some(t),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["chatflow"]);
        assert_eq!(args.base_url, DEFAULT_BASE_URL);
        assert!(!args.thinking);
        assert!(args.conversation_id().is_none());
        let settings = args.settings();
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert!(settings.kb_ids.is_empty());
    }

    #[test]
    fn test_kb_ids_are_split_and_trimmed() {
        let args = Args::parse_from([
            "chatflow",
            "--kb-ids",
            "kb1, kb2,,kb3",
            "--thinking",
            "--conversation",
            "c42",
        ]);
        let settings = args.settings();
        assert_eq!(settings.kb_ids, vec!["kb1", "kb2", "kb3"]);
        assert!(settings.thinking_enabled);
        assert_eq!(args.conversation_id(), Some(ConversationId::from("c42")));
    }
}
