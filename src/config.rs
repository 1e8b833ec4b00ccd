use std::env;

/// Placeholder secrets for local development. `Config::uses_dev_secrets`
/// reports when a server is running on these so startup can say so loudly.
pub const DEV_CHAT_TOKEN_SECRET: &str = "dev-chat-secret";
pub const DEV_GAME_TICKET_SECRET: &str = "dev-game-secret";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub pending_ttl_seconds: u64,
    pub store_timeout_ms: u64,
    pub store_retries: u32,
    pub chat_token_secret: String,
    pub chat_token_issuer: Option<String>,
    pub chat_token_audience: String,
    pub game_ticket_secret: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("TETHER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
            pending_ttl_seconds: env::var("PENDING_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(600), // default 10 minutes
            store_timeout_ms: env::var("STORE_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(5_000),
            store_retries: env::var("STORE_RETRIES")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(2),
            chat_token_secret: env::var("CHAT_TOKEN_SECRET")
                .unwrap_or_else(|_| DEV_CHAT_TOKEN_SECRET.to_string()),
            chat_token_issuer: env::var("CHAT_TOKEN_ISSUER").ok().filter(|s| !s.is_empty()),
            chat_token_audience: env::var("CHAT_TOKEN_AUDIENCE")
                .unwrap_or_else(|_| "tether".to_string()),
            game_ticket_secret: env::var("GAME_TICKET_SECRET")
                .unwrap_or_else(|_| DEV_GAME_TICKET_SECRET.to_string()),
        }
    }

    /// True when either verification secret is still the dev placeholder.
    pub fn uses_dev_secrets(&self) -> bool {
        self.chat_token_secret == DEV_CHAT_TOKEN_SECRET
            || self.game_ticket_secret == DEV_GAME_TICKET_SECRET
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
            pending_ttl_seconds: 600,
            store_timeout_ms: 5_000,
            store_retries: 2,
            chat_token_secret: DEV_CHAT_TOKEN_SECRET.to_string(),
            chat_token_issuer: None,
            chat_token_audience: "tether".to_string(),
            game_ticket_secret: DEV_GAME_TICKET_SECRET.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_runs_on_dev_secrets() {
        assert!(Config::default().uses_dev_secrets());
    }

    #[test]
    fn real_secrets_clear_the_dev_flag() {
        let config = Config {
            chat_token_secret: "prod-chat".to_string(),
            game_ticket_secret: "prod-game".to_string(),
            ..Config::default()
        };
        assert!(!config.uses_dev_secrets());
    }
}
