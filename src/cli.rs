use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Account link server and admin client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query or edit links on a running server
    Admin {
        /// Server base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AdminCommands {
    /// Look up a link by chat or game identity
    Status {
        /// Chat or game identifier
        id: String,
    },

    /// Remove a link by chat or game identity
    Unlink {
        /// Chat or game identifier
        id: String,
    },

    /// Check server liveness
    Health,
}

pub async fn run_admin_client(url: String, command: AdminCommands) -> Result<()> {
    let base = url.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    match command {
        AdminCommands::Status { id } => {
            let endpoint = format!("{}/links/{}", base, id);
            debug!("GET {}", endpoint);
            let resp = client.get(&endpoint).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("no link found for {}", id);
                return Ok(());
            }
            if !resp.status().is_success() {
                anyhow::bail!("server returned {}", resp.status());
            }
            let body: Value = resp.json().await?;
            let chat = body["chat_id"].as_str().unwrap_or("?");
            let game = body["game_id"].as_str().unwrap_or("(unlinked)");
            let when = body["linked_at"].as_str().unwrap_or("?");
            println!("chat {} <-> game {} (since {})", chat, game, when);
        }
        AdminCommands::Unlink { id } => {
            let endpoint = format!("{}/unlink", base);
            debug!("POST {}", endpoint);
            let resp = client
                .post(&endpoint)
                .json(&serde_json::json!({ "id": id }))
                .send()
                .await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("no link found for {}", id);
                return Ok(());
            }
            if !resp.status().is_success() {
                anyhow::bail!("server returned {}", resp.status());
            }
            let body: Value = resp.json().await?;
            println!("removed {} link(s)", body["removed"]);
        }
        AdminCommands::Health => {
            let endpoint = format!("{}/health", base);
            let resp = client.get(&endpoint).send().await?;
            if resp.status().is_success() {
                println!("ok");
            } else {
                anyhow::bail!("server returned {}", resp.status());
            }
        }
    }

    Ok(())
}
