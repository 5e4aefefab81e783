use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "wagate", about = "wagate — multi-session messaging gateway", version)]
struct Cli {
    /// Gateway URL (default: http://localhost:3000 or $WAGATE_SERVER)
    #[arg(long, env = "WAGATE_SERVER", default_value = "http://localhost:3000")]
    server: String,

    /// API key for server auth ($WAGATE_TOKEN)
    #[arg(long, env = "WAGATE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway HTTP server
    Serve {
        /// Port to listen on (default: $WAGATE_PORT or 3000)
        #[arg(long, env = "WAGATE_PORT", default_value = "3000")]
        port: u16,
        /// Host to bind (default: $WAGATE_HOST or 0.0.0.0)
        #[arg(long, env = "WAGATE_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Manage sessions (admin key required for create/delete)
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Manage API keys (admin key required)
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Inspect capability apps
    Apps {
        #[command(subcommand)]
        action: AppAction,
    },
    /// Send a text message from a session
    Send {
        session: String,
        /// Recipient chat ID, e.g. 4917012345@c.us
        chat_id: String,
        text: String,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session and print its API key
    Create { name: String },
    List,
    /// Stop a session and revoke its keys
    Delete { name: String },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Issue a key bound to a session, or an admin key
    Issue {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        admin: bool,
    },
    List,
    /// Deactivate a key by ID
    Revoke { id: String },
}

#[derive(Subcommand)]
enum AppAction {
    /// Show the app catalog and which apps are active
    Available,
    /// List app instances of a session
    List { session: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WAGATE_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli.server, cli.token.clone());

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Sessions { action } => match action {
            SessionAction::Create { name } => {
                let json = api
                    .send(|c, base| c.post(format!("{base}/api/sessions")).json(&json!({"name": name})))
                    .await?;
                println!("✓ started {name}");
                println!("key: {}", json["key"].as_str().unwrap_or(""));
                Ok(())
            }
            SessionAction::List => {
                let json = api.send(|c, base| c.get(format!("{base}/api/sessions"))).await?;
                print_list(&json["sessions"], "(no sessions)", |s| {
                    s.as_str().unwrap_or("").to_owned()
                });
                Ok(())
            }
            SessionAction::Delete { name } => {
                let json = api
                    .send(|c, base| c.delete(format!("{base}/api/sessions/{name}")))
                    .await?;
                println!(
                    "✓ deleted {name} ({} key(s) revoked)",
                    json["keys_revoked"].as_u64().unwrap_or(0)
                );
                Ok(())
            }
        },

        Commands::Keys { action } => match action {
            KeyAction::Issue { session, admin } => {
                let body = json!({"session": session, "is_admin": admin});
                let json = api
                    .send(|c, base| c.post(format!("{base}/api/keys")).json(&body))
                    .await?;
                println!("id:  {}", json["id"].as_str().unwrap_or(""));
                println!("key: {}", json["key"].as_str().unwrap_or(""));
                Ok(())
            }
            KeyAction::List => {
                let json = api.send(|c, base| c.get(format!("{base}/api/keys"))).await?;
                print_list(&json["keys"], "(no keys)", |k| {
                    let scope = if k["is_admin"].as_bool().unwrap_or(false) {
                        "admin".to_owned()
                    } else {
                        format!("session {}", k["session"].as_str().unwrap_or("?"))
                    };
                    let state = if k["active"].as_bool().unwrap_or(false) {
                        "active"
                    } else {
                        "revoked"
                    };
                    format!("{} — {scope} — {state}", k["id"].as_str().unwrap_or(""))
                });
                Ok(())
            }
            KeyAction::Revoke { id } => {
                api.send(|c, base| c.delete(format!("{base}/api/keys/{id}")))
                    .await?;
                println!("✓ revoked {id}");
                Ok(())
            }
        },

        Commands::Apps { action } => match action {
            AppAction::Available => {
                let json = api.get_public("/api/apps/available").await?;
                print_list(&json["apps"], "(no apps)", |a| {
                    let state = if a["active"].as_bool().unwrap_or(false) {
                        "active"
                    } else {
                        "disabled"
                    };
                    format!("{} — {state}", a["name"].as_str().unwrap_or(""))
                });
                Ok(())
            }
            AppAction::List { session } => {
                let json = api
                    .send(|c, base| {
                        c.get(format!("{base}/api/apps")).query(&[("session", &session)])
                    })
                    .await?;
                print_list(&json["apps"], "(no app instances)", |a| {
                    let enabled = if a["enabled"].as_bool().unwrap_or(false) {
                        "enabled"
                    } else {
                        "paused"
                    };
                    format!(
                        "{} — {} — {enabled}",
                        a["id"].as_str().unwrap_or(""),
                        a["app"].as_str().unwrap_or("")
                    )
                });
                Ok(())
            }
        },

        Commands::Send {
            session,
            chat_id,
            text,
        } => {
            let json = api
                .send(|c, base| {
                    c.post(format!("{base}/api/{session}/send-text"))
                        .json(&json!({"chat_id": chat_id, "text": text}))
                })
                .await?;
            println!("✓ sent {}", json["id"].as_str().unwrap_or(""));
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = wagate_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    wagate_server::run(cfg).await
}

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base: server.trim_end_matches('/').to_owned(),
            token,
        }
    }

    /// Send an authenticated request and return the JSON body of a success.
    async fn send(&self, build: impl FnOnce(&Client, &str) -> RequestBuilder) -> Result<Value> {
        let token = require_token(&self.token)?;
        let resp = build(&self.client, &self.base)
            .bearer_auth(token)
            .send()
            .await
            .context("HTTP request failed")?;

        read_json(resp).await
    }

    /// Unauthenticated GET against a public route.
    async fn get_public(&self, path: &str) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .context("HTTP request failed")?;
        read_json(resp).await
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(json)
}

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("--token / WAGATE_TOKEN is required for this command")
}

fn print_list(items: &Value, empty: &str, line: impl Fn(&Value) -> String) {
    match items.as_array() {
        Some(items) if !items.is_empty() => {
            for item in items {
                println!("  {}", line(item));
            }
        }
        _ => println!("{empty}"),
    }
}
