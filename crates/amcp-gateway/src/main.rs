//! Amcp Gateway — the server surface (§4.K). No built-in UI ships here by
//! design (§1 Non-goals): this binary only ever starts the HTTP/WS/SSE
//! listener described in §6; a client (CLI, IDE, browser) talks to it over
//! the wire.

use amcp_core::{AuthConfig, AuthMode, BindMode};
use amcp_gateway::{start_gateway, ExtendedConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "amcp-gateway", about = "Amcp coding-assistant runtime — server surface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket/SSE gateway
    Gateway {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        bind: Option<String>,
        #[arg(short, long)]
        token: Option<String>,
        #[arg(long)]
        no_auth: bool,
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Show version
    Version,
}

async fn run_gateway(
    port: Option<u16>,
    bind: Option<String>,
    token: Option<String>,
    no_auth: bool,
    workspace: Option<PathBuf>,
    system_prompt: Option<String>,
) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amcp=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let workspace_root = workspace
        .or_else(|| std::env::var("AMCP_WORKSPACE").ok().map(PathBuf::from))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let root_config = amcp_core::RootConfig::discover(&workspace_root);
    let mut gateway = root_config.server.into_gateway_config();

    if let Some(p) = port {
        gateway.port = p;
    }
    if let Some(b) = bind.as_deref() {
        gateway.bind = match b {
            "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        };
    }
    gateway.auth = if no_auth {
        AuthConfig { mode: AuthMode::None, token: None }
    } else {
        AuthConfig { mode: AuthMode::Token, token: token.or(gateway.auth.token) }
    };

    let config = ExtendedConfig {
        gateway,
        anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        workspace_root,
        system_prompt: system_prompt
            .or(root_config.chat.system_prompt_path.and_then(|p| std::fs::read_to_string(p).ok())),
    };
    start_gateway(config).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Gateway { port, bind, token, no_auth, workspace, system_prompt }) => {
            run_gateway(port, bind, token, no_auth, workspace, system_prompt).await?;
        }
        Some(Commands::Version) => {
            println!("amcp v{}", env!("CARGO_PKG_VERSION"));
        }
        // No subcommand = start the gateway with defaults.
        None => {
            run_gateway(None, None, None, false, None, None).await?;
        }
    }

    Ok(())
}
