//! Bridge gateway CLI entry point.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge_gateway::cli::{Cli, Commands, TokenCommand};
use bridge_gateway::config::Config;
use bridge_gateway::dispatcher::Dispatcher;
use bridge_gateway::server::{build_router, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;
    init_tracing(&config.log_level);

    match cli.command.unwrap_or(Commands::Serve { port: None, host: None }) {
        Commands::Serve { port, host } => serve(config, port, host).await,
        Commands::HealthCheck { url } => health_check(&url).await,
        Commands::Token { command } => token_command(&config, command),
    }
}

async fn serve(mut config: Config, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    config.validate()?;

    let addr = config.bind_addr()?;
    let dispatcher = Dispatcher::new();
    let state = AppState::new(config, dispatcher);
    let router = build_router(state);

    tracing::info!(%addr, "bridge gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_check(url: &str) -> Result<()> {
    let endpoint = format!("{}/health", url.trim_end_matches('/'));
    let response = reqwest::get(&endpoint).await?;
    let body: serde_json::Value = response.json().await?;
    if body.get("status").and_then(|v| v.as_str()) == Some("ok") {
        println!("{endpoint}: ok");
        Ok(())
    } else {
        anyhow::bail!("{endpoint}: unhealthy response: {body}");
    }
}

fn token_command(config: &Config, command: TokenCommand) -> Result<()> {
    let service = bridge_gateway::auth::TokenService::new(config.jwt_secret.clone(), config.jwt_expires_in());
    match command {
        TokenCommand::Issue { username } => {
            let token = service.issue(&username)?;
            println!("{token}");
        }
        TokenCommand::Verify { token } => {
            let claims = service.verify(&token)?;
            println!("valid, sub={}", claims.sub);
        }
    }
    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
