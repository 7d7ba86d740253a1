use std::path::PathBuf;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use relaygate::config::GatewayConfig;
use relaygate::server::{config_routes, AppState};
use relaygate::util::{cors_from_origins, init_tracing};

/// Quota-enforcing relay gateway for language-model APIs.
#[derive(Parser, Debug)]
#[command(name = "relaygate")]
#[command(version, about, long_about = None)]
struct Args {
    /// YAML configuration file; `${VAR}` placeholders are expanded
    #[arg(long, env = "RELAYGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8000
    #[arg(long)]
    bind: Option<String>,

    /// Credential store: memory | sled:<path> | sqlite:<url>
    #[arg(long)]
    credential_backend: Option<String>,

    /// Usage ledger: memory | jsonl:<path> | sqlite:<url>
    #[arg(long)]
    ledger_backend: Option<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(spec) = args.credential_backend {
        config.storage.credentials = spec;
    }
    if let Some(spec) = args.ledger_backend {
        config.storage.ledger = spec;
    }
    config.validate().context("invalid configuration")?;

    let state = web::Data::new(
        AppState::from_config(&config)
            .await
            .context("failed to initialise gateway")?,
    );

    let bind_addr = config.server.bind_addr.clone();
    let cors_origins = config.server.cors_origins.clone();
    let max_body = config.server.max_body_bytes;
    tracing::info!(
        bind = %bind_addr,
        upstream = %config.upstream.base_url,
        credentials = %config.storage.credentials,
        ledger = %config.storage.ledger,
        "starting relaygate"
    );

    let app_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .app_data(web::PayloadConfig::new(max_body))
            .wrap(cors_from_origins(&cors_origins))
            .configure(config_routes)
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {bind_addr}"))?
    .run()
    .await?;

    state.forwarder().shutdown();
    tracing::info!("relaygate stopped");
    Ok(())
}
