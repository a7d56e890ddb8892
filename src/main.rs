//! BOSSFIGHT SERVER
//!
//! Runs one chat-driven boss fight per process:
//! - Chat ingestion (reconnecting websocket feed)
//! - Keyword interpretation into damage / heal
//! - Single-writer game orchestration with phase timers
//! - On-chain escrowed bets and proportional settlement
//! - Realtime fan-out to overlay subscribers

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod chat;
mod config;
mod events;
mod export;
mod hub;
mod interpreter;
mod ledger;
mod orchestrator;
mod server;
mod settlement;
mod state;

use chat::{ChatFeedEvent, ChatIngestor};
use config::Config;
use export::ResultExporter;
use hub::Hub;
use interpreter::Interpreter;
use ledger::LedgerClient;
use orchestrator::{GameConfig, Input, Orchestrator};
use state::GameState;

/// Wall-clock milliseconds since the unix epoch. Round ids and log
/// timestamps both come from here.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============== CLI ==============

#[derive(Parser)]
#[command(name = "bossfight-server")]
#[command(about = "Chat-driven boss fight with on-chain wagers")]
#[command(version)]
struct Cli {
    /// Override the PORT environment variable
    #[arg(short, long)]
    port: Option<u16>,
}

// ============== MAIN ==============

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let authority = cfg.load_keypair()?;
    let ledger = Arc::new(LedgerClient::new(
        &cfg.solana_rpc_url,
        cfg.program_id,
        authority,
        cfg.treasury_wallet,
    ));
    info!(
        authority = %ledger.authority_pubkey(),
        program = %cfg.program_id,
        rpc = %cfg.solana_rpc_url,
        "ledger identity loaded"
    );

    let published = Arc::new(ArcSwap::from_pointee(
        GameState::new(cfg.initial_hp).snapshot(false, now_ms()),
    ));
    let hub = Hub::new(published.clone());
    let interpreter = Interpreter::new(&cfg.trigger_keywords, &cfg.heal_keywords)
        .context("compiling keyword sets")?;
    let exporter = ResultExporter::new(cfg.export_dir.clone());

    let (input, orchestrator_task) = Orchestrator::spawn(
        GameConfig {
            coin: cfg.coin_address.clone(),
            initial_hp: cfg.initial_hp,
            betting_duration: cfg.betting_duration,
            fight_duration: cfg.fight_duration,
            fee_percentage: cfg.fee_percentage,
            admin_secret: cfg.admin_secret.clone(),
            admin_wallet: cfg.admin_wallet.clone(),
        },
        interpreter,
        ledger.clone(),
        hub.clone(),
        exporter,
        published.clone(),
    );

    // chat feed -> orchestrator queue
    let (chat_tx, mut chat_rx) = mpsc::channel(1024);
    let ingestor = ChatIngestor::new(cfg.chat_ws_url.clone(), cfg.coin_address.clone(), chat_tx);
    let chat_task = ingestor.start();
    let feed_input = input.clone();
    tokio::spawn(async move {
        while let Some(event) = chat_rx.recv().await {
            let mapped = match event {
                ChatFeedEvent::Message(m) => Input::Chat(m),
                ChatFeedEvent::Status { connected } => Input::ChatStatus { connected },
                ChatFeedEvent::Terminal => Input::ChatTerminal,
            };
            if feed_input.send(mapped).await.is_err() {
                break;
            }
        }
    });

    let app = server::router(server::AppState {
        hub,
        ledger,
        input: input.clone(),
        published,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, coin = %cfg.coin_address, "server listening");

    tokio::select! {
        res = axum::serve(listener, app).into_future() => res.context("http server")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    // graceful teardown: upstream connection first, then the orchestrator
    if let Some(task) = chat_task {
        task.abort();
    }
    let _ = input.send(Input::Shutdown).await;
    let _ = orchestrator_task.await;
    info!("server stopped");
    Ok(())
}
