//! Polymarket execution and redemption engine entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use alloy::primitives::U256;
use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use polymarket_redeemer::api::{create_router, AppState};
use polymarket_redeemer::chain::{ChainClient, RpcChainClient, SafeNonceSource};
use polymarket_redeemer::config::Config;
use polymarket_redeemer::engine::{redeem_position, Engine};
use polymarket_redeemer::market::ClobClient;
use polymarket_redeemer::metrics;
use polymarket_redeemer::notify;
use polymarket_redeemer::redemption::{RedemptionManager, RedemptionSettings, RedemptionStrategy};
use polymarket_redeemer::relay::RelayClient;
use polymarket_redeemer::signing::{address_from_private_key, SigningAuthority};
use polymarket_redeemer::store::Store;
use polymarket_redeemer::trading::{
    BasicValidator, Direction, ExecutorSettings, OrderExecutor, PositionStatus, PositionTracker,
    RiskCheck, RiskLimits,
};
use polymarket_redeemer::utils::{engine_running, shutdown_signal};

/// Polymarket execution and redemption engine.
#[derive(Parser, Debug)]
#[command(name = "polymarket-redeemer")]
#[command(about = "Order execution and escalating redemption for Polymarket positions")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine and HTTP API (default).
    Run {
        /// HTTP server port; overrides PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Print tracked positions from the state directory.
    Status,

    /// Redeem one position now. Refused while the engine is running.
    Redeem {
        /// Market condition id (0x + 64 hex).
        condition_id: String,

        /// Settle an OPEN position with this winner first.
        #[arg(long)]
        winner: Option<Direction>,

        /// Port a running engine would listen on; overrides PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Acknowledge a failed redemption so it can be archived.
    Ack {
        /// Market condition id.
        condition_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load().context("failed to load configuration")?;

    init_logging(&config, args.verbose || config.verbose);
    info!(config = ?config, "Configuration loaded");

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(&config),
        Some(Command::Status) => cmd_status(&config),
        Some(Command::Redeem {
            condition_id,
            winner,
            port,
        }) => cmd_redeem(&config, &condition_id, winner, port).await,
        Some(Command::Ack { condition_id }) => cmd_ack(&config, &condition_id),
        Some(Command::Run { port }) => cmd_run(config, port).await,
        None => cmd_run(config, None).await,
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("polymarket_redeemer=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.rust_log))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Check configuration validity.
fn cmd_check_config(config: &Config) -> anyhow::Result<()> {
    println!("======================================================================");
    println!("POLYMARKET REDEEMER - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    print!("Checking private key... ");
    match address_from_private_key(&config.polymarket_private_key) {
        Ok(addr) => {
            println!("OK");
            println!("  Signer address: {}", addr);
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Private key invalid"));
        }
    }

    let relays = config.relay_urls()?;
    let safe = config.safe_address()?;
    let plan = RedemptionStrategy::plan(&relays, safe.is_some());

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!(
        "  Signature Type: {} ({})",
        config.polymarket_signature_type,
        match config.polymarket_signature_type {
            0 => "EOA - Standard wallet",
            1 => "Magic.link - Proxy wallet",
            2 => "Gnosis Safe - Multi-sig",
            _ => "Unknown",
        }
    );
    match safe {
        Some(safe) => println!("  Safe: {}", safe),
        None => println!("  Safe: none (relay tiers disabled)"),
    }
    println!(
        "  Redemption Tiers: {}",
        plan.iter()
            .map(|s| s.method().to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!("  RPC Endpoints: {}", config.rpc_url_list()?.len());
    println!("  Builder Credentials: {}", config.builder_credentials().is_some());
    println!("  CLOB Credentials: {}", config.clob_credentials().is_some());
    println!(
        "  Telegram: {}",
        config.telegram_bot_token.is_some() && config.telegram_chat_id.is_some()
    );
    println!("  State Dir: {}", config.state_dir);
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Print positions from disk.
fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.state_dir)?);
    let notifier = Arc::new(notify::LogNotifier::new(&config.notify_prefix));
    let tracker = PositionTracker::recover(store, notifier, config.market_url_base.clone())?;

    let positions = tracker.positions();
    println!("{} position(s)", positions.len());
    for p in positions {
        let last = p
            .redemption_attempts
            .last()
            .map(|a| format!("{} {}", a.method, a.outcome))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<17} {:<4} size={} entry={} attempts={} last={}{}",
            p.condition_id,
            p.status.to_string(),
            p.direction.to_string(),
            p.size,
            p.entry_price,
            p.redemption_attempts.len(),
            last,
            if p.acknowledged { " (acknowledged)" } else { "" }
        );
    }
    Ok(())
}

/// Acknowledge a REDEMPTION_FAILED position.
fn cmd_ack(config: &Config, condition_id: &str) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.state_dir)?);
    let notifier = Arc::new(notify::LogNotifier::new(&config.notify_prefix));
    let tracker = PositionTracker::recover(store, notifier, config.market_url_base.clone())?;
    let position = tracker.acknowledge(condition_id)?;
    println!("{} acknowledged ({})", position.condition_id, position.status);
    Ok(())
}

struct Redemption {
    store: Arc<Store>,
    tracker: Arc<PositionTracker>,
    manager: Arc<RedemptionManager>,
}

/// Wire store, tracker and the redemption stack from config.
fn build_redemption(
    config: &Config,
    risk: Option<Arc<dyn RiskCheck>>,
) -> anyhow::Result<Redemption> {
    let store = Arc::new(Store::open(&config.state_dir)?);
    let notifier = notify::from_config(config)?;
    let mut tracker =
        PositionTracker::recover(store.clone(), notifier, config.market_url_base.clone())?;
    if let Some(risk) = risk {
        tracker = tracker.with_risk(risk);
    }
    let tracker = Arc::new(tracker);

    let signer = polymarket_redeemer::signing::create_signer(&config.polymarket_private_key)?;
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(
        config.rpc_url_list()?,
        alloy::network::EthereumWallet::from(signer),
        config.gas_limit,
        config.chain_id,
        config.chain_poll_interval(),
    )?);

    let safe = config.safe_address()?;
    let nonce_source = Arc::new(SafeNonceSource::new(chain.clone(), safe));
    let authority = Arc::new(SigningAuthority::new(
        &config.polymarket_private_key,
        safe,
        config.chain_id,
        nonce_source,
    )?);
    let relay = Arc::new(RelayClient::new(
        config.relay_connect_timeout(),
        config.relay_request_timeout(),
        config.builder_credentials(),
    )?);

    let strategies = RedemptionStrategy::plan(&config.relay_urls()?, safe.is_some());
    info!(
        signer = %authority.address(),
        safe = ?safe,
        tiers = ?strategies.iter().map(|s| s.method().to_string()).collect::<Vec<_>>(),
        "Redemption configured"
    );
    if config.min_gas_balance_wei() == U256::ZERO {
        warn!("MIN_GAS_BALANCE is zero, the direct tier never reports insufficient funds");
    }

    let manager = Arc::new(RedemptionManager::new(
        strategies,
        authority,
        relay,
        chain,
        tracker.clone(),
        RedemptionSettings::from_config(config)?,
    ));

    Ok(Redemption {
        store,
        tracker,
        manager,
    })
}

/// Operator-initiated redemption of one position.
async fn cmd_redeem(
    config: &Config,
    condition_id: &str,
    winner: Option<Direction>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    // A second signing gate for the same identity could hand out a nonce
    // the engine already holds.
    let port = port.unwrap_or(config.port);
    if engine_running(port).await {
        anyhow::bail!(
            "an engine is running on port {}; use POST /api/v1/positions/{}/retry instead",
            port,
            condition_id
        );
    }
    let wiring = build_redemption(config, None)?;

    if let Some(winner) = winner {
        if wiring.tracker.on_market_settled(condition_id, winner)?.is_some() {
            info!(condition_id, winner = %winner, "Position settled");
        }
    }
    if let Some(p) = wiring.tracker.get(condition_id) {
        if p.status == PositionStatus::RedemptionFailed {
            wiring.tracker.retry_failed(condition_id)?;
        }
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let position = redeem_position(&wiring.tracker, &wiring.manager, condition_id, &cancel).await?;
    println!("{} is {}", position.condition_id, position.status);
    for attempt in &position.redemption_attempts {
        println!(
            "  {} {:<10} {:<18} {}",
            attempt.started_at.format("%Y-%m-%d %H:%M:%S"),
            attempt.method.to_string(),
            attempt.outcome.to_string(),
            attempt.tx_reference.as_deref().unwrap_or(&attempt.detail)
        );
    }
    Ok(())
}

/// Run the engine and HTTP API until a shutdown signal.
async fn cmd_run(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    metrics::init_metrics();

    let risk: Arc<dyn RiskCheck> = Arc::new(RiskLimits::new(
        config.max_order_notional,
        config.daily_max_loss,
    ));
    let wiring = build_redemption(&config, Some(risk.clone()))?;

    let (order_tx, order_rx) = mpsc::channel(256);
    let executor = Arc::new(OrderExecutor::new(
        Arc::new(ClobClient::new(&config)?),
        Arc::new(BasicValidator::new(config.min_order_size)),
        risk,
        order_tx,
        ExecutorSettings::from_config(&config),
    ));
    let open_orders = wiring.store.load_orders()?;
    if !open_orders.is_empty() {
        info!(count = open_orders.len(), "Restoring open orders");
    }
    executor.restore(open_orders);

    let (engine, handle) = Engine::new(
        wiring.tracker.clone(),
        wiring.manager.clone(),
        executor,
        wiring.store.clone(),
        order_rx,
        config.control_interval(),
    );
    let engine_task = tokio::spawn(engine.run());

    let app_state = AppState::new(wiring.tracker.clone(), handle.clone(), Some(prometheus));
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.port)));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let router = create_router(app_state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    app_state.set_ready(true);
    info!("========================================");
    info!("REDEMPTION ENGINE STARTED");
    info!("========================================");

    shutdown_signal().await;
    app_state.set_ready(false);
    handle.shutdown();
    shutdown.cancel();

    match engine_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Engine stopped with error"),
        Err(e) => error!(error = %e, "Engine task failed"),
    }
    if let Ok(Err(e)) = server.await {
        error!(error = %e, "HTTP server error");
    }

    info!("Shutdown complete");
    Ok(())
}
