//! # State Sync Daemon
//!
//! Headless runner for the chain state cache: follows new blocks on one chain, keeps
//! the balances of the given accounts and every tracked pair fresh, and persists
//! state to disk.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin state_syncd -- --account 0xabc... --account 0xdef...
//! ```
//!
//! Press Ctrl+C to stop gracefully; pending documents are flushed before exit.

use anyhow::{Context, Result};
use clap::Parser;
use ethers::prelude::{Address, Http, Provider};
use log::{info, warn};
use mig_chain_state_cache::{
    block_stream::BlockStream,
    chain_state_cache::{format_units, ChainStateCache, NATIVE_DECIMALS},
    fetcher::ProviderFetcher,
    persistence::FileStorage,
    resource_id_cache::Create2PairDeriver,
    settings::Settings,
    types::{conversions::string_to_address, EntityId, ResourceId},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "state_syncd", about = "Block-driven balance and reserve cache")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Account whose balances are kept fresh (repeatable)
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// Chain id override
    #[arg(long)]
    scope: Option<u64>,
}

fn init_logging() {
    #[cfg(feature = "observability")]
    {
        tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
        if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
            eprintln!("Prometheus exporter not installed: {}", e);
        }
        mig_chain_state_cache::metrics::describe_metrics();
    }
    #[cfg(not(feature = "observability"))]
    env_logger::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let args = Args::parse();

    println!("🚀 Starting State Sync Daemon");

    // 1. Settings
    let mut settings = Settings::from_file(&args.config).context("loading settings")?;
    if let Some(scope) = args.scope {
        settings.chain.scope = scope;
    }
    let scope = settings.chain.scope;
    let accounts: Vec<Address> = args
        .accounts
        .iter()
        .map(|raw| string_to_address(raw))
        .collect::<Result<_, _>>()
        .context("parsing --account")?;
    println!("✅ Settings loaded (scope {}, {} account(s))", scope, accounts.len());

    // 2. Cache, rehydrated from disk
    let mut deriver = Create2PairDeriver::new();
    match settings.pair_factory()? {
        Some(factory) => deriver = deriver.with_factory(scope, factory),
        None => warn!("No pair factory configured for scope {}; pair reserves are not tracked", scope),
    }
    let storage = Arc::new(FileStorage::new(&settings.persistence.directory));
    let persistence_config = settings.persistence_config();
    let cache = Arc::new(ChainStateCache::rehydrate(
        Arc::new(deriver),
        settings.entity_registry()?,
        settings.staleness_policy(),
        storage.as_ref(),
        &persistence_config,
    ));
    for account in &accounts {
        cache.track_account(scope, *account);
    }
    println!("✅ Cache ready ({} slot(s) restored)", cache.store().snapshot().len());

    // 3. Provider and fetcher
    let provider = Arc::new(
        Provider::<Http>::try_from(settings.rpc.http_url.as_str())
            .with_context(|| format!("invalid RPC url {}", settings.rpc.http_url))?,
    );
    let fetcher = Arc::new(ProviderFetcher::new(provider.clone(), scope, settings.fetcher_config()?)?);

    // 4. Block stream
    let blocks = BlockStream::new(64);
    let synchronizer = Arc::new(cache.synchronizer(scope, fetcher));
    let sync_task = synchronizer.spawn(blocks.subscribe());
    let head_task = match settings.rpc.ws_url.clone() {
        Some(ws_url) => {
            println!("✅ Following new heads over WebSocket");
            blocks.spawn_ws_listener(ws_url, scope)
        }
        None => {
            println!("✅ Polling block number every {} ms", settings.rpc.block_poll_interval_ms);
            blocks.spawn_poller(provider, scope, Duration::from_millis(settings.rpc.block_poll_interval_ms))
        }
    };

    // 5. Persistence
    let persistence = Arc::new(cache.persistence_bridge(storage, persistence_config)).start();
    println!("✅ Persistence started ({})", settings.persistence.directory);

    // 6. Report account balance changes
    let reporter = {
        let cache = cache.clone();
        let native_symbol = settings.chain.native_symbol.clone();
        let mut versions = cache.store().subscribe();
        tokio::spawn(async move {
            let mut last: HashMap<(Address, ResourceId), ethers::types::U256> = HashMap::new();
            let mut last_price = None;
            while versions.changed().await.is_ok() {
                if let Some(price) = cache.native_price_usd(scope).filter(|p| Some(*p) != last_price) {
                    info!("📈 {} = ${}", native_symbol, price.round_dp(2));
                    last_price = Some(price);
                }
                for account in &accounts {
                    for (resource, value) in cache.get_all(scope, *account) {
                        let Some(value) = value else { continue };
                        if last.insert((*account, resource), value) == Some(value) {
                            continue;
                        }
                        let (symbol, decimals) = match resource {
                            ResourceId::Native => (native_symbol.clone(), NATIVE_DECIMALS),
                            ResourceId::Token(token) => match cache.user_store().entity(EntityId::new(scope, token)) {
                                Some(entity) => (
                                    entity.symbol.unwrap_or_else(|| format!("{:?}", token)),
                                    entity.decimals,
                                ),
                                None => continue,
                            },
                        };
                        match format_units(value, decimals) {
                            Ok(amount) => info!("💰 {:?}: {} {}", account, amount, symbol),
                            Err(e) => warn!("Cannot format {} balance of {:?}: {}", symbol, account, e),
                        }
                    }
                }
            }
        })
    };

    println!("\n✅ Running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    println!("\n🛑 Shutdown signal received, stopping tasks...");

    head_task.abort();
    sync_task.abort();
    reporter.abort();
    persistence.shutdown().await;

    println!("✅ State saved, bye");
    Ok(())
}
