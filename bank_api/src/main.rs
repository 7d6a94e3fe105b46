use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use engine::clock::{Clock, SystemClock};
use engine::config::Config;
use engine::funding::FundingScheduler;
use engine::ledger::{BankLedger, FuturesLedger};
use engine::lightning::{LightningGateway, MockLightningGateway};
use engine::liquidation::LiquidationEngine;
use engine::matching::MatchingEngine;
use engine::nostr::sink::run_relay_publisher;
use engine::nostr::{feed, EventSink, RelayQueueSink, SchnorrSigner, Signer};
use engine::oracle::{KrakenFeed, PriceOracle};
use engine::view::Viewer;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

mod auth;
mod error;
mod routes_bank;
mod routes_futures;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(Config::from_env());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let bank = Arc::new(BankLedger::open(&config.bank_db_path, clock.clone())?);
    let futures = Arc::new(FuturesLedger::open(&config.futures_db_path, clock.clone())?);

    let signer: Arc<dyn Signer> = match &config.bank_private_key_hex {
        Some(secret) => Arc::new(SchnorrSigner::from_hex(secret)?),
        None => {
            warn!(target = "bank", "BANK_NOSTR_PRIVATE_KEY unset, generated an ephemeral key");
            Arc::new(SchnorrSigner::generate())
        }
    };
    info!(target = "bank", pubkey = %signer.pubkey(), "bank identity loaded");

    let (queue_sink, queue_rx) = RelayQueueSink::new(config.event_queue_capacity);
    let sink: Arc<dyn EventSink> = Arc::new(queue_sink);
    tokio::spawn(run_relay_publisher(queue_rx, config.nostr_relays.clone()));

    let oracle = Arc::new(PriceOracle::new(
        Arc::new(KrakenFeed::new(config.oracle_url.clone())),
        clock.clone(),
    ));
    let engine = Arc::new(MatchingEngine::new(
        futures.clone(),
        oracle.clone(),
        signer.clone(),
        sink.clone(),
        clock.clone(),
        config.markets(),
    ));
    let viewer = Arc::new(Viewer::new(
        futures.clone(),
        oracle.clone(),
        clock.clone(),
        config.markets(),
        config.funding_interval_seconds(),
    ));

    let funding = Arc::new(FundingScheduler::new(
        futures.clone(),
        oracle.clone(),
        signer.clone(),
        sink.clone(),
        clock.clone(),
        config.markets(),
        config.funding_interval_seconds(),
        engine.lock_handle(),
    ));
    tokio::spawn(funding.run());

    let liquidation = Arc::new(LiquidationEngine::new(
        futures.clone(),
        oracle.clone(),
        signer.clone(),
        sink.clone(),
        clock.clone(),
        config.markets(),
        config.liq_scan_interval_seconds,
        engine.lock_handle(),
    ));
    tokio::spawn(liquidation.run());

    // Publish market definitions once, then the signed oracle price on a
    // timer so clients can audit the feed.
    {
        let oracle = oracle.clone();
        let signer = signer.clone();
        let sink = sink.clone();
        let clock = clock.clone();
        let markets = config.markets();
        let interval = config.oracle_publish_interval_seconds;
        tokio::spawn(async move {
            for market in markets.values() {
                sink.publish(feed::market_definition_event(
                    signer.as_ref(),
                    clock.now(),
                    market,
                ));
            }
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                for symbol in markets.keys() {
                    let data = oracle.oracle_data(symbol).await;
                    if data.index_price_usd.is_some() {
                        sink.publish(feed::oracle_event(signer.as_ref(), &data));
                    }
                }
            }
        });
    }

    let mock_lightning = Arc::new(MockLightningGateway::new());
    let lightning: Arc<dyn LightningGateway> = mock_lightning.clone();

    let app_state = AppState {
        config: config.clone(),
        clock,
        bank,
        futures,
        engine,
        viewer,
        oracle,
        signer,
        sink,
        lightning,
        mock_lightning: Some(mock_lightning),
        challenges: Arc::new(Mutex::new(HashMap::new())),
        processed_events: Arc::new(Mutex::new(HashSet::new())),
        pending_deposits: Arc::new(Mutex::new(HashMap::new())),
    };

    let cors = {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(routes_bank::health))
        .route("/api/challenge", get(routes_bank::challenge))
        .route("/api/balance/:pubkey", get(routes_bank::balance))
        .route("/api/transactions/:pubkey", get(routes_bank::transactions))
        .route("/api/deposit/invoice", post(routes_bank::deposit_invoice))
        .route("/api/webhook/lightning", post(routes_bank::lightning_webhook))
        .route("/api/deposit/simulate", post(routes_bank::simulate_payment))
        .route("/api/withdraw", post(routes_bank::withdraw))
        .route("/api/transfer", post(routes_bank::transfer))
        .route("/api/savings/add", post(routes_bank::savings_add))
        .route("/api/savings/remove", post(routes_bank::savings_remove))
        .route("/api/futures/markets", get(routes_futures::markets))
        .route("/api/futures/market/:symbol", get(routes_futures::market_stats))
        .route("/api/futures/orderbook/:symbol", get(routes_futures::orderbook))
        .route("/api/futures/collateral/:pubkey", get(routes_futures::collateral))
        .route("/api/futures/orders/:pubkey", get(routes_futures::orders))
        .route("/api/futures/positions/:pubkey", get(routes_futures::positions))
        .route("/api/futures/trades/:symbol", get(routes_futures::trades))
        .route("/api/futures/fills/:pubkey", get(routes_futures::fills))
        .route("/api/futures/funding/:symbol", get(routes_futures::funding))
        .route("/api/futures/ohlcv/:symbol", get(routes_futures::ohlcv))
        .route(
            "/api/futures/collateral/deposit",
            post(routes_futures::deposit_collateral),
        )
        .route(
            "/api/futures/collateral/withdraw",
            post(routes_futures::withdraw_collateral),
        )
        .route("/api/futures/order", post(routes_futures::place_order))
        .route("/api/futures/order/:id", delete(routes_futures::cancel_order))
        .route("/api/futures/position/close", post(routes_futures::close_position))
        .with_state(app_state)
        .layer(cors);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(target = "bank", addr = %config.listen_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
