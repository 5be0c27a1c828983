//! Presurge Sentinel entrypoint: wires the Broker REST/Stream clients,
//! Feature Store/Pipeline, Subscription Planner, Inference Engine,
//! History Logger, the Scheduler's housekeeping jobs, and the health
//! server into one process, each long-running loop wrapped by the
//! supervisor and cancelled together on shutdown.
//!
//! Grounded on the teacher's `main.rs` entrypoint shape (`dotenv` load,
//! `tracing_subscriber` init, `tokio::spawn` per subsystem, a public
//! health router) generalized from the Polymarket arbitrage surface to
//! this crate's surveillance pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use parking_lot::Mutex as PLMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use presurge_sentinel::broker::registry::{Channel as WireChannel, Subscription, SubscriptionRegistry};
use presurge_sentinel::broker::rest::{BrokerRestClient, RestClientConfig};
use presurge_sentinel::broker::stream::{
    BrokerStreamClient, Frame, StreamClientConfig, TungsteniteTransport, WireTransport,
};
use presurge_sentinel::broker::auth::TokenManager;
use presurge_sentinel::error::BrokerError;
use presurge_sentinel::feature_pipeline::CalendarContext;
use presurge_sentinel::feature_store::FeatureStore;
use presurge_sentinel::health::{HealthProbe, HealthServer, HealthStatus};
use presurge_sentinel::history::{HistoricalRecord, HistoryLogger};
use presurge_sentinel::learning::{label_records, LabellerConfig, PricePoint, Trainer, TrainerConfig, TrainingSample};
use presurge_sentinel::models::ActiveArtifact;
use presurge_sentinel::resilience::{BackoffConfig, CircuitState};
use presurge_sentinel::scheduler::ScheduledJob;
use presurge_sentinel::shutdown::ShutdownController;
use presurge_sentinel::subscription::{PlannerConfig, RankedSymbol, SubscriptionPlanner};
use presurge_sentinel::supervisor::{supervise, SupervisorConfig};
use presurge_sentinel::Config;

#[derive(Parser, Debug)]
#[command(name = "sentinel", about = "Presurge equity surveillance core")]
struct Cli {
    /// Don't connect to any external broker; validate config and exit.
    #[arg(long)]
    dry_run: bool,

    /// Address the health/metrics server binds to.
    #[arg(long, default_value = "0.0.0.0:9090", env = "SENTINEL_HEALTH_ADDR")]
    health_addr: SocketAddr,
}

/// Mirrors on-disk history in memory so the Labeller/Trainer don't need
/// to re-parse the CSV partitions back into typed records; capped at the
/// configured retention window the same way the on-disk partitions are.
struct HistoryCache {
    records: PLMutex<Vec<HistoricalRecord>>,
}

impl HistoryCache {
    fn new() -> Self {
        Self { records: PLMutex::new(Vec::new()) }
    }

    fn push(&self, record: HistoricalRecord) {
        self.records.lock().push(record);
    }

    fn prune_before(&self, cutoff: chrono::DateTime<Utc>) {
        self.records.lock().retain(|r| r.timestamp >= cutoff);
    }

    fn snapshot(&self) -> Vec<HistoricalRecord> {
        self.records.lock().clone()
    }
}

struct ProcessHealth {
    stream: Arc<BrokerStreamClient>,
    artifact: Arc<ActiveArtifact>,
}

impl HealthProbe for ProcessHealth {
    fn status(&self) -> HealthStatus {
        match self.stream.circuit().state() {
            CircuitState::Open => HealthStatus::Unhealthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                if self.artifact.load().is_some() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    config.validate().map_err(|e| anyhow::anyhow!(e)).context("invalid configuration")?;
    info!(?config, "sentinel_starting");

    if cli.dry_run {
        info!("dry_run_config_valid_exiting");
        return Ok(());
    }

    let shutdown = Arc::new(ShutdownController::new(config.shutdown_grace));

    let auth = Arc::new(TokenManager::new(
        std::env::var("SENTINEL_BROKER_TOKEN_URL").unwrap_or_default(),
        std::env::var("SENTINEL_BROKER_API_KEY").unwrap_or_default(),
        std::env::var("SENTINEL_BROKER_API_SECRET").unwrap_or_default(),
        config.token_refresh_deadline,
    ));

    let rest_client = Arc::new(BrokerRestClient::new(
        RestClientConfig {
            base_url: std::env::var("SENTINEL_BROKER_REST_URL").unwrap_or_default(),
            quota_per_sec: 10,
            deadline: config.rest_deadline,
            max_retries: 5,
            backoff: BackoffConfig {
                base: config.backoff_base,
                cap: config.backoff_cap,
                jitter_factor: config.backoff_jitter,
                ..Default::default()
            },
        },
        auth.clone(),
    ));

    let registry = Arc::new(SubscriptionRegistry::new(config.subscription_cap));
    let stream_client = Arc::new(BrokerStreamClient::new(
        StreamClientConfig {
            url: std::env::var("SENTINEL_BROKER_STREAM_URL").unwrap_or_default(),
            event_channel_capacity: 4096,
            ack_timeout: config.stream_send_deadline,
            replay_pace: Duration::from_millis(20),
            circuit_threshold: config.circuit_breaker_threshold,
            circuit_cooldown: config.circuit_breaker_cooldown,
            backoff: BackoffConfig {
                base: config.backoff_base,
                cap: config.backoff_cap,
                jitter_factor: config.backoff_jitter,
                ..Default::default()
            },
        },
        registry.clone(),
    ));
    let transport: Arc<AsyncMutex<Option<TungsteniteTransport>>> = Arc::new(AsyncMutex::new(None));
    let mut event_rx = stream_client.event_stream();

    let feature_store = Arc::new(FeatureStore::new(config.universe_size * 2));
    let active_artifact = Arc::new(ActiveArtifact::new());
    let history_root = std::env::var("SENTINEL_HISTORY_DIR").unwrap_or_else(|_| "./data/history".to_string());
    let history_logger = Arc::new(HistoryLogger::new(&history_root, 8192, Duration::from_secs(10)));
    let history_cache = Arc::new(HistoryCache::new());

    let health = HealthServer::new(Arc::new(ProcessHealth {
        stream: stream_client.clone(),
        artifact: active_artifact.clone(),
    }))?;
    let health_shutdown = shutdown.subscribe();
    let health_addr = cli.health_addr;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health.serve(health_addr, health_shutdown).await {
            error!(error = %e, "health_server_failed");
        }
    });

    // Stream read loop: connects, replays the registry on reconnect, and
    // dispatches every incoming frame through the client's backpressure
    // policy. Supervised with backoff per spec §7's background-loop entry.
    let stream_loop_client = stream_client.clone();
    let stream_loop_transport = transport.clone();
    let stream_loop_shutdown = shutdown.subscribe();
    let stream_url = std::env::var("SENTINEL_BROKER_STREAM_URL").unwrap_or_default();
    let stream_handle = tokio::spawn(async move {
        supervise(
            "broker-stream",
            SupervisorConfig::default(),
            stream_loop_shutdown.clone(),
            move || {
                let client = stream_loop_client.clone();
                let transport = stream_loop_transport.clone();
                let url = stream_url.clone();
                let mut shutdown_rx = stream_loop_shutdown.clone();
                async move {
                    let mut conn = TungsteniteTransport::connect(&url).await?;
                    client.replay_registry(&mut conn).await?;
                    *transport.lock().await = Some(conn);

                    // The transport is shared with the planner's
                    // subscribe/unsubscribe calls: the lock is held only
                    // across each individual recv/send, never across the
                    // whole loop, so a subscribe request can interleave
                    // between incoming frames.
                    loop {
                        let next = {
                            let mut guard = transport.lock().await;
                            let conn = guard.as_mut().expect("transport set above, cleared only on reconnect");
                            tokio::select! {
                                r = conn.recv_text() => r,
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        *guard = None;
                                        return Ok(());
                                    }
                                    continue;
                                }
                            }
                        };
                        match next? {
                            Some(text) if !text.is_empty() => client.handle_incoming(&text),
                            Some(_) => {}
                            None => {
                                *transport.lock().await = None;
                                anyhow::bail!("stream closed by broker")
                            }
                        }
                    }
                }
            },
        )
        .await;
    });

    // Frame consumer: drains the client's dispatch channel into the
    // Feature Store.
    let fs_for_frames = feature_store.clone();
    let frame_handle = tokio::spawn(async move {
        while let Some(frame) = event_rx.recv().await {
            match frame {
                Frame::Trade(t) => fs_for_frames.apply_trade_frame(&t),
                Frame::Book(b) => fs_for_frames.apply_book_frame(&b),
            }
        }
    });

    // REST polling loop: universe-wide quote/book refresh at the
    // configured cadence, tightened to the degraded interval while the
    // stream's circuit is open.
    let rest_loop_client = rest_client.clone();
    let rest_loop_store = feature_store.clone();
    let rest_loop_stream = stream_client.clone();
    let rest_config = config.clone();
    let mut rest_shutdown = shutdown.subscribe();
    let rest_handle = tokio::spawn(async move {
        loop {
            let poll_interval = if matches!(rest_loop_stream.circuit().state(), CircuitState::Open) {
                rest_config.degraded_poll_interval
            } else {
                rest_config.rest_poll_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = rest_shutdown.changed() => {
                    if *rest_shutdown.borrow() { return; }
                }
            }

            let symbols = rest_loop_store.symbols();
            if symbols.is_empty() {
                continue;
            }
            match rest_loop_client.quote_batch(&symbols).await {
                Ok(quotes) => {
                    let now = Utc::now();
                    for q in quotes {
                        rest_loop_store.apply_rest_snapshot(&q, now);
                    }
                }
                Err(e) => warn!(error = %e, "rest_poll_failed"),
            }
        }
    });

    // Subscription planner: ranks by volume ratio, reconciles against the
    // registry, issues subscribe/unsubscribe over the live transport.
    let planner = SubscriptionPlanner::new(PlannerConfig {
        channels: vec![WireChannel::Trades, WireChannel::Book],
        reserved_slots: 1,
        unsub_settle_delay: config.planner_unsub_settle,
        retry_delay: Duration::from_millis(250),
    });
    let planner_store = feature_store.clone();
    let planner_registry = registry.clone();
    let planner_transport = transport.clone();
    let planner_ack_timeout = config.stream_send_deadline;
    let planner_staleness_bound = config.staleness_bound();
    let top_k = config.top_k_stream;
    let mut planner_shutdown = shutdown.subscribe();
    let planner_interval = config.planner_rotation_interval;
    let planner_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(planner_interval) => {}
                _ = planner_shutdown.changed() => {
                    if *planner_shutdown.borrow() { return; }
                }
            }

            let ranked: Vec<RankedSymbol> = planner_store
                .symbols()
                .into_iter()
                .filter_map(|s| {
                    planner_store.snapshot(&s).and_then(|state| {
                        let now = Utc::now();
                        let ctx = CalendarContext { now, staleness_bound: planner_staleness_bound };
                        let fv = presurge_sentinel::feature_pipeline::compute(&state, &ctx);
                        (!fv.volume_ratio.masked).then_some(RankedSymbol { symbol: s, volume_ratio: fv.volume_ratio.value })
                    })
                })
                .collect();

            let current: std::collections::BTreeSet<String> = planner_registry.symbols().into_iter().collect();
            let target = planner.select_top_k(ranked, &current, top_k * 2 /* channels_per_symbol */);
            let reconciliation = planner.reconcile(&target, &planner_registry);

            let ack_timeout = planner_ack_timeout;
            let transport = planner_transport.clone();
            planner
                .apply(reconciliation, move |sub: Subscription, subscribing: bool| {
                    let transport = transport.clone();
                    async move {
                        let mut guard = transport.lock().await;
                        let Some(conn) = guard.as_mut() else {
                            return Err(BrokerError::NotConnected("no live transport".to_string()));
                        };
                        if subscribing {
                            send_text_subscribe(conn, &sub, ack_timeout).await
                        } else {
                            send_text_unsubscribe(conn, &sub, ack_timeout).await
                        }
                    }
                })
                .await;
        }
    });

    // Inference cycle: scores every tracked ticker, logs detections and
    // feeds the History Logger for the daily retraining loop.
    let inference_store = feature_store.clone();
    let inference_artifact = active_artifact.clone();
    let inference_logger = history_logger.clone();
    let inference_cache = history_cache.clone();
    let mut inference_shutdown = shutdown.subscribe();
    let inference_cycle = config.inference_cycle_deadline;
    let inference_staleness_bound = config.staleness_bound();
    let inference_handle = tokio::spawn(async move {
        let engine = presurge_sentinel::inference::InferenceEngine::new(
            presurge_sentinel::inference::InferenceEngineConfig {
                cycle_deadline: inference_cycle,
                staleness_bound: inference_staleness_bound,
            },
            inference_artifact,
            inference_store.clone(),
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = inference_shutdown.changed() => {
                    if *inference_shutdown.borrow() { return; }
                }
            }

            let now = Utc::now();
            for detection in engine.run_cycle(now) {
                info!(
                    ticker = %detection.ticker,
                    probability = detection.probability,
                    threshold = detection.threshold,
                    "presurge_detection"
                );
                let record = HistoricalRecord {
                    timestamp: now,
                    ticker: detection.ticker.clone(),
                    feature_vector: detection.feature_vector.clone(),
                    price: inference_store.snapshot(&detection.ticker).and_then(|s| s.price).unwrap_or(0.0),
                };
                inference_logger.record(record.clone());
                inference_cache.push(record);
            }
        }
    });

    // History Logger flush loop.
    let flush_logger = history_logger.clone();
    let mut flush_shutdown = shutdown.subscribe();
    let flush_interval = history_logger.flush_interval();
    let flush_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(flush_interval) => {}
                _ = flush_shutdown.changed() => {
                    if *flush_shutdown.borrow() {
                        flush_logger.flush_on_shutdown();
                        return;
                    }
                }
            }
            if let Err(e) = flush_logger.flush() {
                warn!(error = %e, "history_logger_flush_failed");
            }
        }
    });

    // Scheduler: labelling, training, and retention pruning, each
    // single-flight and cron-like per spec §4.11.
    let retention_job = ScheduledJob::new("retention-prune", Duration::from_secs(24 * 3600));
    let retention_shutdown = shutdown.subscribe();
    let retention_root = history_root.clone();
    let retention_days = config.history_retention_days;
    let retention_cache = history_cache.clone();
    let retention_handle = tokio::spawn(async move {
        retention_job
            .run(retention_shutdown, || {
                let root = retention_root.clone();
                let cache = retention_cache.clone();
                async move {
                    let now = Utc::now();
                    let pruned = presurge_sentinel::history::prune_retention(
                        std::path::Path::new(&root),
                        retention_days,
                        now,
                    )?;
                    cache.prune_before(now - chrono::Duration::days(retention_days as i64));
                    info!(pruned, "retention_pruning_complete");
                    Ok(())
                }
            })
            .await;
    });

    let labelling_job = ScheduledJob::new("labelling", Duration::from_secs(3600));
    let labelling_shutdown = shutdown.subscribe();
    let labelling_cache = history_cache.clone();
    let labelling_theta = config.label_theta;
    let labelling_window = config.forward_window;
    let labelling_handle = tokio::spawn(async move {
        labelling_job
            .run(labelling_shutdown, || {
                let cache = labelling_cache.clone();
                async move {
                    let now = Utc::now();
                    let records = cache.snapshot();
                    let mut by_ticker: std::collections::HashMap<String, Vec<PricePoint>> = std::collections::HashMap::new();
                    for r in &records {
                        by_ticker.entry(r.ticker.clone()).or_default().push(PricePoint { timestamp: r.timestamp, price: r.price });
                    }
                    let config = LabellerConfig { lookahead: labelling_window, theta: labelling_theta };
                    let empty: Vec<PricePoint> = Vec::new();
                    let (labelled, deferred) = label_records(
                        &records,
                        |ticker| by_ticker.get(ticker).map(|v| v.as_slice()).unwrap_or(&empty),
                        &config,
                        now,
                    );
                    info!(labelled = labelled.len(), deferred = deferred.len(), "labelling_pass_complete");
                    Ok(())
                }
            })
            .await;
    });

    let training_job = ScheduledJob::new("training", Duration::from_secs(24 * 3600));
    let training_shutdown = shutdown.subscribe();
    let training_cache = history_cache.clone();
    let training_artifact = active_artifact.clone();
    let training_config = config.clone();
    let training_handle = tokio::spawn(async move {
        training_job
            .run(training_shutdown, || {
                let cache = training_cache.clone();
                let artifact = training_artifact.clone();
                let cfg = training_config.clone();
                async move {
                    let now = Utc::now();
                    let records = cache.snapshot();
                    let labeller_config = LabellerConfig { lookahead: cfg.forward_window, theta: cfg.label_theta };
                    let mut by_ticker: std::collections::HashMap<String, Vec<PricePoint>> = std::collections::HashMap::new();
                    for r in &records {
                        by_ticker.entry(r.ticker.clone()).or_default().push(PricePoint { timestamp: r.timestamp, price: r.price });
                    }
                    let empty: Vec<PricePoint> = Vec::new();
                    let (labelled, _deferred) = label_records(
                        &records,
                        |ticker| by_ticker.get(ticker).map(|v| v.as_slice()).unwrap_or(&empty),
                        &labeller_config,
                        now,
                    );

                    let by_ts: std::collections::HashMap<(String, i64), &HistoricalRecord> =
                        records.iter().map(|r| ((r.ticker.clone(), r.timestamp.timestamp()), r)).collect();
                    let samples: Vec<TrainingSample> = labelled
                        .iter()
                        .filter_map(|l| {
                            by_ts.get(&(l.ticker.clone(), l.timestamp.timestamp())).map(|r| TrainingSample {
                                features: r.feature_vector.as_ordered_values(),
                                label: l.label,
                                timestamp: l.timestamp,
                            })
                        })
                        .collect();

                    let trainer = Trainer::new(TrainerConfig {
                        lookback_days: cfg.training_window_days,
                        hyperparam_trials: cfg.training_trials_per_learner as usize,
                        threshold_strategy: cfg.threshold_strategy,
                        wall_clock_cap: cfg.trainer_wall_clock_cap,
                        ..Default::default()
                    });
                    let previous_version = artifact.load().map(|a| a.version).unwrap_or(0);
                    let prior_auc = artifact.load().map(|a| a.metadata.validation_auc);

                    match trainer.run(&samples, previous_version, prior_auc, now) {
                        Ok(outcome) => {
                            let drift = outcome.drift_alert;
                            trainer.publish(&artifact, outcome);
                            info!(drift_alert = drift, "training_run_published");
                        }
                        Err(e) => warn!(error = %e, "training_run_failed_prior_artifact_retained"),
                    }
                    Ok(())
                }
            })
            .await;
    });

    shutdown.wait_for_signal().await;
    shutdown
        .await_grace_period(async {
            let _ = tokio::join!(
                stream_handle,
                frame_handle,
                rest_handle,
                planner_handle,
                inference_handle,
                flush_handle,
                retention_handle,
                labelling_handle,
                training_handle,
                health_handle,
            );
        })
        .await;

    Ok(())
}

async fn send_text_subscribe(
    conn: &mut TungsteniteTransport,
    sub: &Subscription,
    timeout: Duration,
) -> Result<(), BrokerError> {
    #[derive(serde::Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Control<'a> {
        Subscribe { symbol: &'a str, channel: &'a str },
    }
    let channel = match sub.channel {
        WireChannel::Trades => "trades",
        WireChannel::Book => "book",
    };
    let text = serde_json::to_string(&Control::Subscribe { symbol: &sub.symbol, channel })
        .map_err(|e| BrokerError::Network(e.to_string()))?;
    tokio::time::timeout(timeout, conn.send_text(text)).await.map_err(|_| BrokerError::DeadlineExceeded(timeout))?
}

async fn send_text_unsubscribe(
    conn: &mut TungsteniteTransport,
    sub: &Subscription,
    timeout: Duration,
) -> Result<(), BrokerError> {
    #[derive(serde::Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Control<'a> {
        Unsubscribe { symbol: &'a str, channel: &'a str },
    }
    let channel = match sub.channel {
        WireChannel::Trades => "trades",
        WireChannel::Book => "book",
    };
    let text = serde_json::to_string(&Control::Unsubscribe { symbol: &sub.symbol, channel })
        .map_err(|e| BrokerError::Network(e.to_string()))?;
    tokio::time::timeout(timeout, conn.send_text(text)).await.map_err(|_| BrokerError::DeadlineExceeded(timeout))?
}
