//! Bridge-out validator node
//!
//! Watches the source chain for Bitcoin-bound unlocks and attests them on the
//! Ethereum bridge, either directly or through a signature collector. With
//! `COLLECTOR_ENABLED=true` the node also collects validator signatures and
//! submits them once the attestation threshold is met.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, WrapErr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bridge_out::bridge::{ChainView, EvmBridge, EvmChainView, EvmTransactionSender};
use bridge_out::collector::{BatchSubmitter, MemorySignatureStore, SignatureStore};
use bridge_out::config::Config;
use bridge_out::db;
use bridge_out::executor::{BatchAttestationOrchestrator, IndividualAttestationExecutor};
use bridge_out::finality::FinalityChecker;
use bridge_out::metrics::Metrics;
use bridge_out::processor::{BtcWithdrawal, SubmissionMode, SubmissionProcessor, Submitter};
use bridge_out::queue::WithdrawalQueue;
use bridge_out::relay::HttpSignatureRelay;
use bridge_out::scheduler::SubmissionScheduler;
use bridge_out::server::{self, AppState, CollectorState};
use bridge_out::validator::{AttestationValidator, BtcWithdrawalSettlement, SettlementCheck};
use bridge_out::watcher::{EvmUnlockSource, UnlockWatcher};

/// Finalized-height poll interval for both chains
const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(5);

const NOTIFY_CHANNEL_CAPACITY: usize = 1024;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // LOG_FORMAT may come from .env
    let _ = dotenvy::dotenv();
    init_logging();

    info!("Starting bridge-out validator");

    let config = Config::load()?;
    info!(
        chain_id = config.ethereum.chain_id,
        bridge = %config.ethereum.bridge_address,
        source_bridge = %config.source.bridge_address,
        mode = %config.submission.mode,
        collector = config.collector.enabled,
        "Configuration loaded"
    );

    let signer: PrivateKeySigner = config
        .ethereum
        .private_key
        .parse()
        .wrap_err("VALIDATOR_PRIVATE_KEY is not a valid private key")?;
    let address = signer.address();
    info!(validator = %address, "Validator key loaded");

    let metrics = Arc::new(Metrics::new());
    let queue = Arc::new(WithdrawalQueue::new(metrics.clone()));

    let bridge = Arc::new(EvmBridge::new(
        &config.ethereum.rpc_url,
        &config.ethereum.bridge_address,
    )?);
    let sender = Arc::new(EvmTransactionSender::new(
        &config.ethereum.rpc_url,
        &config.ethereum.bridge_address,
        config.ethereum.chain_id,
        signer.clone(),
    )?);
    let chain: Arc<dyn ChainView> = Arc::new(EvmChainView::new(
        &config.ethereum.rpc_url,
        config.ethereum.finality_blocks,
        BLOCK_POLL_INTERVAL,
    )?);

    let validator = Arc::new(AttestationValidator::new(bridge.clone(), address));
    let btc_wallet = config.withdrawal.wallet()?;
    let settlement: Arc<dyn SettlementCheck> = match btc_wallet {
        Some(_) => Arc::new(BtcWithdrawalSettlement::new(validator.clone())),
        None => validator.clone(),
    };
    let finality = Arc::new(FinalityChecker::new(
        queue.clone(),
        settlement,
        metrics.clone(),
    ));

    let submitter = match config.submission.mode {
        SubmissionMode::Individual => Submitter::Individual(IndividualAttestationExecutor::new(
            sender.clone(),
            config.submission.receipt_timeout(),
            config.submission.receipt_poll_interval(),
        )),
        SubmissionMode::Batch => {
            let collector_url = config
                .batch
                .collector_url
                .as_deref()
                .ok_or_else(|| eyre!("COLLECTOR_URL is required in batch mode"))?;
            Submitter::Batch(BatchAttestationOrchestrator::new(
                signer,
                config.ethereum.chain_id,
                Arc::new(HttpSignatureRelay::new(collector_url)?),
                bridge.clone(),
                config.batch.batch_config(),
            ))
        }
    };

    let mut processor = SubmissionProcessor::new(
        queue.clone(),
        validator,
        SubmissionScheduler::new(bridge.clone(), address, config.submission.step_delay()),
        submitter,
        finality.clone(),
        config.submission.retry_config(),
        metrics.clone(),
        config.submission.queue_poll_interval(),
    );
    if let Some(wallet) = btc_wallet {
        info!(
            wallet_pubkey_hash = %hex::encode(wallet.pubkey_hash),
            main_utxo = %wallet.main_utxo.tx_hash,
            "BTC withdrawal payouts enabled"
        );
        processor = processor.with_btc_withdrawal(BtcWithdrawal::new(
            wallet,
            IndividualAttestationExecutor::new(
                sender.clone(),
                config.submission.receipt_timeout(),
                config.submission.receipt_poll_interval(),
            ),
        ));
    }
    let processor = Arc::new(processor);

    let source = Arc::new(EvmUnlockSource::new(
        &config.source.rpc_url,
        &config.source.bridge_address,
        config.source.finality_blocks,
    )?);
    let watcher = UnlockWatcher::new(
        source,
        bridge.clone(),
        queue.clone(),
        metrics.clone(),
        config.source.start_block,
        BLOCK_POLL_INTERVAL,
    );

    let cancel = CancellationToken::new();
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let shutdown_requested = shutdown_requested.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_shutdown_signal() => {
                    shutdown_requested.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    let mut tasks = Vec::new();

    let collector_state = if config.collector.enabled {
        let store: Arc<dyn SignatureStore> = match config.collector.database_url.as_deref() {
            Some(url) => {
                let pool = db::create_pool(url).await?;
                info!("Database connected");
                db::run_migrations(&pool).await?;
                info!("Database migrations complete");
                Arc::new(db::PgSignatureStore::new(pool))
            }
            None => {
                info!("DATABASE_URL not set, collecting signatures in memory");
                Arc::new(MemorySignatureStore::new())
            }
        };

        let batch_submitter = Arc::new(BatchSubmitter::new(
            store.clone(),
            bridge.clone(),
            Arc::new(IndividualAttestationExecutor::new(
                sender.clone(),
                config.submission.receipt_timeout(),
                config.submission.receipt_poll_interval(),
            )),
            finality.clone(),
            config.submission.retry_config(),
            metrics.clone(),
        ));
        let (notify, notifications) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        tasks.push(tokio::spawn(
            batch_submitter.run(notifications, cancel.clone()),
        ));

        Some(CollectorState {
            store,
            bridge: bridge.clone(),
            chain_id: config.ethereum.chain_id,
            notify,
        })
    } else {
        None
    };

    let state = AppState {
        validator: address,
        queue: queue.clone(),
        finality: finality.clone(),
        metrics: metrics.clone(),
        collector: collector_state,
    };
    {
        let cancel = cancel.clone();
        let bind_address = config.api.bind_address.clone();
        let port = config.api.port;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::start_server(&bind_address, port, state, cancel.clone()).await {
                error!(error = %e, "HTTP server error");
                cancel.cancel();
            }
        }));
    }

    tasks.push(tokio::spawn(watcher.run(cancel.clone())));
    tasks.push(tokio::spawn(processor.run(cancel.clone())));
    {
        let finality = finality.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { finality.run(chain, cancel).await }));
    }

    info!("All tasks started");
    cancel.cancelled().await;

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task panicked");
        }
    }

    if !shutdown_requested.load(Ordering::SeqCst) {
        return Err(eyre!("bridge-out validator stopped after a fatal error"));
    }

    info!(
        pending = queue.len().await,
        tracked = finality.tracked_count().await,
        "Bridge-out validator stopped"
    );
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_out=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
