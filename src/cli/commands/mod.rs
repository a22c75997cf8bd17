
use crate::aggregator::{
    AggregationEngine, AggregatorStats, BufferStore, CombineOptions, DeliveryDispatcher,
    DeliveryOutcome, DeliveryStatus, FlushPipeline, MemoryBufferStore, RecoverySweeper,
    RedisBufferStore, TimerCoordinator,
};
use crate::bus::{ChannelType, ConversationKey};
use crate::config::{Config, StoreBackend, StoreConfig, load_config, save_config};
use crate::delivery::{Delivery, WebhookDelivery};
use crate::gateway::GatewayState;
use crate::ingest::InboundProcessor;
use crate::media::OpenAiMediaResolver;
use crate::notify::{NoopNotifier, Notifier, SseHub};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Upper bound on waiting for queued deliveries during shutdown.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "chatcoalesce")]
#[command(about = "Chat message aggregation and debounce gateway")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to ~/.chatcoalesce/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook gateway
    Serve,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Validate configuration and probe the buffer store
    Check,
    /// Flush one conversation now and wait for its delivery
    Flush {
        #[arg(long, short = 'c')]
        channel: String,
        #[arg(long, short = 'u')]
        user: String,
    },
    /// Send a test payload to the delivery webhook
    TestWebhook,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve => serve(config_path).await?,
        Commands::Init { force } => init(config_path, force)?,
        Commands::Check => crate::cli::check::check_command(config_path).await?,
        Commands::Flush { channel, user } => flush(config_path, &channel, &user).await?,
        Commands::TestWebhook => test_webhook(config_path).await?,
    }

    Ok(())
}

fn init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => crate::config::get_config_path()?,
    };
    if path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
        return Ok(());
    }

    save_config(&Config::default(), Some(path.as_path()))?;
    println!("\u{2713} Created config at {}", path.display());
    println!("\nNext steps:");
    println!("  1. Set delivery.webhookUrl (or CHATCOALESCE_WEBHOOK_URL)");
    println!("  2. Point store.redisUrl at your Redis instance");
    println!("  3. chatcoalesce check && chatcoalesce serve");
    Ok(())
}

/// Every long-lived component of a running instance.
pub(crate) struct Services {
    pub hub: Option<Arc<SseHub>>,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub engine: Arc<AggregationEngine>,
    pub sweeper: Arc<RecoverySweeper>,
}

impl Services {
    /// Stop the sweeper, cancel pending timers (their fragments stay in the
    /// store), then drain the delivery queue.
    pub async fn shutdown(&self) {
        self.sweeper.stop().await;
        self.engine.shutdown().await;
        self.dispatcher.shutdown(DISPATCH_DRAIN_TIMEOUT).await;
    }
}

async fn setup_store(config: &StoreConfig) -> Result<Arc<dyn BufferStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisBufferStore::connect(&config.redis_url, config.key_prefix.clone())
                .await
                .context("failed to connect to Redis")?;
            info!("buffer store: redis");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("buffer store: memory, buffered fragments will not survive a restart");
            Ok(Arc::new(MemoryBufferStore::new()))
        }
    }
}

fn setup_metrics() -> Result<PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Wire store, delivery, notifier, dispatcher, pipeline, timers, engine and
/// sweeper. Must run inside a tokio runtime.
pub(crate) fn build_services(
    config: &Config,
    store: Arc<dyn BufferStore>,
    delivery: Arc<dyn Delivery>,
) -> Services {
    if !delivery.is_configured() {
        warn!("delivery webhook not configured, combined messages will fail delivery");
    }

    let stats = Arc::new(AggregatorStats::new());
    let hub = config
        .notifier
        .enabled
        .then(|| Arc::new(SseHub::new(config.notifier.buffer_size)));
    let notifier: Arc<dyn Notifier> = match &hub {
        Some(hub) => hub.clone(),
        None => Arc::new(NoopNotifier),
    };

    let dispatcher = Arc::new(DeliveryDispatcher::from_config(
        &config.delivery,
        delivery,
        notifier.clone(),
        stats.clone(),
    ));
    let pipeline = Arc::new(FlushPipeline::new(
        store.clone(),
        dispatcher.clone(),
        notifier,
        stats.clone(),
        CombineOptions::from_config(&config.aggregation),
    ));
    let timers = Arc::new(TimerCoordinator::new());
    let engine = Arc::new(AggregationEngine::new(
        &config.aggregation,
        store.clone(),
        timers.clone(),
        pipeline.clone(),
        stats,
    ));
    let sweeper = Arc::new(RecoverySweeper::new(&config.sweep, store, pipeline, timers));

    Services {
        hub,
        dispatcher,
        engine,
        sweeper,
    }
}

async fn serve(config_path: Option<&Path>) -> Result<()> {
    info!("Loading configuration...");
    let config = load_config(config_path)?;

    let metrics = if config.gateway.metrics {
        Some(setup_metrics()?)
    } else {
        None
    };

    let store = setup_store(&config.store).await?;
    let delivery = Arc::new(WebhookDelivery::new(&config.delivery));
    let services = build_services(&config, store, delivery.clone());

    if config.sweep.enabled {
        services.sweeper.start();
    } else {
        warn!("recovery sweep disabled, windows whose timer is lost will not be flushed");
    }

    let media = Arc::new(OpenAiMediaResolver::new(&config.media));
    let state = GatewayState {
        engine: services.engine.clone(),
        ingest: Arc::new(InboundProcessor::new(
            media,
            config.aggregation.max_message_length,
        )),
        sweeper: services.sweeper.clone(),
        hub: services.hub.clone(),
        whatsapp_phone_number_id: Arc::from(config.channels.whatsapp_phone_number_id.as_str()),
        keep_alive: Duration::from_secs(config.notifier.keep_alive_secs.max(1)),
        max_body_bytes: config.gateway.max_body_bytes,
        delivery_configured: delivery.is_configured(),
        media_configured: config.media.is_configured(),
        metrics,
    };

    println!(
        "chatcoalesce {} listening on {}:{} (window {}s)",
        crate::VERSION,
        config.gateway.host,
        config.gateway.port,
        config.aggregation.window_secs
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        println!("\nShutting down...");
    };
    let result = crate::gateway::serve(
        &config.gateway.host,
        config.gateway.port,
        state,
        shutdown,
    )
    .await;

    services.shutdown().await;
    result
}

/// Wait for the outcome of the delivery for `key`, skipping other conversations.
async fn await_outcome(
    outcomes: &mut broadcast::Receiver<DeliveryOutcome>,
    key: &ConversationKey,
) -> Option<DeliveryOutcome> {
    loop {
        match outcomes.recv().await {
            Ok(outcome) if &outcome.key == key => return Some(outcome),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Deadline for one delivery including every retry and backoff.
fn delivery_deadline(config: &Config) -> Duration {
    let delivery = &config.delivery;
    let per_attempt = delivery.timeout_secs.saturating_add(1);
    let attempts = u64::from(delivery.max_attempts);
    let backoff_ms = delivery.max_delay_ms.saturating_mul(attempts);
    Duration::from_secs(per_attempt.saturating_mul(attempts)) + Duration::from_millis(backoff_ms)
}

async fn flush(config_path: Option<&Path>, channel: &str, user: &str) -> Result<()> {
    let channel = ChannelType::from_str(channel).map_err(anyhow::Error::msg)?;
    let key = ConversationKey::new(channel, user);
    let config = load_config(config_path)?;

    let store = setup_store(&config.store).await?;
    let delivery = Arc::new(WebhookDelivery::new(&config.delivery));
    let services = build_services(&config, store, delivery);
    let mut outcomes = services.dispatcher.subscribe();

    let result = match services.engine.flush_now(&key).await {
        Ok(None) => {
            println!("Nothing buffered for {}", key);
            Ok(())
        }
        Ok(Some(message)) => {
            println!(
                "Flushed {} fragment(s) for {}: {:?}",
                message.fragment_count, key, message.text
            );
            match tokio::time::timeout(delivery_deadline(&config), await_outcome(&mut outcomes, &key))
                .await
            {
                Ok(Some(outcome)) => match outcome.status {
                    DeliveryStatus::Delivered { .. } => {
                        println!("\u{2713} Delivered after {} attempt(s)", outcome.attempts);
                        Ok(())
                    }
                    DeliveryStatus::Failed { error, .. } => Err(anyhow::anyhow!(
                        "delivery failed after {} attempt(s): {}",
                        outcome.attempts,
                        error
                    )),
                },
                Ok(None) => Err(anyhow::anyhow!("dispatcher stopped before delivery")),
                Err(_) => Err(anyhow::anyhow!("timed out waiting for delivery")),
            }
        }
        Err(e) => Err(e.into()),
    };

    services.shutdown().await;
    result
}

async fn test_webhook(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let delivery = WebhookDelivery::new(&config.delivery);
    if !delivery.is_configured() {
        bail!("delivery.webhookUrl is not configured");
    }

    println!("Sending test payload to {}...", config.delivery.webhook_url);
    match delivery.test_webhook().await {
        Ok(ack) => {
            println!("\u{2713} Webhook answered {}", ack.status);
            if let Some(reply) = ack.reply {
                println!("  reply: {}", reply);
            }
            Ok(())
        }
        Err(e) => bail!("webhook test failed: {}", e),
    }
}
