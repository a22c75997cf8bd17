use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::errors::CoalesceError;

/// Generates a `Debug` impl that redacts secret fields.
///
/// Field specifiers:
/// - `field_name`            : printed normally via `&self.field_name`
/// - `redact(field_name)`    : `String` field: shows `[empty]` or `[REDACTED]`
macro_rules! redact_debug {
    (@field $builder:ident, $self:ident, redact($field:ident)) => {
        $builder.field(
            stringify!($field),
            &if $self.$field.is_empty() {
                "[empty]"
            } else {
                "[REDACTED]"
            },
        );
    };
    (@field $builder:ident, $self:ident, $field:ident) => {
        $builder.field(stringify!($field), &$self.$field);
    };

    (@fields $builder:ident, $self:ident,) => {};
    (@fields $builder:ident, $self:ident, redact($field:ident), $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, redact($field));
        redact_debug!(@fields $builder, $self, $($rest)*);
    };
    (@fields $builder:ident, $self:ident, $field:ident, $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, $field);
        redact_debug!(@fields $builder, $self, $($rest)*);
    };

    ($struct_name:ident, $($fields:tt)*) => {
        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut builder = f.debug_struct(stringify!($struct_name));
                redact_debug!(@fields builder, self, $($fields)*);
                builder.finish()
            }
        }
    };
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Aggregation window
// ---------------------------------------------------------------------------

fn default_window_secs() -> u64 {
    20
}

fn default_marker_ttl_secs() -> u64 {
    25
}

fn default_max_buffer_size() -> usize {
    100
}

fn default_max_message_length() -> usize {
    10_000
}

fn default_separator() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    /// Quiet period measured from the first fragment of a window.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Marker expiry; must outlive the window so orphaned markers self-heal.
    #[serde(default = "default_marker_ttl_secs")]
    pub marker_ttl_secs: u64,
    /// Fragments held per conversation before a flush is forced.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Character limit for a single fragment and for the combined text.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Prefix transcripts and image text with a provenance tag.
    #[serde(default = "default_true")]
    pub annotate_media: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            marker_ttl_secs: default_marker_ttl_secs(),
            max_buffer_size: default_max_buffer_size(),
            max_message_length: default_max_message_length(),
            separator: default_separator(),
            annotate_media: true,
        }
    }
}

impl AggregationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Buffer store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prepended to every key, e.g. `"staging:"`.
    #[serde(default)]
    pub key_prefix: String,
}

redact_debug!(StoreConfig, backend, redact(redis_url), key_prefix,);

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

fn default_delivery_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_max_concurrent() -> usize {
    8
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Downstream automation endpoint receiving `{user_id, channel, text}`.
    #[serde(default)]
    pub webhook_url: String,
    /// Per-attempt request timeout.
    #[serde(default = "default_delivery_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per combined message, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

redact_debug!(
    DeliveryConfig,
    redact(webhook_url),
    timeout_secs,
    max_attempts,
    initial_delay_ms,
    max_delay_ms,
    backoff_multiplier,
    queue_capacity,
    max_concurrent,
);

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            timeout_secs: default_delivery_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            queue_capacity: default_queue_capacity(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery sweep
// ---------------------------------------------------------------------------

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_sweep_grace_secs() -> u64 {
    10
}

fn default_sweep_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// How long past its deadline a window may sit before a sweeper claims it.
    #[serde(default = "default_sweep_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            grace_secs: default_sweep_grace_secs(),
            batch_size: default_sweep_batch_size(),
        }
    }
}

// ---------------------------------------------------------------------------
// Real-time notifier
// ---------------------------------------------------------------------------

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_notifier_buffer() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Events queued per connection before new ones are dropped.
    #[serde(default = "default_notifier_buffer")]
    pub buffer_size: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_alive_secs: default_keep_alive_secs(),
            buffer_size: default_notifier_buffer(),
        }
    }
}

// ---------------------------------------------------------------------------
// Media (transcription + image text)
// ---------------------------------------------------------------------------

fn default_media_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_media_timeout_secs() -> u64 {
    60
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_media_api_base")]
    pub api_base: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Optional vocabulary hint passed to the transcription model.
    #[serde(default)]
    pub whisper_prompt: String,
    #[serde(default = "default_media_timeout_secs")]
    pub timeout_secs: u64,
}

redact_debug!(
    MediaConfig,
    redact(api_key),
    api_base,
    transcription_model,
    vision_model,
    whisper_prompt,
    timeout_secs,
);

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_media_api_base(),
            transcription_model: default_transcription_model(),
            vision_model: default_vision_model(),
            whisper_prompt: String::new(),
            timeout_secs: default_media_timeout_secs(),
        }
    }
}

impl MediaConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    /// Our own WhatsApp Business number id; messages sent from it are echoes.
    #[serde(default)]
    pub whatsapp_phone_number_id: String,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Expose Prometheus metrics at `GET /metrics`.
    #[serde(default)]
    pub metrics: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            metrics: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), CoalesceError> {
        self.validate_aggregation()?;
        self.validate_store()?;
        self.validate_delivery()?;
        self.validate_sweep()?;
        self.validate_gateway()?;
        Ok(())
    }

    fn validate_aggregation(&self) -> Result<(), CoalesceError> {
        let a = &self.aggregation;

        if a.window_secs == 0 {
            return Err(CoalesceError::Config(
                "aggregation.windowSecs must be > 0".into(),
            ));
        }
        if a.marker_ttl_secs <= a.window_secs {
            return Err(CoalesceError::Config(
                "aggregation.markerTtlSecs must be greater than aggregation.windowSecs".into(),
            ));
        }
        if a.max_buffer_size == 0 {
            return Err(CoalesceError::Config(
                "aggregation.maxBufferSize must be > 0".into(),
            ));
        }
        if a.max_message_length == 0 {
            return Err(CoalesceError::Config(
                "aggregation.maxMessageLength must be > 0".into(),
            ));
        }
        if a.window_secs > 3600 {
            warn!("aggregation.windowSecs is very long (> 3600s), replies will be delayed");
        }
        Ok(())
    }

    fn validate_store(&self) -> Result<(), CoalesceError> {
        if self.store.backend != StoreBackend::Redis {
            return Ok(());
        }
        let url = self.store.redis_url.trim();
        if url.is_empty() {
            return Err(CoalesceError::Config(
                "store.redisUrl is required when store.backend is \"redis\"".into(),
            ));
        }
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            return Err(CoalesceError::Config(
                "store.redisUrl must start with redis:// or rediss://".into(),
            ));
        }
        Ok(())
    }

    fn validate_delivery(&self) -> Result<(), CoalesceError> {
        let d = &self.delivery;

        if d.max_attempts == 0 || d.max_attempts > 20 {
            return Err(CoalesceError::Config(
                "delivery.maxAttempts must be between 1 and 20".into(),
            ));
        }
        if d.backoff_multiplier.is_nan()
            || d.backoff_multiplier.is_infinite()
            || d.backoff_multiplier < 1.0
        {
            return Err(CoalesceError::Config(
                "delivery.backoffMultiplier must be a finite number >= 1.0".into(),
            ));
        }
        if d.initial_delay_ms > d.max_delay_ms {
            return Err(CoalesceError::Config(
                "delivery.initialDelayMs must be <= delivery.maxDelayMs".into(),
            ));
        }
        if d.timeout_secs == 0 {
            return Err(CoalesceError::Config(
                "delivery.timeoutSecs must be > 0".into(),
            ));
        }
        if d.queue_capacity == 0 {
            return Err(CoalesceError::Config(
                "delivery.queueCapacity must be > 0".into(),
            ));
        }
        if d.max_concurrent == 0 {
            return Err(CoalesceError::Config(
                "delivery.maxConcurrent must be > 0".into(),
            ));
        }
        if !d.webhook_url.is_empty() {
            let parsed = url::Url::parse(&d.webhook_url).map_err(|e| {
                CoalesceError::Config(format!("delivery.webhookUrl is not a valid URL: {}", e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(CoalesceError::Config(
                    "delivery.webhookUrl must use http or https".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_sweep(&self) -> Result<(), CoalesceError> {
        let s = &self.sweep;
        if s.enabled {
            if s.interval_secs == 0 {
                return Err(CoalesceError::Config(
                    "sweep.intervalSecs must be > 0 when enabled".into(),
                ));
            }
            if s.batch_size == 0 {
                return Err(CoalesceError::Config(
                    "sweep.batchSize must be > 0 when enabled".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_gateway(&self) -> Result<(), CoalesceError> {
        if self.gateway.port == 0 {
            return Err(CoalesceError::Config("gateway.port must be > 0".into()));
        }
        if self.gateway.port < 1024 {
            warn!(
                "gateway.port {} is a privileged port (< 1024), may require elevated permissions",
                self.gateway.port
            );
        }
        if self.gateway.max_body_bytes == 0 {
            return Err(CoalesceError::Config(
                "gateway.maxBodyBytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}
