use crate::aggregator::BufferStore;
use crate::config::{Config, StoreBackend, load_config};
use crate::delivery::{Delivery, WebhookDelivery};
use anyhow::{Result, bail};
use std::path::Path;
use tracing::debug;

#[derive(Debug)]
enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

impl CheckResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Pass(_) => "PASS",
            Self::Fail(_) => "FAIL",
            Self::Skip(_) => "SKIP",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::Pass(s) | Self::Fail(s) | Self::Skip(s) => s,
        }
    }

    fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }
}

fn print_check(name: &str, result: &CheckResult) {
    println!("  {:<6} {:<24} {}", result.label(), name, result.detail());
}

fn check_config_file(path: &Path) -> CheckResult {
    if path.exists() {
        CheckResult::Pass(path.display().to_string())
    } else {
        CheckResult::Skip(format!("not found at {}, using defaults", path.display()))
    }
}

fn check_config_file_permissions(path: &Path) -> CheckResult {
    if !path.exists() {
        return CheckResult::Skip("config file not found".to_string());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.permissions().mode() & 0o777;
                if mode & 0o077 == 0 {
                    CheckResult::Pass(format!("{:o}", mode))
                } else {
                    CheckResult::Fail(format!(
                        "{:o} (group/world readable, run: chmod 600 {})",
                        mode,
                        path.display()
                    ))
                }
            }
            Err(_) => CheckResult::Skip("cannot read metadata".to_string()),
        }
    }

    #[cfg(not(unix))]
    CheckResult::Skip("permission check not available on this platform".to_string())
}

async fn check_store(config: &Config) -> CheckResult {
    let store: Box<dyn BufferStore> = match config.store.backend {
        StoreBackend::Memory => {
            return CheckResult::Pass("memory (single process, not durable)".to_string());
        }
        StoreBackend::Redis => {
            match crate::aggregator::RedisBufferStore::connect(
                &config.store.redis_url,
                config.store.key_prefix.clone(),
            )
            .await
            {
                Ok(store) => Box::new(store),
                Err(e) => return CheckResult::Fail(format!("cannot connect: {}", e)),
            }
        }
    };
    let start = std::time::Instant::now();
    match store.ping().await {
        Ok(()) => CheckResult::Pass(format!(
            "redis (ping: {:.0}ms)",
            start.elapsed().as_secs_f64() * 1000.0
        )),
        Err(e) => CheckResult::Fail(format!("ping failed: {}", e)),
    }
}

fn check_delivery(config: &Config) -> CheckResult {
    if WebhookDelivery::new(&config.delivery).is_configured() {
        CheckResult::Pass(config.delivery.webhook_url.clone())
    } else {
        CheckResult::Fail("webhookUrl not set, every delivery will fail".to_string())
    }
}

fn check_media(config: &Config) -> CheckResult {
    if config.media.is_configured() {
        CheckResult::Pass(format!(
            "{} / {}",
            config.media.transcription_model, config.media.vision_model
        ))
    } else {
        CheckResult::Skip("apiKey not set, audio and image messages will be rejected".to_string())
    }
}

fn check_env_credentials(config: &Config) -> CheckResult {
    let names = crate::config::credentials::configured_credentials(config);
    if names.is_empty() {
        CheckResult::Skip("none set".to_string())
    } else {
        CheckResult::Pass(names.join(", "))
    }
}

pub async fn check_command(config_path: Option<&Path>) -> Result<()> {
    println!("chatcoalesce check\n");

    let mut fail_count = 0u32;
    let mut record = |name: &str, result: &CheckResult| {
        print_check(name, result);
        if result.is_fail() {
            fail_count += 1;
        }
    };

    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => crate::config::get_config_path()?,
    };
    record("Config file", &check_config_file(&path));
    record("Config permissions", &check_config_file_permissions(&path));

    let config = match load_config(Some(&path)) {
        Ok(config) => {
            record("Config validates", &CheckResult::Pass("ok".to_string()));
            config
        }
        Err(e) => {
            record("Config validates", &CheckResult::Fail(format!("{:#}", e)));
            bail!("configuration is invalid");
        }
    };

    debug!("checking buffer store connectivity...");
    record("Buffer store", &check_store(&config).await);
    record("Delivery webhook", &check_delivery(&config));
    record("Media resolver", &check_media(&config));
    record("Env credentials", &check_env_credentials(&config));

    println!();
    if fail_count > 0 {
        bail!("{} check(s) failed", fail_count);
    }
    println!("all checks passed");
    Ok(())
}
