//! Loading and validating engine configuration

use crate::error::EngineError;
use rangefetch_types::EngineConfig;
use std::path::Path;
use tracing::info;

/// Load a configuration from a JSON file. Missing fields take their defaults.
pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await?;
    let config = load_from_str(&content)?;
    info!("Loaded engine configuration from {:?}", path);
    Ok(config)
}

/// Parse and validate a configuration from a JSON string
pub fn load_from_str(content: &str) -> Result<EngineConfig, EngineError> {
    let config: EngineConfig = serde_json::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations the engine cannot run with
pub fn validate(config: &EngineConfig) -> Result<(), EngineError> {
    let positive = [
        ("thread_pool_size", config.thread_pool_size as u64),
        ("max_concurrent_downloads", config.max_concurrent_downloads as u64),
        ("per_file_chunk_concurrency", config.per_file_chunk_concurrency as u64),
        ("chunk_size", config.chunk_size),
        ("max_retry_attempts", config.max_retry_attempts as u64),
        ("queue_capacity", config.queue_capacity as u64),
        ("read_timeout_secs", config.read_timeout_secs),
        ("connection_timeout_secs", config.connection_timeout_secs),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(EngineError::Config(format!("{} must be greater than zero", name)));
        }
    }

    if config.progress_reporting && config.progress_interval_ms == 0 {
        return Err(EngineError::Config(
            "progress_interval_ms must be greater than zero when progress reporting is on".into(),
        ));
    }

    if config.retry_backoff_base_ms > config.retry_backoff_max_ms {
        return Err(EngineError::Config(format!(
            "retry_backoff_base_ms ({}) exceeds retry_backoff_max_ms ({})",
            config.retry_backoff_base_ms, config.retry_backoff_max_ms
        )));
    }

    if config.request_timeout_secs == Some(0) {
        return Err(EngineError::Config("request_timeout_secs must be greater than zero".into()));
    }

    Ok(())
}
