use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::settings::ServerSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "winch.toml";
pub const ENV_CONFIG_KEY: &str = "WINCH_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

/// Load settings from the resolved TOML source with `WINCH_*` env overrides
/// merged on top. A missing config file is not an error; the defaults plus
/// env overrides apply.
pub fn load_settings(config_path: Option<&str>) -> Result<ServerSettings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let file_value = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path}"))?;
            let toml_value: toml::Value = toml::from_str(&payload)
                .with_context(|| format!("failed to parse TOML at {path}"))?;
            let json_value =
                serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;
            normalize_toml_payload(json_value)?
        }
        None => Value::Object(Map::new()),
    };

    let merged = deep_merge(file_value, env_overrides()?);
    let settings: ServerSettings = serde_json::from_value(merged)
        .map_err(|err| anyhow::anyhow!("invalid winch config: {err}"))?;
    settings.validate()?;
    Ok(settings)
}

fn normalize_toml_payload(mut payload: Value) -> Result<Value> {
    if let Value::Object(mut map) = payload {
        if let Some(winch_value) = map.remove("winch") {
            payload = winch_value;
        } else {
            payload = Value::Object(map);
        }
    }

    match payload {
        Value::Object(_) => Ok(payload),
        _ => Err(anyhow::anyhow!("winch config must be a TOML table")),
    }
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "WINCH_REDIS_DSN");
    set_env_string(&mut payload, "server_name", "WINCH_SERVER_NAME");
    set_env_string(&mut payload, "queue", "WINCH_QUEUE");
    set_env_int(&mut payload, "concurrency", "WINCH_CONCURRENCY")?;
    set_env_float(
        &mut payload,
        "poll_interval_seconds",
        "WINCH_POLL_INTERVAL_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "dequeue_timeout_seconds",
        "WINCH_DEQUEUE_TIMEOUT_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "heartbeat_interval_seconds",
        "WINCH_HEARTBEAT_INTERVAL_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "heartbeat_ttl_buffer_seconds",
        "WINCH_HEARTBEAT_TTL_BUFFER_SECONDS",
    )?;
    set_env_int(
        &mut payload,
        "retry_base_delay_ms",
        "WINCH_RETRY_BASE_DELAY_MS",
    )?;
    set_env_int(
        &mut payload,
        "retry_max_delay_ms",
        "WINCH_RETRY_MAX_DELAY_MS",
    )?;
    set_env_int(&mut payload, "max_retries", "WINCH_MAX_RETRIES")?;
    set_env_int(
        &mut payload,
        "state_history_limit",
        "WINCH_STATE_HISTORY_LIMIT",
    )?;

    Ok(Value::Object(payload))
}

fn set_env_string(map: &mut Map<String, Value>, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        map.insert(key.to_string(), Value::String(value));
    }
}

fn set_env_int(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: i64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(key.to_string(), Value::Number(parsed.into()));
    }
    Ok(())
}

fn set_env_float(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: f64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(
            key.to_string(),
            Value::Number(
                serde_json::Number::from_f64(parsed)
                    .ok_or_else(|| anyhow::anyhow!("Invalid {env} value: {value}"))?,
            ),
        );
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let entry = base_map.remove(&key);
                let merged = match entry {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}
