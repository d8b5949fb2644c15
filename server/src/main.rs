use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use winch::{
    Client, EnqueueOptions, HandlerRegistry, Invocation, JobHandler, Server, Storage, telemetry,
};
use winch_config::{ServerSettings, load_settings};

#[derive(Parser)]
#[command(name = "winch")]
#[command(version)]
#[command(about = "Distributed background job processing server backed by Redis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server consuming one queue.
    Serve {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        server_name: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Enqueue a job for immediate processing.
    Enqueue {
        target_type: String,
        method: String,
        /// JSON array of arguments.
        #[arg(long, default_value = "[]")]
        args: String,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        max_retries: Option<i64>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Put a job on the schedule for later promotion.
    Schedule {
        target_type: String,
        method: String,
        #[arg(long, default_value = "[]")]
        args: String,
        /// Absolute due time, RFC 3339.
        #[arg(long, conflicts_with = "delay_seconds")]
        at: Option<String>,
        /// Relative due time in seconds from now.
        #[arg(long)]
        delay_seconds: Option<f64>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Move a failed job back onto its queue.
    Requeue {
        job_id: String,
        #[arg(long)]
        config: Option<String>,
    },
    /// Show a job's descriptor and state history.
    Job {
        job_id: String,
        #[arg(long)]
        config: Option<String>,
    },
    /// Show queue and schedule depths.
    Stats {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// List announced servers.
    Servers {
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            queue,
            server_name,
            concurrency,
        } => serve(config.as_deref(), queue, server_name, concurrency).await,
        Commands::Enqueue {
            target_type,
            method,
            args,
            queue,
            max_retries,
            config,
        } => {
            enqueue(
                config.as_deref(),
                &target_type,
                &method,
                &args,
                queue,
                max_retries,
            )
            .await
        }
        Commands::Schedule {
            target_type,
            method,
            args,
            at,
            delay_seconds,
            queue,
            config,
        } => {
            schedule(
                config.as_deref(),
                &target_type,
                &method,
                &args,
                at,
                delay_seconds,
                queue,
            )
            .await
        }
        Commands::Requeue { job_id, config } => requeue(config.as_deref(), &job_id).await,
        Commands::Job { job_id, config } => show_job(config.as_deref(), &job_id).await,
        Commands::Stats { queue, config } => stats(config.as_deref(), queue).await,
        Commands::Servers { config } => servers(config.as_deref()).await,
    }
}

fn load(config: Option<&str>) -> Result<ServerSettings> {
    load_settings(config)
}

fn parse_args(raw: &str) -> Result<Vec<Value>> {
    let parsed: Value = serde_json::from_str(raw).context("--args must be a JSON array")?;
    match parsed {
        Value::Array(values) => Ok(values),
        _ => Err(anyhow::anyhow!("--args must be a JSON array")),
    }
}

/// SIGINT / SIGTERM cancel the returned token; all subsystems observe it and
/// drain gracefully.
fn install_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c, initiating graceful shutdown");
        }
        token.cancel();
    });
}

async fn serve(
    config: Option<&str>,
    queue: Option<String>,
    server_name: Option<String>,
    concurrency: Option<usize>,
) -> Result<()> {
    let mut settings = load(config)?;
    if let Some(queue) = queue {
        settings.queue = queue;
    }
    if let Some(server_name) = server_name {
        settings.server_name = Some(server_name);
    }
    if let Some(concurrency) = concurrency {
        settings.concurrency = concurrency;
    }

    let server = Server::connect(settings, Arc::new(demo_registry())).await?;
    install_shutdown_handler(server.shutdown_handle());
    server.run().await
}

async fn enqueue(
    config: Option<&str>,
    target_type: &str,
    method: &str,
    raw_args: &str,
    queue: Option<String>,
    max_retries: Option<i64>,
) -> Result<()> {
    let settings = load(config)?;
    let mut client = Client::connect(settings).await?;
    let job = client
        .enqueue(
            target_type,
            method,
            parse_args(raw_args)?,
            EnqueueOptions {
                queue,
                max_retries,
                ..Default::default()
            },
        )
        .await?;
    println!("{}", job.id);
    Ok(())
}

async fn schedule(
    config: Option<&str>,
    target_type: &str,
    method: &str,
    raw_args: &str,
    at: Option<String>,
    delay_seconds: Option<f64>,
    queue: Option<String>,
) -> Result<()> {
    let run_at = match (at, delay_seconds) {
        (Some(at), _) => DateTime::parse_from_rfc3339(&at)
            .context("--at must be an RFC 3339 timestamp")?
            .with_timezone(&Utc),
        (None, Some(delay)) => Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64),
        (None, None) => {
            return Err(anyhow::anyhow!("pass either --at or --delay-seconds"));
        }
    };

    let settings = load(config)?;
    let mut client = Client::connect(settings).await?;
    let job = client
        .schedule(
            target_type,
            method,
            parse_args(raw_args)?,
            run_at,
            EnqueueOptions {
                queue,
                ..Default::default()
            },
        )
        .await?;
    println!("{}", job.id);
    Ok(())
}

async fn requeue(config: Option<&str>, job_id: &str) -> Result<()> {
    let settings = load(config)?;
    let mut client = Client::connect(settings).await?;
    if client.requeue_failed(job_id).await? {
        println!("requeued {job_id}");
    } else {
        println!("{job_id} is not in the failed state");
    }
    Ok(())
}

async fn show_job(config: Option<&str>, job_id: &str) -> Result<()> {
    let settings = load(config)?;
    let mut storage = Storage::connect(settings).await?;
    match storage.get_job(job_id).await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            let history = storage.state_history(job_id).await?;
            if !history.is_empty() {
                println!("history:");
                for entry in history {
                    println!("  {entry}");
                }
            }
        }
        None => println!("job {job_id} not found"),
    }
    Ok(())
}

async fn stats(config: Option<&str>, queue: Option<String>) -> Result<()> {
    let settings = load(config)?;
    let queue = queue.unwrap_or_else(|| settings.queue.clone());
    let mut storage = Storage::connect(settings).await?;
    println!("queue {}: {}", queue, storage.queue_len(&queue).await?);
    println!("schedule: {}", storage.schedule_len().await?);
    Ok(())
}

async fn servers(config: Option<&str>) -> Result<()> {
    let settings = load(config)?;
    let mut storage = Storage::connect(settings).await?;
    let names = storage.list_servers().await?;
    if names.is_empty() {
        println!("no servers announced");
        return Ok(());
    }
    for name in names {
        match storage.server_info(&name).await? {
            Some(info) => {
                println!(
                    "{name}  queue={} concurrency={} state={} beat={}",
                    info.get("queue").map(String::as_str).unwrap_or("?"),
                    info.get("concurrency").map(String::as_str).unwrap_or("?"),
                    info.get("state").map(String::as_str).unwrap_or("?"),
                    info.get("beat").map(String::as_str).unwrap_or("?"),
                );
            }
            None => println!("{name}  (no heartbeat)"),
        }
    }
    Ok(())
}

// Built-in handlers so `winch serve` can be exercised end-to-end without an
// embedding application.

struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<Value> {
        tracing::info!(job_id = %invocation.job_id, args = %serde_json::Value::Array(invocation.args.clone()), "echo");
        Ok(Value::Array(invocation.args))
    }
}

struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<Value> {
        let seconds = invocation
            .args
            .first()
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        tokio::time::sleep(Duration::from_secs_f64(seconds.clamp(0.0, 3600.0))).await;
        Ok(Value::Null)
    }
}

struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<Value> {
        let message = invocation
            .args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        Err(anyhow::anyhow!("{message}"))
    }
}

fn demo_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("sleep", Arc::new(SleepHandler));
    registry.register("fail", Arc::new(FailHandler));
    registry
}
