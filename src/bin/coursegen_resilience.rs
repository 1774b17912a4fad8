//! coursegen-resilience: operator tool for the course-generation resilience layer
//!
//! Usage:
//!   coursegen-resilience health [--config <path>] [--json]   Probe cache storage
//!   coursegen-resilience metrics [--config <path>]           Print cache size and guard limits
//!
//! Breaker state and call counters live inside the process that makes the calls.
//! A fresh CLI process cannot see them; enable metrics export in that process
//! to observe them.
//!   coursegen-resilience config [--config <path>]            Print effective config
//!   coursegen-resilience clear-cache [--config <path>]       Drop every cached result
//!   coursegen-resilience purge-expired [--config <path>]     Drop expired cache entries

use anyhow::{bail, Context};
use coursegen_resilience::telemetry::HealthSnapshot;
use coursegen_resilience::{ResilienceConfig, ResilientClient, ServiceId, ServicePolicy};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "health" => cmd_health(rest),
        "metrics" => cmd_metrics(rest).await,
        "config" => cmd_config(rest),
        "clear-cache" => cmd_clear_cache(rest).await,
        "purge-expired" => cmd_purge_expired(rest).await,
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"coursegen-resilience: resilience layer operator tool

USAGE:
    coursegen-resilience <COMMAND> [OPTIONS]

COMMANDS:
    health [--json]             Probe cache storage (exit code 2 when unhealthy)
    metrics                     Print cache size and configured guard limits
    config                      Print the effective configuration as YAML
    clear-cache                 Invalidate every cached result
    purge-expired               Remove expired entries from the cache
    version                     Show version information
    help                        Show this help message

OPTIONS:
    --config <path>             YAML config file (overrides COURSEGEN_RESILIENCE_CONFIG)

ENVIRONMENT:
    COURSEGEN_RESILIENCE_CONFIG YAML config file path
    COURSEGEN_CACHE_ENABLED     0/1 toggles caching
    COURSEGEN_CACHE_DIR         Persistent cache directory
    COURSEGEN_CACHE_TTL_SECS    Default cache TTL
    COURSEGEN_RPM               Requests per minute per service
    COURSEGEN_BREAKER_FAILURE_THRESHOLD
    COURSEGEN_BREAKER_COOLDOWN_SECS
    COURSEGEN_RETRY_MAX_ATTEMPTS
    COURSEGEN_METRICS_EXPORT    0/1 toggles metrics export
    RUST_LOG                    Log filter (default: warn)"#
    );
}

fn cmd_version() {
    println!("coursegen-resilience {}", env!("CARGO_PKG_VERSION"));
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> anyhow::Result<ResilienceConfig> {
    let mut cfg = match flag_value(args, "--config") {
        Some(path) => ResilienceConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => return ResilienceConfig::load().context("loading config"),
    };
    cfg.apply_env(|k| std::env::var(k).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

fn client(args: &[String]) -> anyhow::Result<ResilientClient> {
    let cfg = load_config(args)?;
    Ok(ResilientClient::from_config(cfg)?)
}

/// Drops breaker probes: a fresh process only ever sees closed breakers.
fn storage_health(mut snapshot: HealthSnapshot) -> HealthSnapshot {
    snapshot.probes.retain(|name, _| !name.starts_with("breaker."));
    snapshot.healthy = snapshot.probes.values().all(|p| p.healthy);
    snapshot
}

fn cmd_health(args: &[String]) -> anyhow::Result<()> {
    let client = client(args)?;
    let snapshot = storage_health(client.check_health());
    if args.iter().any(|a| a == "--json") {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        for (name, probe) in &snapshot.probes {
            let mark = if probe.healthy { "ok  " } else { "FAIL" };
            println!("[{mark}] {name}: {}", probe.detail);
        }
        println!();
        println!("overall: {}", if snapshot.healthy { "healthy" } else { "unhealthy" });
    }
    if !snapshot.healthy {
        std::process::exit(2);
    }
    Ok(())
}

fn describe_policy(service: &ServiceId, policy: &ServicePolicy) -> Vec<String> {
    let rate = if policy.rate_limit.is_unlimited() {
        "unlimited".to_string()
    } else {
        format!(
            "{} per {:?} ({:?} window)",
            policy.rate_limit.max_requests, policy.rate_limit.window, policy.rate_limit.kind
        )
    };
    vec![
        service.to_string(),
        format!(
            "  breaker: opens after {} failures, probes after {:?}",
            policy.breaker.failure_threshold, policy.breaker.reset_timeout
        ),
        format!("  rate limit: {rate}"),
        format!("  retry: up to {} attempts", policy.retry.max_attempts),
    ]
}

async fn cmd_metrics(args: &[String]) -> anyhow::Result<()> {
    let client = client(args)?;
    let cache = client.cache();
    let entries = cache.len().await.unwrap_or(0);
    println!("cache");
    println!("  backend: {}", cache.backend_name());
    println!("  enabled: {}", cache.is_enabled());
    println!("  entries: {entries}");
    println!("  default_ttl: {:?}", cache.config().default_ttl);

    let cfg = client.config();
    for service in client.services() {
        for line in describe_policy(&service, cfg.policy_for(&service)) {
            println!("{line}");
        }
    }
    println!();
    println!("live breaker state and call counters are exported by the calling process (metrics.export_enabled)");
    Ok(())
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    print!("{}", cfg.to_yaml()?);
    Ok(())
}

async fn cmd_clear_cache(args: &[String]) -> anyhow::Result<()> {
    let client = client(args)?;
    if !client.cache().is_enabled() {
        bail!("caching is disabled; nothing to clear");
    }
    let before = client.cache().len().await.unwrap_or(0);
    client.clear_cache().await?;
    println!("cleared {before} entries from {} cache", client.cache().backend_name());
    Ok(())
}

async fn cmd_purge_expired(args: &[String]) -> anyhow::Result<()> {
    let client = client(args)?;
    let removed = client.cache().purge_expired().await?;
    println!("removed {removed} expired entries");
    Ok(())
}
