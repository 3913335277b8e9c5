//! # meshrpc-server — Main Entry Point
//!
//! Wires together logging, the route registry, the accept loop, the
//! optional load balancer background scheduler, and the graceful shutdown
//! sequence (spec §5). The logging setup — layered `tracing_subscriber`
//! with a colorized stdout layer and a daily-rolling file layer — is kept
//! close to the teacher's own `main.rs`.

use anyhow::Result;
use clap::Parser;
use meshrpc::balancer::LoadBalancer;
use meshrpc::cli::Args;
use meshrpc::router;
use meshrpc::server::{self, ServerOptions};
use meshrpc::shutdown::ShutdownController;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use meshrpc::logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // `LOGGER` in the properties file (spec §6) picks which sinks are
    // active; `--log-file`/`-v` still control where/how verbosely each
    // active sink writes.
    let sinks = args.properties()?.log_sinks();
    if sinks.remote {
        info!("LOGGER requested a remote sink; no transport is bundled, plug one in via tracing");
    }

    let mut guard = None;
    let mut detailed_log_layer = None;

    if sinks.file {
        if let Some("stderr") = args.log_file.as_deref() {
            detailed_log_layer = Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(log_level)
                    .boxed(),
            );
        } else {
            let file_appender = match args.log_file.as_deref() {
                Some(path_str) => {
                    let log_path = std::path::Path::new(path_str);
                    let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                    let log_filename = log_path
                        .file_name()
                        .unwrap_or_else(|| std::ffi::OsStr::new("meshrpc.log"));
                    tracing_appender::rolling::daily(log_dir, log_filename)
                }
                None => tracing_appender::rolling::daily(".", "meshrpc.log"),
            };
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            detailed_log_layer = Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking_writer)
                    .with_ansi(false)
                    .with_filter(log_level)
                    .boxed(),
            );
            guard = Some(file_guard);
        }
    }

    let stdout_log = sinks.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .event_format(ColorizedFormatter)
            .with_filter(log_level)
    });

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    let _log_guard = guard;

    let server_config = args.server_config()?;
    if !server_config.logging {
        info!("logging disabled by server config; continuing on stderr/file layers only");
    }

    info!(
        host = %server_config.host,
        port = server_config.port,
        base_package = %server_config.base_package,
        "starting meshrpc server"
    );

    router::init_registry(&server_config.base_packages(), args.duplicate_route_policy()).await?;
    let registry = Arc::new(router::get_registry().await?.clone());

    let shutdown = ShutdownController::new();

    let balancer = match &args.balancer_config {
        Some(path) => {
            let balancer = Arc::new(LoadBalancer::load(path)?);
            balancer.spawn_background_loop(std::time::Duration::from_secs(5));
            info!(path = %path.display(), "load balancer config loaded");
            Some(balancer)
        }
        None => None,
    };
    let _balancer = balancer;

    let options = ServerOptions {
        host: server_config.host,
        port: server_config.port,
        linger: args.linger,
        backlog: 1024,
    };

    let addr = server::run(options, registry, shutdown.handle()).await?;
    info!(addr = %addr, "meshrpc server accepting connections");

    shutdown.wait_for_signal_and_trigger(args.drain_deadline).await;

    if let Err(err) = flush_and_exit().await {
        error!(error = %err, "error during final shutdown flush");
    }

    Ok(())
}

/// Placeholder for the "flush log appender queues" step of spec §5's
/// shutdown sequence; `tracing_appender`'s non-blocking writer already
/// flushes on guard drop, which happens when `main` returns.
async fn flush_and_exit() -> Result<()> {
    Ok(())
}
