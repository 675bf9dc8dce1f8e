use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use qbridge::config::BridgeConfig;
use qbridge::controller::HttpController;
use qbridge::http::OperatorState;
use qbridge::planner::HttpPlanner;
use qbridge::runtime::BridgeRuntime;
use qbridge::{http, telemetry};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let (config_path, opts) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: qbridge <config.toml> [--verbose] [--log-json]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <config.toml>    Bridge configuration file");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --verbose        Default log level debug instead of info");
            eprintln!("  --log-json       Emit JSON log lines instead of human-readable ones");
            process::exit(2);
        }
    };

    init_logging(&opts);

    if let Err(e) = run(&config_path) {
        tracing::error!(error = %format!("{e:#}"), "bridge failed");
        process::exit(1);
    }
}

#[derive(Debug, Default)]
struct LogOptions {
    verbose: bool,
    json: bool,
}

fn parse_args(args: &[String]) -> Result<(PathBuf, LogOptions), String> {
    let mut config_path: Option<PathBuf> = None;
    let mut opts = LogOptions::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--verbose" => opts.verbose = true,
            "--log-json" => opts.json = true,
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if config_path.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                config_path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let config_path = config_path.ok_or("missing required argument: <config.toml>")?;
    Ok((config_path, opts))
}

fn init_logging(opts: &LogOptions) {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if opts.json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn run(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = BridgeConfig::load(config_path)?;
    tracing::info!(
        config = %config_path.display(),
        controller = %config.controller.endpoint,
        planner = %config.planner.endpoint,
        "qbridge {} starting",
        qbridge::BRIDGE_VERSION
    );

    let planner = Arc::new(HttpPlanner::new(
        &config.planner.endpoint,
        config.cadence.rpc_timeout(),
        config.planner.ca.as_deref(),
    )?);
    let controller = Arc::new(HttpController::new(
        &config.controller.endpoint,
        config.cadence.rpc_timeout(),
        config.controller.ca.as_deref(),
    )?);

    let (sink, channel) = telemetry::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runtime = BridgeRuntime::new(
        &config,
        planner,
        controller,
        channel,
        sink.clone(),
        shutdown_rx.clone(),
    );
    runtime.start_session().await?;

    tokio::spawn(telemetry::run_stream_listener(
        config.controller.stream.clone(),
        sink,
        shutdown_rx.clone(),
    ));

    if let Some(listen) = config.listen.clone() {
        let state = Arc::new(OperatorState::new(runtime.health_rx(), shutdown_tx.clone()));
        tokio::spawn(async move {
            if let Err(e) = http::serve(&listen, state).await {
                tracing::error!(error = %e, "operator endpoint failed");
            }
        });
    }

    tokio::spawn(shutdown_on_signal(shutdown_tx));

    runtime.run().await;
    Ok(())
}

/// Flip the shutdown watch on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received Ctrl+C");
    }

    let _ = shutdown_tx.send(true);
}
