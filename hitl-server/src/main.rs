//! HITL server - brokers human-in-the-loop requests between tools and operators.

mod error;
mod routes;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hitl::broker::Broker;
use hitl::consumer::{ConsumerConfig, run_consumer};
use hitl::io::config::{ServerConfig, load_config};
use hitl::io::terminal::{TerminalResponder, report_event, welcome};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "hitl-server")]
#[command(about = "Broker between tools that need a human and the operator answering them")]
struct Args {
    /// Address to bind the server to (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// TOML config file; defaults apply when it does not exist
    #[arg(long, default_value = "hitl.toml")]
    config: PathBuf,

    /// Also answer requests at this terminal
    #[arg(long)]
    shell: bool,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = load_config(&self.config)?;
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hitl_server=info".parse()?)
                .add_directive("hitl=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let result = runtime.block_on(serve(args));
    // The in-process shell may be parked on a blocking stdin read.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let config = args.server_config()?;
    let broker = Broker::new(config.broker.clone());
    let reaper = broker.spawn_reaper();

    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port))
        .await
        .with_context(|| format!("bind {}:{}", config.bind, config.port))?;
    info!(addr = %listener.local_addr()?, "listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let shell = args.shell.then(|| spawn_shell(broker.clone(), stop_rx.clone()));

    let app = routes::app(AppState::new(broker.clone(), &config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker.clone(), stop_tx))
        .await
        .context("serve HTTP")?;

    if let Some(shell) = shell {
        if let Err(err) = shell.await {
            warn!(error = %err, "shell task failed");
        }
    }
    reaper.shutdown().await;
    info!("stopped");
    Ok(())
}

/// Resolve on Ctrl-C after closing the broker, so blocked producers get a
/// failure response and long-polls end before connections drain.
async fn shutdown_signal(broker: Broker, stop: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
    let _ = stop.send(true);
    let failed = broker.close("server shutting down");
    info!(failed, "broker closed");
}

/// Run the terminal consumer against the in-process broker.
fn spawn_shell(broker: Broker, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    println!("{}", welcome("in-process broker"));
    tokio::spawn(async move {
        let mut responder = TerminalResponder::stdio();
        let shutdown = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };
        run_consumer(
            &broker,
            &mut responder,
            &ConsumerConfig::default(),
            shutdown,
            report_event,
        )
        .await;
    })
}
