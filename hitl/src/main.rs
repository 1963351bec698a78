//! `hitl` command-line tool.
//!
//! Producer commands (`feedback`, `notify`) block until an operator answers;
//! `shell` is the operator's side, answering requests at the terminal.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use hitl::consumer::{ConsumerConfig, run_consumer};
use hitl::exit_codes;
use hitl::io::client::HitlClient;
use hitl::io::config::ClientConfig;
use hitl::io::shell_client::ShellClient;
use hitl::io::terminal::{TerminalResponder, report_event, welcome};

#[derive(Parser)]
#[command(name = "hitl", version, about = "Human-in-the-loop requests from the command line")]
struct Cli {
    /// Server URL (overrides HITL_SERVER_URL).
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer requests interactively until Ctrl-C.
    Shell {
        /// Long-poll budget per claim, in seconds.
        #[arg(long, default_value_t = 30)]
        poll: u64,
    },
    /// Ask the operator a question and print the answer.
    Feedback {
        prompt: String,
        #[arg(long, default_value = "cli")]
        source: String,
        /// JSON object shown to the operator alongside the prompt.
        #[arg(long)]
        context: Option<String>,
        /// Seconds before the request expires (defaults to HITL_TIMEOUT).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Tell the operator something.
    Notify {
        message: String,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        context: Option<String>,
    },
    /// Print every in-flight request as JSON.
    Pending,
    /// Print server health as JSON.
    Health,
}

fn main() {
    let cli = Cli::parse();
    hitl::logging::init("warn");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("start async runtime: {err}");
            std::process::exit(exit_codes::INVALID);
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    // A pending stdin read holds a blocking thread; don't wait for it.
    runtime.shutdown_background();
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = ClientConfig::from_env()?;
    if let Some(server) = cli.server {
        config = config.with_server_url(server);
    }

    match cli.command {
        Command::Shell { poll } => cmd_shell(&config, poll).await,
        Command::Feedback {
            prompt,
            source,
            context,
            timeout,
        } => {
            let client = HitlClient::new(config)?;
            let context = parse_context(context.as_deref())?;
            let answer = client
                .request_feedback(&prompt, &source, context, timeout.map(Duration::from_secs))
                .await;
            match answer {
                Some(text) => {
                    println!("{text}");
                    Ok(exit_codes::OK)
                }
                None => {
                    eprintln!("no feedback received");
                    Ok(exit_codes::NO_ANSWER)
                }
            }
        }
        Command::Notify {
            message,
            source,
            context,
        } => {
            let client = HitlClient::new(config)?;
            let context = parse_context(context.as_deref())?;
            if client.notify(&message, &source, context).await {
                Ok(exit_codes::OK)
            } else {
                eprintln!("notification was not delivered");
                Ok(exit_codes::NO_ANSWER)
            }
        }
        Command::Pending => {
            let pending = ShellClient::new(&config.server_url)?.pending().await?;
            print_json(&pending)?;
            Ok(exit_codes::OK)
        }
        Command::Health => {
            let health = ShellClient::new(&config.server_url)?.health().await?;
            print_json(&health)?;
            Ok(exit_codes::OK)
        }
    }
}

async fn cmd_shell(config: &ClientConfig, poll: u64) -> Result<i32> {
    let source = ShellClient::new(&config.server_url)?;
    let consumer = ConsumerConfig {
        poll_wait: Duration::from_secs(poll),
        ..ConsumerConfig::default()
    };
    println!("{}", welcome(&config.server_url));

    let mut responder = TerminalResponder::stdio();
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let stats = run_consumer(&source, &mut responder, &consumer, shutdown, report_event).await;

    println!();
    println!(
        "Shutting down ({} claimed, {} delivered)",
        stats.claimed, stats.delivered
    );
    Ok(exit_codes::OK)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

/// Parse a `--context` argument, which must be a JSON object.
fn parse_context(raw: Option<&str>) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str(raw).context("parse --context as JSON")? {
        Value::Object(map) => Ok(Some(map)),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}
