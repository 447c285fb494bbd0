//! keyrelay - owner CLI.
//!
//! Starts, queries and stops the master key agent, and edits the typed
//! configuration kept in the secret store.

use std::io::BufRead;
use std::process::ExitCode;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use tracing::info;
use zeroize::Zeroizing;

use keyrelay::process::AgentStatus;
use keyrelay::store::FIELDS;
use keyrelay::{logging, util, Config, SecretStore};

/// Fields whose values `config show` never prints.
const SENSITIVE_FIELDS: &[&str] = &["agent_token", "encryption_key", "client_token"];

#[derive(Debug, Parser)]
#[command(name = "keyrelay", version, about = "Relay a decrypted master key through a short-lived agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a fresh agent holding the base64 master key read from stdin
    SetKey {
        /// Keep the agent attached to this terminal and wait for it to exit
        #[arg(long)]
        foreground: bool,
    },
    /// Print the master key (base64) held by the running agent
    GetKey,
    /// Show whether an agent is running
    Status,
    /// Stop the running agent
    Stop,
    /// Inspect or change stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print every field (sensitive values masked)
    Show,
    /// Print one field's stored value
    Get { field: String },
    /// Validate and store one field
    Set { field: String, value: String },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::from_env()?;
    if let Command::SetKey { foreground: true } = cli.command {
        config.foreground = true;
    }
    let store = SecretStore::open(&config)
        .await
        .with_context(|| format!("Failed to open secret store {}", config.db_url))?;

    // Invalid stored fields are reported by the command itself.
    let debug = store.load_config().await.map(|c| c.debug).unwrap_or(false);
    logging::init_stderr(debug || util::env_var_bool("DEBUG", false));

    match cli.command {
        Command::SetKey { .. } => {
            let mut line = Zeroizing::new(String::new());
            std::io::stdin().lock().read_line(&mut line)?;
            let key = Zeroizing::new(
                BASE64
                    .decode(line.trim())
                    .context("master key on stdin must be base64")?,
            );
            let mut spawned = store.set_master_key(&key).await?;
            println!(
                "Agent started: pid {} on 127.0.0.1:{}",
                spawned.handle.pid, spawned.handle.listen_port
            );
            if config.foreground {
                let status = spawned.wait()?;
                info!("Agent exited with {}", status);
            }
        }
        Command::GetKey => match store.get_master_key().await? {
            Some(key) => println!("{}", BASE64.encode(key.as_slice())),
            None => {
                eprintln!("No master key available from the agent");
                return Ok(ExitCode::from(1));
            }
        },
        Command::Status => {
            let port = store.load_config().await?.agent_port;
            match store.agent_status().await? {
                AgentStatus::Running { pid } => {
                    println!("Agent running: pid {} on 127.0.0.1:{}", pid, port)
                }
                AgentStatus::Stale { pid } => {
                    println!("Agent not running (stale marker for pid {})", pid)
                }
                AgentStatus::NotRunning => println!("Agent not running"),
            }
        }
        Command::Stop => match store.stop_agent().await? {
            Some(pid) => println!("Stopped agent pid {}", pid),
            None => println!("Agent not running"),
        },
        Command::Config { action } => run_config(&store, action).await?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_config(store: &SecretStore, action: ConfigAction) -> anyhow::Result<()> {
    let mut config = store.load_config().await?;
    match action {
        ConfigAction::Show => {
            for field in FIELDS {
                let value = config.get_field(field)?;
                let shown = match value {
                    Some(_) if SENSITIVE_FIELDS.contains(field) => "<set>".to_string(),
                    Some(v) => v,
                    None => "<unset>".to_string(),
                };
                println!("{} = {}", field, shown);
            }
        }
        ConfigAction::Get { field } => {
            if let Some(value) = config.get_field(&field)? {
                println!("{}", value);
            }
        }
        ConfigAction::Set { field, value } => {
            config.set_field(&field, &value)?;
            config.save(store.kv().as_ref()).await?;
            info!("Updated {}", field);
        }
    }
    Ok(())
}
