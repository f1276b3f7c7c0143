use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use notevault_core::config::Config;
use notevault_core::core_broadcast::{
    Broadcaster, EchoNode, NodeId, NodeRegistry, ReplyEnvelope, ReplyPayload,
};
use notevault_core::core_store::{DataStore, LogicalKey};
use notevault_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use notevault_core::metrics::init_metrics;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "notevault")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Data directory, overrides the configuration
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Store password
    #[arg(long, env = "NOTEVAULT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    scope: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    version: String,
}

impl KeyArgs {
    fn logical_key(&self) -> LogicalKey {
        LogicalKey::new(&self.kind, &self.scope, &self.id, &self.version)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a JSON document
    Put {
        #[command(flatten)]
        key: KeyArgs,
        /// Document as JSON
        document: String,
    },
    /// Print a stored document (`{}` if absent)
    Get {
        #[command(flatten)]
        key: KeyArgs,
        /// Fail on malformed documents and print `null` if absent
        #[arg(long)]
        strict: bool,
    },
    /// Remove a bucket and its data files
    Remove {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        scope: String,
    },
    /// Re-encrypt the store under a new password
    ChangePassword {
        #[arg(long, env = "NOTEVAULT_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Print index statistics
    Stats,
    /// Broadcast a message to in-process echo nodes
    Broadcast {
        /// Nodes to register, comma separated
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,
        /// Recipients, comma separated (defaults to every node)
        #[arg(long, value_delimiter = ',')]
        to: Vec<String>,
        message: String,
    },
    /// Write the effective configuration as TOML
    InitConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(shellexpand::tilde(path).into_owned())
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(dir) = &args.data_dir {
        config.store.data_dir = PathBuf::from(shellexpand::tilde(dir).into_owned());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;

    let log_level: LogLevel = config.logging.level.parse()?;
    init_logging_with_config(
        LogConfig::new(log_level)
            .json_format(args.json_logs || config.logging.json_format)
            .with_target(config.logging.with_target),
    )?;
    init_metrics();

    debug!(data_dir = %config.store.data_dir.display(), "NoteVault CLI started");

    match args.command {
        Command::Put { key, document } => {
            let document: Value =
                serde_json::from_str(&document).context("Document is not valid JSON")?;
            let store = open_store(&config, args.password.as_deref())?;
            store.put(key.logical_key(), document).await?;
            info!(key = %key.logical_key(), "Document stored");
        }
        Command::Get { key, strict } => {
            let store = open_store(&config, args.password.as_deref())?;
            let document = if strict {
                store.read(key.logical_key()).await?.unwrap_or(Value::Null)
            } else {
                store.get(key.logical_key()).await?
            };
            println!("{}", document);
        }
        Command::Remove { kind, scope } => {
            let store = open_store(&config, args.password.as_deref())?;
            let report = store.remove(kind, scope).await?;
            println!(
                "{}",
                json!({
                    "removed": report.removed,
                    "missing": report.missing,
                    "failed": report.failed,
                })
            );
        }
        Command::ChangePassword { new_password } => {
            let password = require_password(args.password.as_deref())?;
            let store = open_store(&config, Some(password))?;
            let report = store
                .change_password(password.to_string(), new_password)
                .await?;
            println!(
                "{}",
                json!({ "rotated": report.rotated, "resumed": report.resumed })
            );
        }
        Command::Stats => {
            let store = open_store(&config, args.password.as_deref())?;
            println!("{}", serde_json::to_string(&store.stats()?)?);
        }
        Command::Broadcast { nodes, to, message } => {
            let registry = NodeRegistry::new();
            for node in &nodes {
                registry.insert(NodeId::from(node.as_str()), Arc::new(EchoNode)).await;
            }
            let recipients: Vec<NodeId> = if to.is_empty() { nodes } else { to }
                .into_iter()
                .map(NodeId::from)
                .collect();

            let broadcaster = Broadcaster::new(registry, &config.broadcast);
            let mut encoded = Vec::new();
            broadcaster
                .broadcast_to(message.as_bytes(), &recipients, &mut encoded)
                .await?;

            let envelope = ReplyEnvelope::decode(&encoded)?;
            println!("{}", envelope_json(&envelope));
        }
        Command::InitConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
        }
    }

    Ok(())
}

fn require_password(password: Option<&str>) -> Result<&str> {
    match password {
        Some(p) if !p.is_empty() => Ok(p),
        _ => bail!("A password is required: pass --password or set NOTEVAULT_PASSWORD"),
    }
}

fn open_store(config: &Config, password: Option<&str>) -> Result<DataStore> {
    let password = require_password(password)?;
    DataStore::open_with_password(&config.store, &config.kdf, password)
        .context("Failed to open store (wrong password?)")
}

fn envelope_json(envelope: &ReplyEnvelope) -> Value {
    let payload: serde_json::Map<String, Value> = envelope
        .payload
        .iter()
        .map(|(id, entry)| {
            let entry = match entry {
                ReplyPayload::Reply(bytes) => {
                    json!({ "reply": String::from_utf8_lossy(bytes) })
                }
                ReplyPayload::Error(err) => {
                    json!({ "error": { "stage": err.stage.as_str(), "message": err.message } })
                }
            };
            (id.to_string(), entry)
        })
        .collect();

    json!({
        "sender": envelope.sender,
        "kind": envelope.kind.as_str(),
        "payload": payload,
    })
}
