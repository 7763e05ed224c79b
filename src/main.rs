mod classify;
mod client;
mod config;
mod detect;
mod listener;
mod reconciler;
mod server;
mod store;
mod types;
mod watcher;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::{Settings, WatchMode};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use store::{ConfigStore, SlotPatch};
use types::{SlotStatus, SlotType};

/// Grace period for leftover tasks once the server future has returned.
const FORCE_EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "slotd", about = "Slot daemon - serves placeholder and static-site ports from a slots document")]
struct Cli {
    /// Control API port (used by serve and all client commands)
    #[arg(long, default_value_t = 8790, global = true)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArg {
    /// Slots document
    #[arg(long, env = "SLOTD_CONFIG", default_value = "config/slots.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciler and control API
    Serve {
        /// YAML settings file; flags below override it
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Slots document
        #[arg(long, env = "SLOTD_CONFIG")]
        config: Option<PathBuf>,
        /// Directory holding one placeholder asset directory per slot
        #[arg(long, env = "SLOTD_PLACEHOLDERS")]
        placeholders: Option<PathBuf>,
        /// Address managed ports bind to
        #[arg(long)]
        host: Option<IpAddr>,
        /// How to detect changes to the slots document
        #[arg(long, value_enum)]
        watch: Option<WatchMode>,
        /// Quiet period before a burst of changes triggers a reconcile
        #[arg(long)]
        debounce_ms: Option<u64>,
        /// Custom log directory (default: stderr)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Write the initial slots document (slots a-e on ports 3001-3005)
    Init {
        #[command(flatten)]
        config: ConfigArg,
        /// Overwrite an existing document
        #[arg(long)]
        force: bool,
    },
    /// Update one slot's fields under the document lock
    Set {
        /// Slot id (a-e)
        slot: String,
        #[command(flatten)]
        config: ConfigArg,
        #[arg(long, value_enum)]
        status: Option<SlotStatus>,
        #[arg(long = "type", value_enum)]
        slot_type: Option<SlotType>,
        #[arg(long)]
        static_root: Option<PathBuf>,
        #[arg(long)]
        spa_mode: Option<bool>,
        /// Slot's listening port; only accepted for a slot that has no port yet
        #[arg(long = "slot-port")]
        slot_port: Option<u16>,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Environment variable for the deployed app (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// "now" or an RFC 3339 timestamp; defaults to now when --status is given
        #[arg(long, value_parser = parse_timestamp)]
        last_deploy: Option<DateTime<Utc>>,
        #[arg(long)]
        inc_deploy_count: bool,
    },
    /// Put a slot back to its placeholder page
    Reset {
        /// Slot id (a-e)
        slot: String,
        #[command(flatten)]
        config: ConfigArg,
    },
    /// Classify every slot in the document without contacting the server
    Show {
        #[command(flatten)]
        config: ConfigArg,
    },
    /// Detect whether a checkout is a static site or an app
    Detect {
        /// Directory to inspect (default: current directory)
        directory: Option<PathBuf>,
    },
    /// Show the ports the running server is serving
    Status,
    /// Show the running server's view of every slot
    Slots,
    /// Ask the running server to reconcile now
    Reconcile,
    /// Stop the running server
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            settings,
            config,
            placeholders,
            host,
            watch,
            debounce_ms,
            log_dir,
        } => {
            // Initialize logging
            if let Some(log_dir) = log_dir {
                init_file_logging(&log_dir)?;
            } else {
                tracing_subscriber::fmt().with_env_filter(env_filter()).init();
            }

            let mut settings = match settings {
                Some(path) => Settings::load(&path)?,
                None => Settings::default(),
            };
            if let Some(config) = config {
                settings.config_path = config;
            }
            if let Some(placeholders) = placeholders {
                settings.placeholder_dir = placeholders;
            }
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(mode) = watch {
                settings.watch.mode = mode;
            }
            if let Some(ms) = debounce_ms {
                settings.watch.debounce_ms = ms;
            }

            // Start async server
            let rt = tokio::runtime::Runtime::new()?;
            let result = rt.block_on(server::serve(cli.port, settings));
            rt.shutdown_timeout(FORCE_EXIT_GRACE);
            result
        }
        Commands::Init { config, force } => {
            let store = ConfigStore::new(config.config);
            if store.init(force)? {
                println!("Initialized {}", store.path().display());
            } else {
                println!(
                    "{} already exists (use --force to overwrite)",
                    store.path().display()
                );
            }
            Ok(())
        }
        Commands::Set {
            slot,
            config,
            status,
            slot_type,
            static_root,
            spa_mode,
            slot_port,
            repository,
            branch,
            env,
            last_deploy,
            inc_deploy_count,
        } => {
            let patch = SlotPatch {
                status,
                slot_type,
                static_root,
                spa_mode,
                port: slot_port,
                repository,
                branch,
                environment: env,
                last_deploy,
                inc_deploy_count,
            };
            let updated = ConfigStore::new(config.config).patch_slot(&slot, &patch)?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
            Ok(())
        }
        Commands::Reset { slot, config } => {
            ConfigStore::new(config.config).reset_slot(&slot)?;
            println!("Slot {} reset to placeholder", slot);
            Ok(())
        }
        Commands::Show { config } => {
            let doc = ConfigStore::new(config.config).load()?;
            client::print_slots(&classify::slot_views(&doc));
            Ok(())
        }
        Commands::Detect { directory } => {
            let dir = match directory {
                Some(d) => d,
                None => std::env::current_dir()?,
            };
            let report = detect::detect(&dir);
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Commands::Status => client::client_status(cli.port),
        Commands::Slots => client::client_slots(cli.port),
        Commands::Reconcile => client::client_reconcile(cli.port),
        Commands::Stop => client::client_stop(cli.port),
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if s == "now" {
        return Ok(Utc::now());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

/// `RUST_LOG` if set, else `info`.
fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
}

/// Initialize file-based logging to a directory.
fn init_file_logging(log_dir: &std::path::Path) -> Result<()> {
    use chrono::Local;
    use std::sync::Mutex;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;
    let now = Local::now();
    let log_filename = now.format("slotd-%Y%m%d-%H%M%S.log").to_string();
    let log_file_path = log_dir.join(&log_filename);
    let log_file = std::fs::File::create(&log_file_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .init();

    eprintln!("Log file: {}", log_file_path.display());
    Ok(())
}
