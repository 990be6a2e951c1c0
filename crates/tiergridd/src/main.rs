use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tiergrid_core::{DiscoveryFallback, TopologyConfig};
use tiergrid_deploy::{Action, ApplyReport, Deployer, LocalProvisioner};
use tiergrid_state::{resolve_at_startup, Resolution, StateStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod serve;

#[derive(Parser)]
#[command(
    name = "tiergridd",
    about = "TierGrid: provision and serve a two-tier game backend",
    version,
    propagate_version = true
)]
struct Cli {
    /// Topology file.
    #[arg(long, short, global = true, default_value = "topology.toml")]
    config: PathBuf,

    /// Directory holding the resource ledger and local storage tier.
    #[arg(long, global = true, default_value = ".tiergrid")]
    data_dir: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Write a scaffold topology file.
    Init {
        #[arg(long, default_value = "tiergrid")]
        name: String,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show what apply would change.
    Plan,
    /// Converge the deployed resources on the topology file.
    Apply,
    /// Tear the topology down.
    Destroy {
        /// Keep the storage tier regardless of its retention policy.
        #[arg(long)]
        keep_data: bool,
    },
    /// Print the values operators need after a deploy.
    Outputs {
        #[arg(long)]
        json: bool,
    },
    /// Read a discovery record the way a replica does at startup.
    Resolve {
        key: String,
        /// Print nothing and exit cleanly when the record is unpublished.
        #[arg(long)]
        degraded: bool,
    },
    /// Run the listener, pools and health monitors.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Init { name, force } => init(&cli.config, &name, force),
        Command::Plan => {
            let config = load_config(&cli.config)?;
            let report = open_deployer(&cli.data_dir)?.plan(&config)?;
            print_report(&report);
            println!("\n{} change(s) pending", report.mutations());
            Ok(())
        }
        Command::Apply => {
            let config = load_config(&cli.config)?;
            let deployer = open_deployer(&cli.data_dir)?;
            let report = deployer.apply(&config)?;
            print_report(&report);
            println!();
            for (key, value) in deployer.outputs()? {
                println!("{key} = {value}");
            }
            Ok(())
        }
        Command::Destroy { keep_data } => {
            let report = open_deployer(&cli.data_dir)?.destroy(keep_data)?;
            print_report(&report);
            Ok(())
        }
        Command::Outputs { json } => {
            let outputs = open_deployer(&cli.data_dir)?.outputs()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outputs)?);
            } else {
                for (key, value) in outputs {
                    println!("{key} = {value}");
                }
            }
            Ok(())
        }
        Command::Resolve { key, degraded } => {
            let deployer = open_deployer(&cli.data_dir)?;
            let fallback = if degraded {
                DiscoveryFallback::Degraded
            } else {
                DiscoveryFallback::FailClosed
            };
            match resolve_at_startup(deployer.store(), &key, fallback)? {
                Resolution::Published(record) => {
                    println!("{} (v{})", record.value, record.version);
                }
                Resolution::Degraded { key } => {
                    eprintln!("{key} is not published; continuing degraded");
                }
            }
            Ok(())
        }
        Command::Serve => {
            let config = load_config(&cli.config)?;
            // redb locks the file while open; hold the ledger only per read so
            // `apply` can run against a serving node.
            let data_dir = cli.data_dir.clone();
            serve::run(config, move || Ok(open_deployer(&data_dir)?.registrations()?)).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tiergrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn init(path: &Path, name: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let scaffold = TopologyConfig::scaffold(name).to_toml_string()?;
    std::fs::write(path, scaffold)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), project = name, "topology scaffold written");
    println!("wrote {}", path.display());
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<TopologyConfig> {
    TopologyConfig::from_file(path)
        .with_context(|| format!("failed to load topology from {}", path.display()))
}

fn open_deployer(data_dir: &Path) -> anyhow::Result<Deployer> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let store = StateStore::open(&data_dir.join("tiergrid.redb"))?;
    Ok(Deployer::new(store, Arc::new(LocalProvisioner::new(data_dir))))
}

fn print_report(report: &ApplyReport) {
    for change in &report.changes {
        let marker = match change.action {
            Action::Create => "+",
            Action::Update => "~",
            Action::Destroy => "-",
            Action::Retain => "=",
            Action::Unchanged => " ",
        };
        println!("{marker} {:<16} {:?}", change.step, change.action);
    }
}
