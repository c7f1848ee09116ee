/*
* HA VM Manager Command Line Interface
* ------------------------------------
* @project: ha-vm-manager
*
* Same operations as the HTTP API, for operators who live in a shell on one of
* the cluster nodes.
*
* Command Structure:
* ---------------
* ha-vm-manager
* ├── serve [--port]
* ├── nodes                   // online cluster nodes
* ├── init [--force]          // writes config/default.toml
* └── vm
*     ├── list
*     ├── start|enable|restart|remove -n <vm>
*     ├── stop|disable -n <vm> [--force]
*     ├── create -n <vm> --image <qcow2> --xml <xml> [...]
*     ├── snapshot -n <vm> -s <snap>
*     ├── snapshots -n <vm>
*     ├── rollback -n <vm> -s <snap>
*     ├── targets -n <vm>
*     └── migrate -n <vm> -t <node>   // waits until settled or timed out
*
* Usage Examples:
* -------------
* ```bash
* ha-vm-manager vm list
* ha-vm-manager vm migrate -n web01 -t node2
* HAVM__MIGRATION__MAX_ATTEMPTS=60 ha-vm-manager vm migrate -n db01 -t node3
* ```
*/

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::{generate_default_config, LoggingSettings, Settings};
use crate::core::{CrmCli, VirtualMachineRecord, VmAction, VmCreateRequest};

#[derive(Parser)]
#[command(name = "ha-vm-manager")]
#[command(about = "Manage virtual machines running on a Pacemaker cluster", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
    /// List online cluster nodes
    Nodes,
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum VmCommands {
    /// List all virtual machines
    List,
    /// Start a virtual machine
    Start {
        #[arg(short, long)]
        name: String,
    },
    /// Stop a virtual machine
    Stop {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Enable the cluster resource
    Enable {
        #[arg(short, long)]
        name: String,
    },
    /// Disable the cluster resource
    Disable {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Restart through Pacemaker
    Restart {
        #[arg(short, long)]
        name: String,
    },
    /// Remove a virtual machine from the cluster
    Remove {
        #[arg(short, long)]
        name: String,
    },
    /// Create a virtual machine from an uploaded image and domain XML
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        xml: String,
        /// Enable live migration, running it as this user
        #[arg(long)]
        migration_user: Option<String>,
        #[arg(long, conflicts_with = "preferred_host")]
        pinned_host: Option<String>,
        #[arg(long)]
        preferred_host: Option<String>,
    },
    /// Take a snapshot
    Snapshot {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        snapshot: String,
    },
    /// List snapshots
    Snapshots {
        #[arg(short, long)]
        name: String,
    },
    /// Roll back to a snapshot
    Rollback {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        snapshot: String,
    },
    /// Show the nodes a VM can be migrated to
    Targets {
        #[arg(short, long)]
        name: String,
    },
    /// Live-migrate a VM and wait for it to settle
    Migrate {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        target: String,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };
    init_logging(&settings.logging);

    match cli.command {
        Commands::Serve { port } => {
            let server_port = port.unwrap_or(settings.server.port);
            info!("Starting server on port {}", server_port);
            crate::api::run_server(settings, server_port).await?;
        }
        Commands::Vm { command } => handle_vm_command(command, &settings).await?,
        Commands::Nodes => {
            let state = app_state(&settings);
            println!("{}", "Online nodes:".bold());
            for node in state.store.resolver().online_nodes().await? {
                println!("- {}", node);
            }
        }
        Commands::Init { force } => handle_init_command(force)?,
    }

    Ok(())
}

fn init_logging(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // a second init (tests, embedding) is harmless
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn app_state(settings: &Settings) -> AppState {
    let source = Arc::new(CrmCli::from_settings(&settings.cluster));
    AppState::new(source, settings.migration.clone())
}

async fn handle_vm_command(command: VmCommands, settings: &Settings) -> anyhow::Result<()> {
    let state = app_state(settings);

    let (name, action) = match command {
        VmCommands::List => {
            let vms = state.store.refresh().await?;
            print_vm_table(&vms);
            return Ok(());
        }
        VmCommands::Create {
            name,
            image,
            xml,
            migration_user,
            pinned_host,
            preferred_host,
        } => {
            let request = VmCreateRequest {
                name: name.clone(),
                image_path: image,
                xml_path: xml,
                migration_user,
                pinned_host,
                preferred_host,
            };
            state.actions.create(&request).await?;
            println!("{} VM '{}' created", "✓".green(), name);
            return Ok(());
        }
        VmCommands::Snapshots { name } => {
            let snapshots = state.actions.list_snapshots(&name).await?;
            println!("{}", format!("Snapshots of {}:", name).bold());
            if snapshots.is_empty() {
                println!("  (none)");
            }
            for snapshot in snapshots {
                println!("- {}", snapshot);
            }
            return Ok(());
        }
        VmCommands::Targets { name } => {
            let vm = state.store.find_or_refresh(&name).await?;
            let targets = state.store.resolver().migration_targets(&vm.current_node).await?;
            println!("{}", format!("{} can move to:", name).bold());
            for node in targets {
                println!("- {}", node);
            }
            return Ok(());
        }
        VmCommands::Migrate { name, target } => {
            let handle = state.migrations.request_migration(&name, &target).await?;
            println!(
                "Migrating {} to {} (polling every {}ms, up to {} times)...",
                name,
                target,
                handle.job().poll_interval_ms,
                handle.job().max_attempts
            );
            let job = handle.wait().await?;
            println!(
                "{} {} settled on {} after {} polls",
                "✓".green(),
                name,
                job.target_node,
                job.attempts_made
            );
            return Ok(());
        }
        VmCommands::Start { name } => (name, VmAction::Start),
        VmCommands::Stop { name, force } => (name, VmAction::Stop { force }),
        VmCommands::Enable { name } => (name, VmAction::Enable),
        VmCommands::Disable { name, force } => (name, VmAction::Disable { force }),
        VmCommands::Restart { name } => (name, VmAction::Restart),
        VmCommands::Remove { name } => (name, VmAction::Remove),
        VmCommands::Snapshot { name, snapshot } => (name, VmAction::CreateSnapshot { snapshot }),
        VmCommands::Rollback { name, snapshot } => (name, VmAction::Rollback { snapshot }),
    };

    match state.actions.execute(&name, &action).await? {
        Some(vm) => println!("{} {} {}: now {}", "✓".green(), action, name, colored_state(&vm.state)),
        None => println!("{} {} {}", "✓".green(), action, name),
    }
    Ok(())
}

fn colored_state(state: &str) -> ColoredString {
    paint(state, state)
}

fn paint(state: &str, text: &str) -> ColoredString {
    match state {
        "Started" => text.green(),
        "Stopped" => text.red(),
        "Error" => text.red().bold(),
        _ => text.yellow(),
    }
}

fn print_vm_table(vms: &[VirtualMachineRecord]) {
    println!("{}", "Virtual Machines:".bold());
    if vms.is_empty() {
        println!("  (none)");
        return;
    }

    let width = vms.iter().map(|vm| vm.name.len()).max().unwrap_or(4).max(4);
    println!(
        "  {:<width$}  {:<10}  {:<20}  {}",
        "NAME", "STATE", "DEFAULT NODE", "CURRENT NODE",
        width = width
    );
    for vm in vms {
        // pad before colouring, escape codes would throw the width off
        let state = format!("{:<10}", vm.state);
        println!(
            "  {:<width$}  {}  {:<20}  {}",
            vm.name,
            paint(&vm.state, &state),
            vm.default_node.to_string(),
            vm.current_node,
            width = width
        );
    }
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", target.display());
    }

    std::fs::create_dir_all(&config_dir)?;
    let config_str = toml::to_string_pretty(&generate_default_config())?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration written to {}", "✓".green(), target.display());
    Ok(())
}
