//! tsnodectl: provision and decommission tailnet relay nodes on EC2

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tsnode_provision::{ComputeProvider, ParameterFlags};
use tsnode_state::NodeId;
use tsnodectl::{Context, Layout, UpArgs, node_cmd, state_cmd};

#[derive(Parser)]
#[command(name = "tsnodectl")]
#[command(about = "Provision and decommission single-instance VPN relay nodes")]
#[command(version)]
struct Cli {
    /// Installation directory (default: $TSNODE_HOME or ~/.tsnode)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a new node and join it to the tailnet
    Up {
        /// Pick region, instance type and image from the provider catalogue
        #[arg(short, long)]
        interactive: bool,

        /// Region (e.g. eu-west-1)
        #[arg(short, long)]
        region: Option<String>,

        /// Instance type (e.g. t2.micro)
        #[arg(short = 't', long = "instance-type", visible_alias = "type")]
        instance_type: Option<String>,

        /// Machine image id; taken as-is
        #[arg(short = 'a', long = "ami")]
        image_id: Option<String>,

        /// Advertise the node as an exit node
        #[arg(short, long)]
        exit_node: bool,
    },

    /// Terminate a node and delete everything created for it
    Down {
        /// Node id as shown by `state list`
        id: NodeId,
    },

    /// Inspect local state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Manage stored credentials
    Creds {
        #[command(subcommand)]
        command: CredsCommands,
    },

    /// Print the ssh command line for a node
    Ssh {
        id: NodeId,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List deployed nodes
    List,
    /// Print the raw state document
    Dump,
}

#[derive(Subcommand)]
enum CredsCommands {
    /// Delete the stored credentials
    Delete,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tsnodectl=info,tsnode_provision=info")),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let layout = Layout::resolve(cli.home)?;
    let ctx = Context::load(layout).context("preparing installation directory")?;
    let mut stdout = std::io::stdout().lock();

    match cli.command {
        Commands::State { command } => match command {
            StateCommands::List => state_cmd::list(&ctx.state(), Utc::now(), &mut stdout)?,
            StateCommands::Dump => state_cmd::dump(&ctx.state(), &mut stdout)?,
        },
        Commands::Creds {
            command: CredsCommands::Delete,
        } => state_cmd::delete_credentials(&ctx.credentials(), &mut stdout)?,
        Commands::Up {
            interactive,
            region,
            instance_type,
            image_id,
            exit_node,
        } => {
            let creds = ctx.load_credentials(std::io::stdin().lock(), std::io::stderr())?;
            let provider = ctx.provider(&creds)?;
            let lifecycle = ctx.lifecycle(provider.clone());
            let args = UpArgs {
                interactive,
                flags: ParameterFlags {
                    region,
                    instance_type,
                    image_id,
                },
                exit_node,
            };
            node_cmd::up(
                &lifecycle,
                provider.as_ref(),
                &args,
                &creds.tailscale_auth_key,
                std::io::stdin().lock(),
                &mut stdout,
            )
            .await?;
        }
        Commands::Down { id } => {
            let creds = ctx.load_credentials(std::io::stdin().lock(), std::io::stderr())?;
            let provider: Arc<dyn ComputeProvider> = ctx.provider(&creds)?;
            node_cmd::down(&ctx.lifecycle(provider), id, &mut stdout).await?;
        }
        Commands::Ssh { id } => {
            let creds = ctx.load_credentials(std::io::stdin().lock(), std::io::stderr())?;
            let provider = ctx.provider(&creds)?;
            let line = node_cmd::ssh_command(
                provider.as_ref(),
                &ctx.state(),
                &ctx.keys(),
                &ctx.config.ssh_user,
                id,
            )
            .await?;
            writeln!(stdout, "{line}")?;
        }
    }

    Ok(())
}
