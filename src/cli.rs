use crate::command;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "agentbox")]
#[command(about = "Select, provision, and reconcile container backends for agent sandboxes")]
struct Cli {
    /// Path to the config file (default: ~/.config/agentbox/config.yaml)
    #[arg(long, global = true, env = "AGENTBOX_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change the sandbox container backend
    Backend {
        /// Print the effective backend as JSON without prompting
        #[arg(long, conflicts_with = "set")]
        json: bool,

        /// Set the backend non-interactively (docker or podman)
        #[arg(long, value_name = "BACKEND")]
        set: Option<String>,

        /// Apply to a single agent instead of the global default
        #[arg(long, value_name = "ID")]
        agent: Option<String>,
    },

    /// Prepare this host for rootless Podman
    Provision,

    /// List registered containers and their live state
    #[command(visible_alias = "ls")]
    List {
        /// List browser containers instead of sandbox containers
        #[arg(long)]
        browser: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove containers on every backend and drop them from the registry
    #[command(visible_alias = "rm")]
    Remove {
        /// Container names to remove
        #[arg(conflicts_with_all = ["all", "agent"], num_args = 0..)]
        names: Vec<String>,

        /// Remove every registered container
        #[arg(long, conflicts_with = "agent")]
        all: bool,

        /// Remove every container owned by this agent
        #[arg(long, value_name = "ID")]
        agent: Option<String>,

        /// Operate on browser containers
        #[arg(long)]
        browser: bool,

        /// Skip the confirmation prompt for bulk removal
        #[arg(short, long)]
        force: bool,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config;

    match cli.command {
        Commands::Backend { json, set, agent } => command::backend::run(config, json, set, agent),
        Commands::Provision => command::provision::run(),
        Commands::List { browser, json } => command::list::run(config, browser, json),
        Commands::Remove {
            names,
            all,
            agent,
            browser,
            force,
        } => command::remove::run(config, names, all, agent, browser, force),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
