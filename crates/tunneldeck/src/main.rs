mod prompter;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use prompter::TerminalPrompter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use tunneldeck_core::config::{keychain, AppConfig, FileBackup, TunnelStore};
use tunneldeck_core::ports::{PortAllocator, PortTarget};
use tunneldeck_core::TunnelTree;
use tunneldeck_ssh::{
    ConnectOutcome, Connector, ConnectorServices, PromptKind, PromptRequest, Prompter,
    SystemLauncher,
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tunneldeck", version, about = "Tree-organised SSH tunnel manager")]
struct Cli {
    /// Tunnel store to use instead of the one in the config directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the tunnel tree
    List,
    /// Connect tunnels or folders and keep them up until Ctrl-C
    Connect {
        /// Node names, `/`-separated paths or UUIDs
        #[arg(required = true)]
        nodes: Vec<String>,
        /// Start the tunnels without connecting their parents first
        #[arg(long)]
        direct: bool,
    },
    /// Print the client command line a tunnel would be started with
    Command { node: String },
    /// Propose a free local port for a tunnel, or for a new one
    ProposePort {
        /// Existing tunnel to propose for
        node: Option<String>,
        /// Parent of the new tunnel (top level if omitted)
        #[arg(long, conflicts_with = "node")]
        parent: Option<String>,
        /// Ports that must not be proposed
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<u16>,
    },
    /// Run folder populate commands and save the resulting children
    Refresh {
        folder: Option<String>,
        #[arg(long, conflicts_with = "folder")]
        all: bool,
    },
    /// Manage the password database used by `${Password:...}`
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
}

#[derive(Subcommand, Debug)]
enum PasswordAction {
    /// List entries and whether the keychain holds their secret
    List,
    /// Store a secret, read from stdin, under a description
    Set {
        description: String,
        #[arg(long, default_value = "")]
        login: String,
    },
    /// Remove an entry and its keychain secret
    Remove { description: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tunneldeck=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!("Starting TunnelDeck v{}", tunneldeck_core::VERSION);

    let config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let store_path = cli.store.clone().unwrap_or_else(TunnelStore::store_path);
    let mut store = TunnelStore::load_from(&store_path)
        .with_context(|| format!("Failed to load {}", store_path.display()))?;
    tracing::info!(
        "Loaded {} tunnels, {} variables",
        store.tree().tunnel_count(),
        store.variables.len()
    );

    match cli.command {
        Commands::List => print_tree(&store.tree()),
        Commands::Command { node } => {
            let mut connector = build_connector(config, &store);
            let id = lookup(connector.tree(), &node)?;
            let command = connector.command_line(id).await?;
            println!("{}", command.display());
        }
        Commands::ProposePort {
            node,
            parent,
            exclude,
        } => {
            let tree = store.tree();
            let target = match (node, parent) {
                (Some(node), _) => PortTarget::Existing(lookup(&tree, &node)?),
                (None, Some(parent)) => PortTarget::NewChildOf(Some(lookup(&tree, &parent)?)),
                (None, None) => PortTarget::NewChildOf(None),
            };
            match PortAllocator::new(&tree).propose(target, None, &exclude) {
                0 => bail!("No free local port left"),
                port => println!("{}", port),
            }
        }
        Commands::Connect { nodes, direct } => {
            let mut connector = build_connector(config, &store);
            connect(&mut connector, &nodes, direct).await?;
            store.set_tree(connector.tree());
            store.save_to(&store_path)?;
        }
        Commands::Refresh { folder, all } => {
            let mut connector = build_connector(config, &store);
            refresh(&mut connector, folder.as_deref(), all).await?;
            store.set_tree(connector.tree());
            store.save_to(&store_path)?;
        }
        Commands::Password { action } => {
            if password(&mut store, action)? {
                store.save_to(&store_path)?;
            }
        }
    }
    Ok(())
}

fn build_connector(config: AppConfig, store: &TunnelStore) -> Connector {
    let credentials = keychain::load_credentials(&store.passwords);
    Connector::new(
        store.tree(),
        ConnectorServices {
            variables: store.variables.clone(),
            credentials: Box::new(credentials),
            config,
            prompter: Box::new(TerminalPrompter),
            launcher: Arc::new(SystemLauncher),
            backup: Box::new(FileBackup::new(TunnelStore::backup_dir())),
            app_dir: AppConfig::app_dir(),
            data_dir: AppConfig::data_dir(),
        },
    )
}

fn lookup(tree: &TunnelTree, query: &str) -> Result<Uuid> {
    tree.find(query)
        .ok_or_else(|| anyhow!("No unique node named '{}'", query))
}

fn print_tree(tree: &TunnelTree) {
    for id in tree.walk(None) {
        let Some(node) = tree.get(id) else {
            continue;
        };
        let indent = "  ".repeat(tree.depth(id));
        if !node.is_tunnel() {
            println!("{}{}/", indent, node.name());
            continue;
        }
        let cfg = &node.config;
        let remote = match cfg.selected_remote_host() {
            "" => "localhost",
            host => host,
        };
        println!(
            "{}{}  {} -> {}:{} via {}",
            indent,
            node.name(),
            cfg.local_port,
            remote,
            cfg.remote_port,
            cfg.selected_ssh_host()
        );
        for forward in cfg.port_forwards.iter().filter(|f| f.enabled) {
            println!("{}    {}", indent, forward.description());
        }
    }
}

async fn connect(connector: &mut Connector, nodes: &[String], direct: bool) -> Result<()> {
    let ids = nodes
        .iter()
        .map(|n| lookup(connector.tree(), n))
        .collect::<Result<Vec<_>>>()?;

    let mut status = connector.subscribe();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(change) => println!("{}: {}", change.name, change.status.label()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut started = 0;
    for id in ids {
        let outcome = if direct {
            connector.connect_direct(id).await?
        } else {
            connector.request_connect(id).await?
        };
        if outcome != ConnectOutcome::Failed {
            started += 1;
        }
    }
    if started == 0 {
        bail!("Nothing could be connected");
    }

    connector
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    tracing::info!("Shutting down");
    connector.disconnect_all().await;
    Ok(())
}

/// Returns whether the manifest changed.
fn password(store: &mut TunnelStore, action: PasswordAction) -> Result<bool> {
    match action {
        PasswordAction::List => {
            let credentials = keychain::load_credentials(&store.passwords);
            for entry in credentials.entries() {
                let state = if entry.password.is_empty() {
                    "no secret"
                } else {
                    "stored"
                };
                println!("{}  login={}  ({})", entry.description, entry.login, state);
            }
            Ok(false)
        }
        PasswordAction::Set { description, login } => {
            let prompt = PromptRequest {
                node: Uuid::nil(),
                node_name: description.clone(),
                kind: PromptKind::Password,
                prompt: "Secret:".to_string(),
            };
            let Some(secret) = TerminalPrompter.ask(&prompt) else {
                bail!("No secret given");
            };
            let id = store.upsert_password(&description, &login);
            keychain::store_secret(id, &secret)?;
            tracing::info!("Stored password '{}'", description);
            Ok(true)
        }
        PasswordAction::Remove { description } => {
            let entry = store
                .remove_password(&description)
                .ok_or_else(|| anyhow!("No password named '{}'", description))?;
            keychain::delete_secret(entry.uuid)?;
            tracing::info!("Removed password '{}'", description);
            Ok(true)
        }
    }
}

async fn refresh(connector: &mut Connector, folder: Option<&str>, all: bool) -> Result<()> {
    let folders = match (folder, all) {
        (Some(folder), _) => {
            let id = lookup(connector.tree(), folder)?;
            connector.refresh_folder(id)?;
            vec![id]
        }
        (None, true) => {
            if connector.refresh_all() == 0 {
                bail!("No folder has a child command");
            }
            Vec::new()
        }
        (None, false) => bail!("Name a folder or pass --all"),
    };

    while connector.is_populating() {
        if !connector.step().await {
            break;
        }
    }
    for id in folders {
        if let Some(line) = connector.log(id).and_then(|log| log.last()) {
            println!("{}", line);
        }
    }
    Ok(())
}
