use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use rover_relay::config::{FileConfig, DEFAULT_CONFIG_FILE};
use rover_relay::credentials::{CredentialStore, Credentials, FileCredentialStore};
use rover_relay::service::{Collaborators, RemoteControlService, ServiceStatus};
use rover_relay::util::init_log;

#[derive(Parser)]
#[command(name = "rover-relay")]
#[command(about = "Remote control agent: message bus, media signaling and file relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (missing file means defaults plus ROVER_* env vars)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the bus and serve operator requests until stopped
    Run,

    /// Manage the stored device credentials
    #[command(subcommand)]
    Credentials(CredentialCommands),
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Store the credentials issued at pairing
    Set {
        #[arg(long)]
        token: String,
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        client_id: String,
    },
    /// Forget the stored credentials
    Clear,
    /// Print the stored credentials with the token masked
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_log();
    let cli = Cli::parse();
    let config = FileConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let store = FileCredentialStore::new(&config.storage.credentials_path);

    match cli.command {
        Commands::Run => run(config, store).await,
        Commands::Credentials(CredentialCommands::Set {
            token,
            device_id,
            client_id,
        }) => {
            store
                .save(&Credentials {
                    token,
                    device_id,
                    client_id,
                })
                .context("saving credentials")?;
            println!("credentials saved to {}", store.path().display());
            Ok(())
        }
        Commands::Credentials(CredentialCommands::Clear) => {
            store.clear().context("clearing credentials")?;
            println!("credentials cleared");
            Ok(())
        }
        Commands::Credentials(CredentialCommands::Show) => {
            let creds = store.load().context("reading credentials")?;
            if creds.is_empty() {
                println!("no credentials stored");
            } else {
                println!("device_id: {}", creds.device_id);
                println!("client_id: {}", creds.client_id);
                println!("token:     {}", mask(&creds.token));
            }
            Ok(())
        }
    }
}

async fn run(config: FileConfig, store: FileCredentialStore) -> Result<()> {
    let parts = Collaborators::local(&config).context("building collaborators")?;
    let service = RemoteControlService::new(&config, Arc::new(store), parts)
        .context("starting remote control service")?;
    let mut status = service.start();

    let terminal = tokio::select! {
        changed = status.wait_for(ServiceStatus::is_terminal) => {
            changed.map(|s| s.clone()).ok()
        }
        _ = tokio::signal::ctrl_c() => None,
    };

    match terminal {
        None => {
            info!("interrupted, shutting down");
            service.shutdown();
            // Give the writer a moment to flush the logout notice and close frame.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }
        Some(ServiceStatus::AuthRejected) => {
            bail!("bus rejected the device credentials; run `rover-relay credentials set` again")
        }
        Some(other) => bail!("remote control stopped: {other:?}"),
    }
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}***")
}
