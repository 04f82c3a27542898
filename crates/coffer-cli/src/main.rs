use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use coffer_core::{AuthSession, UnlockOutcome, VaultConfig, VaultSession};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(author, version, about = "Coffer encrypted vault", long_about = None)]
struct Cli {
    /// Overrides the data directory (also COFFER_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every stored key
    Keys,
    /// Print the payload stored under a key
    Get { key: String },
    /// Replace the payload under a key with a JSON value
    Set { key: String, json: String },
    /// Delete a key locally and from the remote mirror
    Remove { key: String },
    /// Unlock, reconcile with the remote and report what moved
    Sync,
    /// Write every readable payload to a backup file
    Export { file: PathBuf },
    /// Load a backup file produced by `export`
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config = match cli.data_dir {
        Some(dir) => VaultConfig::load_from(dir)?,
        None => VaultConfig::load()?,
    };
    let auth = Arc::new(AuthSession::from_env());
    let session = Arc::new(VaultSession::from_config(&config, auth)?);
    let _watcher = session.watch_sign_out();

    let passphrase = prompt_passphrase("Vault passphrase: ")?;
    let outcome = session.unlock(&passphrase).await?;
    drop(passphrase);
    if !outcome.report.skipped.is_empty() {
        eprintln!(
            "warning: {} record(s) could not be decrypted: {}",
            outcome.report.skipped.len(),
            outcome.report.skipped.join(", ")
        );
    }

    let result = run(&session, cli.command, &outcome);
    session.flush_mirror().await;
    session.lock();
    result
}

fn run(session: &VaultSession, command: Commands, outcome: &UnlockOutcome) -> Result<()> {
    match command {
        Commands::Keys => {
            for key in session.keys()? {
                println!("{key}");
            }
        }
        Commands::Get { key } => {
            let value = session
                .get(&key)
                .ok_or_else(|| anyhow!("no readable value for {key}"))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Set { key, json } => {
            let payload: Value =
                serde_json::from_str(&json).context("payload is not valid JSON")?;
            if !session.set(&key, payload) {
                return Err(anyhow!("failed to store {key}"));
            }
        }
        Commands::Remove { key } => session.remove(&key),
        Commands::Sync => {
            if outcome.verified_offline {
                println!("remote unreachable; unlocked offline, nothing reconciled");
            }
            for key in &outcome.sync.migrated_keys {
                println!("migrated {key}");
            }
            for key in &outcome.sync.failed_keys {
                println!("failed   {key}");
            }
        }
        Commands::Export { file } => {
            let snapshot = session.export_all()?;
            std::fs::write(&file, snapshot.to_json_pretty()?)
                .with_context(|| format!("writing {}", file.display()))?;
            info!(entries = snapshot.len(), path = %file.display(), "exported backup");
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            if !session.import_json(&raw)? {
                return Err(anyhow!("some entries failed to import"));
            }
            info!(path = %file.display(), "imported backup");
        }
    }
    Ok(())
}

fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("COFFER_PASSPHRASE") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}
