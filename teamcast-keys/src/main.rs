//! teamcast-keys - Vault key management for Teamcast
//!
//! Creates, rotates and retires the age keys that encrypt stored platform
//! tokens, and migrates stored tokens onto the current key.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use libteamcast::logging::LoggingConfig;
use libteamcast::repository::Repositories;
use libteamcast::{Config, CredentialVault, Database, KeyRing, TeamcastError};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "teamcast-keys")]
#[command(version)]
#[command(about = "Manage the keys that encrypt stored platform tokens", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, env = "TEAMCAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the key file with a first key
    Generate,

    /// Show key versions and how many stored tokens still use older keys
    Status,

    /// Add a new key and make it current
    Rotate,

    /// Re-encrypt every stored token under the current key
    ReencryptAll,

    /// Remove an old key once no stored token uses it
    Retire {
        /// Key version to remove
        version: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run_command(cli).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        let code = e
            .downcast_ref::<TeamcastError>()
            .map(TeamcastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    let keys_file = PathBuf::from(expand_path(&config.vault.keys_file));

    match cli.command {
        Commands::Generate => generate(&keys_file),
        Commands::Status => status(&config, &keys_file).await,
        Commands::Rotate => rotate(&keys_file),
        Commands::ReencryptAll => reencrypt_all(&config, &keys_file).await,
        Commands::Retire { version } => retire(&config, &keys_file, version).await,
    }
}

fn generate(keys_file: &Path) -> Result<()> {
    if keys_file.exists() {
        bail!(
            "key file {} already exists; use 'teamcast-keys rotate' to add a key",
            keys_file.display()
        );
    }
    let ring = KeyRing::generate();
    ring.save(keys_file)?;
    println!("✓ Created {} with key version 1", keys_file.display());
    Ok(())
}

async fn status(config: &Config, keys_file: &Path) -> Result<()> {
    let ring = KeyRing::load(keys_file)?;
    println!("Key file: {}", keys_file.display());
    println!("  Versions: {:?}", ring.versions());
    println!("  Current: {}", ring.current_version());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(keys_file)?.permissions().mode() & 0o777;
        if mode != 0o600 {
            println!("  ⚠ Permissions are {mode:o}; expected 600");
            println!("    Fix: chmod 600 {}", keys_file.display());
        }
    }

    let repos = open_repositories(config).await?;
    let stale = repos
        .tokens
        .accounts_with_key_version_below(ring.current_version())
        .await?;
    if stale.is_empty() {
        println!("✓ All stored tokens use the current key");
    } else {
        println!("⚠ {} stored token(s) use an older key", stale.len());
        println!("  Run: teamcast-keys reencrypt-all");
    }
    Ok(())
}

fn rotate(keys_file: &Path) -> Result<()> {
    let mut ring = KeyRing::load(keys_file)?;
    let version = ring.rotate();
    ring.save(keys_file)?;
    info!(version, "rotated vault key");
    println!("✓ Key version {version} is now current");
    println!("  Restart running services, then run: teamcast-keys reencrypt-all");
    Ok(())
}

async fn reencrypt_all(config: &Config, keys_file: &Path) -> Result<()> {
    let ring = KeyRing::load(keys_file)?;
    let current = ring.current_version();
    let repos = open_repositories(config).await?;
    let vault = CredentialVault::new(repos.tokens.clone(), ring);

    let report = vault.reencrypt_all(Utc::now()).await?;
    println!("Re-encryption under key version {current}:");
    println!("  ✓ Migrated: {}", report.migrated.len());
    println!("  ✗ Failed: {}", report.failed.len());
    for (account_id, error) in &report.failed {
        println!("  ✗ {account_id}: {error}");
    }

    if !report.is_success() {
        bail!("{} stored token(s) could not be re-encrypted", report.failed.len());
    }
    Ok(())
}

async fn retire(config: &Config, keys_file: &Path, version: u32) -> Result<()> {
    let mut ring = KeyRing::load(keys_file)?;
    let repos = open_repositories(config).await?;
    let stale = repos
        .tokens
        .accounts_with_key_version_below(ring.current_version())
        .await?;
    if !stale.is_empty() {
        bail!(
            "{} stored token(s) still use an older key; run 'teamcast-keys reencrypt-all' first",
            stale.len()
        );
    }

    ring.retire(version)?;
    ring.save(keys_file)?;
    info!(version, "retired vault key");
    println!("✓ Retired key version {version}");
    Ok(())
}

async fn open_repositories(config: &Config) -> Result<Repositories> {
    let db = Database::new(&expand_path(&config.database.path)).await?;
    Ok(Repositories::sqlite(db))
}

fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}
