use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use tracing::info;
use veil_keys::prekey::{INITIAL_PREKEY_COUNT, PREKEY_REPLENISH_THRESHOLD};
use veil_keys::{Controller, KeyStore, PersistenceProvider, ProviderRegistry, StoreConfig};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "veil", about = "Inspect and manage Veil client key stores")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persistence root, overrides config
    #[arg(long)]
    root: Option<PathBuf>,

    /// Persistence provider name, overrides config
    #[arg(long)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List client ids with persisted key stores
    List,
    /// Create (or load) a key store and fill its pre-key pool
    Init {
        id: u32,
        /// One-time pre-keys to generate if the pool is empty
        #[arg(long, default_value_t = INITIAL_PREKEY_COUNT)]
        pre_keys: u32,
    },
    /// Print the public state of a key store
    Show { id: u32 },
    /// Top up the pre-key pool once it runs low
    Replenish { id: u32 },
    /// Remove a persisted key store
    Delete { id: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil=info,veil_keys=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let registry = ProviderRegistry::with_builtin();
    let provider = registry
        .resolve(&config)
        .with_context(|| format!("cannot open provider {:?}", config.provider))?;

    info!(root = %config.root.display(), provider = provider.name(), "using key store");

    match args.command {
        Command::List => {
            for id in provider.known_ids()? {
                println!("{id}");
            }
        }
        Command::Init { id, pre_keys } => {
            let store = KeyStore::load(id, provider)?;
            if !store.has_pre_keys() {
                store.generate_pre_keys(pre_keys)?;
            }
            store.dispose()?;
            println!("initialized {id} with {} pre-keys", store.pre_key_count());
        }
        Command::Show { id } => {
            let store = open_existing(id, provider)?;
            print_store(&store);
        }
        Command::Replenish { id } => {
            let store = open_existing(id, provider)?;
            let count = store.pre_key_count() as u32;
            if count >= PREKEY_REPLENISH_THRESHOLD {
                println!("{id} still has {count} pre-keys");
                return Ok(());
            }
            let added = store.generate_pre_keys(INITIAL_PREKEY_COUNT - count)?;
            store.dispose()?;
            println!("added {} pre-keys to {id}", added.len());
        }
        Command::Delete { id } => {
            let store = open_existing(id, provider)?;
            store.delete()?;
            println!("deleted {id}");
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load_from_file(path)
            .with_context(|| format!("failed to load config file: {}", path.display()))?,
        None => StoreConfig::default(),
    };

    // CLI overrides
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(provider) = &args.provider {
        config.provider = provider.clone();
    }
    if let Ok(password) = std::env::var("VEIL_PASSWORD") {
        config.password = Some(Zeroizing::new(password));
    }
    Ok(config)
}

/// Load a store that must already be persisted. Never creates one, and
/// refuses snapshots it cannot read or decode instead of replacing them.
fn open_existing(id: u32, provider: Arc<dyn PersistenceProvider>) -> Result<KeyStore> {
    KeyStore::load_existing(id, provider)
        .with_context(|| format!("cannot open key store {id}"))
}

fn print_store(store: &KeyStore) {
    let b64 = base64::engine::general_purpose::STANDARD;
    let snapshot = store.snapshot();
    let signed = store.signed_key_pair();

    println!("id:               {}", store.id());
    println!("registration id:  {}", store.registration_id());
    println!(
        "identity key:     {}",
        b64.encode(&store.identity_key_pair().public_key)
    );
    println!("signed pre-key:   {} ({})", signed.id, b64.encode(&signed.key_pair.public_key));
    println!(
        "pre-keys:         {} (last id {})",
        store.pre_key_count(),
        store.last_pre_key_id()
    );
    match store.companion() {
        Some(companion) => println!("companion:        {companion}"),
        None => println!("companion:        none"),
    }
    println!("sessions:         {}", snapshot.sessions.len());
    println!("sender keys:      {}", snapshot.sender_keys.len());
    println!("app state keys:   {}", snapshot.app_state_keys.len());
    for state in &snapshot.hash_states {
        println!("  {:<22} version {}", state.sync_type.as_str(), state.version);
    }
}
