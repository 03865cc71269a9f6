//! Strategy vault daemon
//!
//! `vaultd serve` restores the registry from SQLite and exposes the read-only
//! query API. `vaultd replay` runs a JSON operation script against an
//! in-memory registry and prints the resulting report.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strategy_vault::api::create_router;
use strategy_vault::replay::{run_script, ReplayScript};
use strategy_vault::vault::access::{Role, RoleTable};
use strategy_vault::vault::asset::TokenRegistry;
use strategy_vault::vault::clock::SystemClock;
use strategy_vault::vault::VaultDb;
use strategy_vault::{Address, VaultConfig, VaultRegistry};

#[derive(Parser, Debug)]
#[command(name = "vaultd", about = "Strategy vault accounting service")]
struct Cli {
    /// TOML config file (falls back to VAULT_CONFIG_PATH / vault_config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore persisted vaults and serve the query API
    Serve {
        #[arg(long, env = "VAULT_BIND_ADDR")]
        bind: Option<String>,

        #[arg(long, env = "VAULT_DB_PATH")]
        db: Option<String>,

        /// Registry owner allowed to rotate the vault implementation
        #[arg(long, env = "VAULT_REGISTRY_OWNER", default_value = "0xowner")]
        owner: String,
    },
    /// Run an operation script and print the final report
    Replay {
        #[arg(long)]
        script: PathBuf,

        /// Write the resulting registry into the database
        #[arg(long, default_value_t = false)]
        persist: bool,

        #[arg(long, env = "VAULT_DB_PATH")]
        db: Option<String>,
    },
}

fn load_env() {
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for path in candidates {
        if path.exists() {
            let _ = dotenv::from_path(&path);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strategy_vault=info,vaultd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => VaultConfig::from_env(),
    };

    match cli.command {
        Command::Serve { bind, db, owner } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            let db_path = db.unwrap_or_else(|| config.db_path.clone());
            serve(&config, &bind, &db_path, &owner).await
        }
        Command::Replay {
            script,
            persist,
            db,
        } => {
            let db_path = db.unwrap_or_else(|| config.db_path.clone());
            replay(&config, &script, persist.then_some(db_path.as_str())).await
        }
    }
}

// =============================================================================
// SERVE
// =============================================================================

async fn serve(config: &VaultConfig, bind: &str, db_path: &str, owner: &str) -> Result<()> {
    let db = VaultDb::new(db_path).with_context(|| format!("open database {}", db_path))?;
    info!(db_path, "vault database opened");

    // Asset ledgers must exist before restored vaults bind to them
    let tokens = Arc::new(TokenRegistry::new());
    if let Some((_, rows)) = db.load_registry().await? {
        for row in &rows {
            match db.load_vault_storage(&row.address).await? {
                Some(storage) => {
                    tokens.ensure(&storage.profile.asset, "", storage.profile.asset_decimals);
                }
                None => warn!(vault = %row.address, "registry row without stored vault"),
            }
        }
    }

    let owner_policy = Arc::new(RoleTable::new().with(&Address::new(owner), Role::Owner));
    let registry = VaultRegistry::restore(
        &db,
        owner_policy,
        tokens,
        Arc::new(SystemClock),
        &Address::new(&config.implementation),
        config.vault_defaults(),
    )
    .await
    .context("restore vault registry")?;

    info!(
        vaults = registry.get_vault_count(),
        implementation = %registry.vault_implementation(),
        "registry ready"
    );

    let app = create_router(Arc::new(registry)).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    info!("vault API listening on {}", bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// =============================================================================
// REPLAY
// =============================================================================

async fn replay(config: &VaultConfig, script_path: &Path, persist_to: Option<&str>) -> Result<()> {
    let raw = std::fs::read_to_string(script_path)
        .with_context(|| format!("read script {}", script_path.display()))?;
    let script: ReplayScript = serde_json::from_str(&raw)
        .with_context(|| format!("parse script {}", script_path.display()))?;

    let (env, report) = run_script(&script, config)?;
    info!(
        steps = report.steps.len(),
        vaults = report.vaults.len(),
        "replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(db_path) = persist_to {
        let db = VaultDb::new(db_path).with_context(|| format!("open database {}", db_path))?;
        env.registry.persist(&db).await?;
        info!(db_path, "replay state persisted");
    }
    Ok(())
}
