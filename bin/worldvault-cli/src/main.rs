//! WorldVault CLI - Admin Command Line Interface
//!
//! This binary provides administrative commands for stored worlds.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worldvault_common::config::BackendKind;
use worldvault_common::{Config, WorldName};
use worldvault_format::DEFAULT_HEIGHT;
use worldvault_session::{LeaseSweeper, OpenMode, OpenOptions, WorldManager, WorldSession};

#[derive(Parser, Debug)]
#[command(name = "worldvault-cli")]
#[command(about = "WorldVault Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "WORLDVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored worlds
    List,
    /// Show a world's header, metadata and lock state
    Inspect {
        name: WorldName,
        /// Report damaged chunks instead of failing
        #[arg(long)]
        partial: bool,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create an empty world
    Create {
        name: WorldName,
        /// World height in blocks
        #[arg(long, default_value_t = DEFAULT_HEIGHT)]
        height: u16,
    },
    /// Delete a world
    Delete { name: WorldName },
    /// Copy a world under a new name
    #[command(name = "clone")]
    CloneWorld { source: WorldName, target: WorldName },
    /// Move a world between backends
    Migrate {
        name: WorldName,
        #[arg(long)]
        from: BackendKind,
        #[arg(long)]
        to: BackendKind,
    },
    /// Break a stale lease left by a crashed holder
    Unlock { name: WorldName },
    /// Remove expired lease records of deleted worlds
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if config.storage.backend == BackendKind::None {
        bail!("the in-memory backend does not persist anything; choose another storage.backend");
    }
    let manager = WorldManager::from_config(&config).context("failed to open storage")?;

    match args.command {
        Commands::List => {
            let names = manager.list().await?;
            if names.is_empty() {
                println!("No worlds");
            }
            for name in names {
                let marker = if manager.is_locked(&name).await? {
                    " (locked)"
                } else {
                    ""
                };
                println!("{name}{marker}");
            }
        }
        Commands::Inspect {
            name,
            partial,
            json,
        } => inspect(&manager, &name, partial, json).await?,
        Commands::Create { name, height } => {
            manager
                .create_empty(&name, height, OpenMode::ReadOnly)
                .await?;
            println!("Created world: {name}");
        }
        Commands::Delete { name } => {
            manager.delete(&name).await?;
            println!("Deleted world: {name}");
        }
        Commands::CloneWorld { source, target } => {
            manager.clone_world(&source, &target).await?;
            println!("Cloned world: {source} -> {target}");
        }
        Commands::Migrate { name, from, to } => {
            manager.migrate(&name, from, to).await?;
            println!("Migrated world: {name} ({from} -> {to})");
        }
        Commands::Unlock { name } => match manager.unlock(&name).await? {
            Some(lease) => println!(
                "Released lease on {name} held by {} (epoch {})",
                lease.owner, lease.epoch
            ),
            None => println!("World {name} is not locked"),
        },
        Commands::Sweep => {
            let removed = LeaseSweeper::from_context(manager.context())
                .sweep_once()
                .await?;
            println!("Removed {removed} orphaned lease records");
        }
    }

    info!("Done");
    Ok(())
}

async fn inspect(
    manager: &WorldManager,
    name: &WorldName,
    partial: bool,
    json: bool,
) -> Result<()> {
    let options = OpenOptions::new(OpenMode::ReadOnly).allow_partial(partial);
    let session = WorldSession::open_with(manager.context().clone(), name, options)
        .await
        .with_context(|| format!("failed to open world {name}"))?;
    let holder = manager.lock_holder(name).await?;
    let world = session.world();
    let spawn = &world.metadata.spawn;
    let damaged: Vec<String> = session
        .load_errors()
        .iter()
        .map(ToString::to_string)
        .collect();

    if json {
        let value = serde_json::json!({
            "name": name.as_str(),
            "version": world.version,
            "height": world.height,
            "chunks": world.chunk_count(),
            "maps": world.maps.len(),
            "extra_bytes": world.extra.len(),
            "spawn": { "x": spawn.x, "y": spawn.y, "z": spawn.z, "angle": spawn.angle },
            "game_rules": world.metadata.game_rules,
            "locked_by": holder.map(|lease| lease.owner.to_string()),
            "damaged": damaged,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("World: {name}");
    println!("  Format version: {}", world.version);
    println!("  Height:         {}", world.height);
    println!("  Chunks:         {}", world.chunk_count());
    println!("  Maps:           {}", world.maps.len());
    println!("  Extra data:     {} bytes", world.extra.len());
    println!(
        "  Spawn:          {}, {}, {} ({:.1})",
        spawn.x, spawn.y, spawn.z, spawn.angle
    );
    for (rule, value) in &world.metadata.game_rules {
        println!("  Rule {rule}: {value}");
    }
    match holder {
        Some(lease) => println!("  Locked by:      {} (epoch {})", lease.owner, lease.epoch),
        None => println!("  Locked by:      -"),
    }
    for error in &damaged {
        println!("  Damaged: {error}");
    }
    Ok(())
}
