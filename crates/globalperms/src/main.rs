use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use globalperms::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use globalperms::{AppConfig, GlobalPermissions, observability};
use globalperms_core::{User, UserId};

#[derive(Parser)]
#[command(name = "globalperms", version, about = "Inspect and manage global group permissions")]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, env = "GLOBALPERMS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a user's global groups, one per line
    Groups { user_id: i64 },
    /// Print whether a user is in a bot group
    IsBot { user_id: i64 },
    /// Drop a user's cached groups on every shard
    Purge { user_id: i64 },
    /// Validate the configuration and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    observability::init_tracing_with_level("warn");

    let cli = Cli::parse();

    let cfg = match load_config(Some(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    observability::apply_logging_level(cli.log_level.as_deref().unwrap_or(&cfg.logging.level));

    match run(cli.command, cfg).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Runs one command and returns the process exit code.
async fn run(command: Commands, cfg: AppConfig) -> Result<i32> {
    if let Commands::CheckConfig = command {
        print_summary(&cfg);
        return Ok(0);
    }

    let permissions = GlobalPermissions::from_config(&cfg)
        .await
        .context("failed to initialize global permissions")?;

    match command {
        Commands::Groups { user_id } => {
            let resolution = permissions.groups_for_user_id(user_id).await;
            for group in &resolution.groups {
                println!("{group}");
            }
            for failure in &resolution.failures {
                eprintln!("shard unavailable: {failure}");
            }
            Ok(if resolution.is_complete() { 0 } else { 1 })
        }
        Commands::IsBot { user_id } => {
            let user = User::registered(user_id, format!("#{user_id}"));
            let is_bot = permissions.is_bot(&user).await?;
            println!("{is_bot}");
            Ok(0)
        }
        Commands::Purge { user_id } => {
            permissions
                .purge(UserId::new(user_id))
                .await
                .context("failed to purge cached groups")?;
            println!("purged cached groups for user {user_id}");
            Ok(0)
        }
        Commands::CheckConfig => Ok(0),
    }
}

fn print_summary(cfg: &AppConfig) {
    println!("configuration OK");
    println!("local shard: {}", cfg.permissions.local_shard);
    for shard in &cfg.permissions.shards {
        println!("shard {}: {}", shard.id, shard.allow.join(", "));
    }
    for pin in &cfg.permissions.pinned {
        println!("pinned {}: {:?}", pin.group, pin.users);
    }
    println!(
        "cache: fresh {}s, stale {}s, {}",
        cfg.cache.fresh_ttl_secs,
        cfg.cache.stale_ttl_secs,
        if cfg.redis.enabled { "redis" } else { "local" }
    );
}
