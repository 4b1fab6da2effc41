use clap::{Parser, Subcommand, ValueEnum};
use fixtest::config::HarnessConfig;
use fixtest::database::Database;
use fixtest::{fsx, loader, suite::SuiteState};
use std::path::PathBuf;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PruneTarget {
    /// Every harness-owned cache directory
    All,
    /// The pristine download cache
    Download,
    /// The install cache (overlays, dumps, cached configs)
    Install,
    /// The general-purpose cache exposed as {CACHE_DIR}
    General,
}

#[derive(Parser)]
#[command(name = "fixtest")]
#[command(about = "Fixture cache and ephemeral environment manager for end-to-end CLI tests")]
#[command(version)]
struct Cli {
    /// Path to fixtest.yaml / fixtest.toml (defaults to probing the cwd)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the resolved configuration, bin path and subprocess environment
    Info,
    /// Delete cached fixtures
    Prune {
        /// Which caches to delete
        #[arg(default_value = "all")]
        target: PruneTarget,
    },
    /// Verify the fixture database is reachable
    CheckDb,
    /// Output the JSON schema of the config file
    Schema,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match loader::resolve_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Info => {
            println!("product:         {}", config.product);
            println!("tool:            {}", config.tool);
            println!("interpreter:     {}", config.interpreter);
            match config.resolve_bin_dir() {
                Some(dir) => println!("bin dir:         {}", dir.display()),
                None => println!("bin dir:         (not found)"),
            }
            println!("temp root:       {}", config.temp_root.display());
            println!("download cache:  {}", config.download_cache_dir().display());
            println!("install cache:   {}", config.install_cache_dir().display());
            println!("general cache:   {}", config.general_cache_dir().display());
            println!("isolated home:   {}", config.home_dir().display());
            println!("db driver:       {:?}", config.db.driver);
            println!("db name:         {}", config.db.name);

            let suite = SuiteState::new(config);
            match suite.process_env() {
                Ok(env) => {
                    println!("\nsubprocess environment:");
                    let mut keys: Vec<_> = env.keys().collect();
                    keys.sort();
                    for key in keys {
                        println!("  {key}={}", env[key]);
                    }
                }
                Err(e) => {
                    eprintln!("Error building subprocess environment: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Prune { target } => {
            let mut dirs = Vec::new();
            if matches!(target, PruneTarget::All | PruneTarget::Download) {
                dirs.push(config.download_cache_dir());
            }
            if matches!(target, PruneTarget::All | PruneTarget::Install) {
                dirs.push(config.install_cache_dir());
            }
            if matches!(target, PruneTarget::All | PruneTarget::General) {
                dirs.push(config.general_cache_dir());
            }

            let mut errors = 0;
            for dir in dirs {
                match fsx::remove_dir(&dir) {
                    Ok(()) => println!("removed: {}", dir.display()),
                    Err(e) => {
                        eprintln!("Error removing {}: {e}", dir.display());
                        errors += 1;
                    }
                }
            }
            if errors > 0 {
                std::process::exit(1);
            }
        }
        Command::CheckDb => {
            let db = Database::new(config.db.clone());
            match db.check_connection() {
                Ok(()) => println!("database reachable ({:?})", config.db.driver),
                Err(e) => {
                    eprintln!("Database check failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Schema => {
            let schema = schemars::schema_for!(HarnessConfig);
            let json = serde_json::to_string_pretty(&schema).expect("Failed to serialize schema");
            println!("{json}");
        }
    }
}
