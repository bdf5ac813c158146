use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use logroll::config::{default_config_paths, load_config, resolve_config_path, Config, GlobalConfig};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "logroll")]
#[command(about = "Hourly log rollups for object storage", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pass for each configured plugin
    Run {
        /// Only run the named plugin sections (repeatable)
        #[arg(long = "plugin")]
        plugins: Vec<String>,

        /// Evaluate windows as if it were this time (RFC 3339)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Summarize storage node databases into stats files under log_dir
    Collect {
        /// Only collect for the named plugin sections (repeatable)
        #[arg(long = "plugin")]
        plugins: Vec<String>,

        /// Stamp stats files with this hour instead of the current one (RFC 3339)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Upload log files from each plugin's log_dir into its source container
    Ship {
        /// Only ship for the named plugin sections (repeatable)
        #[arg(long = "plugin")]
        plugins: Vec<String>,

        /// Apply new_log_cutoff as if it were this time (RFC 3339)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Print the progress marker of every plugin as JSON
    Status,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run { plugins, now }) => {
            let config = load_or_exit(config_path)?;
            init_logging(&config.global)?;
            if !logroll::cli::run::run(&config, &plugins, now).await? {
                std::process::exit(1);
            }
        }
        None => {
            // Default behavior is to run every plugin
            let config = load_or_exit(config_path)?;
            init_logging(&config.global)?;
            if !logroll::cli::run::run(&config, &[], None).await? {
                std::process::exit(1);
            }
        }
        Some(Commands::Collect { plugins, now }) => {
            let config = load_or_exit(config_path)?;
            init_logging(&config.global)?;
            if !logroll::cli::collect::collect(&config, &plugins, now).await? {
                std::process::exit(1);
            }
        }
        Some(Commands::Ship { plugins, now }) => {
            let config = load_or_exit(config_path)?;
            init_logging(&config.global)?;
            if !logroll::cli::ship::ship(&config, &plugins, now).await? {
                std::process::exit(1);
            }
        }
        Some(Commands::Status) => {
            let config = load_or_exit(config_path)?;
            init_logging(&config.global)?;
            logroll::cli::status::status(&config).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                logroll::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                logroll::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}

fn load_or_exit(config_path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        eprintln!("Error: config not found");
        eprintln!("Searched locations:");
        for path in default_config_paths() {
            eprintln!("  {}", path.display());
        }
        eprintln!("\nUse --config <path> to specify a config file, or run 'logroll config init' to generate one.");
        std::process::exit(1);
    };

    Ok(load_config(&config_path)?)
}

/// Filter precedence: `RUST_LOG`, then `global.log_level`, then `logroll=info`.
fn init_logging(global: &GlobalConfig) -> Result<(), Box<dyn std::error::Error>> {
    let level = global
        .log_level
        .as_deref()
        .map(|level| match level.to_lowercase().as_str() {
            "warning" => "warn".to_string(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("logroll={}", level)));

    let file_layer = match global.log_dir.as_deref() {
        Some(dir) => Some(fmt::layer().with_ansi(false).with_writer(open_log_file(dir)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    tracing::debug!(
        log_dir = ?global.log_dir,
        log_facility = ?global.log_facility,
        user = ?global.user,
        "Logging initialized"
    );
    Ok(())
}

fn open_log_file(dir: &Path) -> std::io::Result<Mutex<std::fs::File>> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("logroll.log"))?;
    Ok(Mutex::new(file))
}
