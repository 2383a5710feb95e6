mod chat;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use parley_core::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Voice-driven conversation with an AI responder and a talking avatar",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation
    Chat {
        /// Print replies in the terminal instead of starting a HeyGen avatar
        #[arg(long)]
        no_avatar: bool,

        /// Raw 16 kHz mono S16LE PCM file or FIFO to listen on
        #[arg(long)]
        mic: Option<PathBuf>,

        /// Still image a webcam tool keeps overwriting, sampled in vision mode
        #[arg(long)]
        camera: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path (e.g. "speech.auto_resume_delay_ms")
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Chat {
            no_avatar,
            mic,
            camera,
        } => {
            if let Err(e) = chat::check_config(&config, no_avatar) {
                eprintln!("{e}");
                std::process::exit(1);
            }
            chat::run(
                config,
                chat::ChatOptions {
                    no_avatar,
                    mic,
                    camera,
                },
            )
            .await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => {
                    eprintln!("No config value at '{key}'");
                    std::process::exit(1);
                }
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    std::process::exit(1);
                }
                println!("Config OK ({} warnings)", warnings.len());
            }
        },
        Commands::Status => {
            let configured = |ok: bool| if ok { "configured" } else { "missing" };
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!(
                "Responder: {} / {} (key {})",
                config.responder.model,
                config.responder.vision_model,
                configured(config.responder.resolve_api_key().is_some())
            );
            println!(
                "Avatar: {} (key {})",
                config
                    .avatar
                    .resolve_avatar_id()
                    .unwrap_or_else(|| "-".into()),
                configured(config.avatar.resolve_api_key().is_some())
            );
            println!(
                "Transcription: {} (key {})",
                config.transcription.provider,
                configured(config.transcription.resolve_api_key().is_some())
            );
            println!(
                "Vision: every {} ms at JPEG quality {}",
                config.vision.interval_ms, config.vision.jpeg_quality
            );
            let (warnings, errors) = config.validate();
            println!("Checks: {} errors, {} warnings", errors.len(), warnings.len());
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the config file; `--verbose` raises the default to debug.
fn init_logging(config: Option<&LoggingConfig>, verbose: bool) {
    let level = match (verbose, config.and_then(|c| c.level.as_deref())) {
        (true, _) => "debug",
        (false, Some(level)) => level,
        (false, None) => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(level);
        for directive in config.map(|c| c.filters.as_slice()).unwrap_or_default() {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
            }
        }
        filter
    });

    let writer = match config.map(|c| c.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if config.is_some_and(|c| c.format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
