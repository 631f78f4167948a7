use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use copilot_router::Mode;
use copilot_router::cli::{CommandContext, build_request, commands, context_entries, parse_mode};

#[derive(Parser)]
#[command(name = "copilot-router")]
#[command(
    version,
    about = "Mode-aware LLM router with failover, response caching and safe streaming"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration from this file only (skips global/project layering)
    #[arg(long, short, global = true, env = "COPILOT_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

/// Request context shared by chat, stream and classify
#[derive(Args)]
struct ContextArgs {
    #[arg(long, help = "Tenant id (cache scope)")]
    tenant: Option<String>,
    #[arg(long, help = "Program track, e.g. IMPULSO")]
    track: Option<String>,
    #[arg(long, help = "Program phase")]
    phase: Option<String>,
    #[arg(long = "context", short = 'C', value_name = "KEY=VALUE", help = "Request context entry (repeatable)")]
    context: Vec<String>,
}

impl ContextArgs {
    fn entries(&self) -> Vec<String> {
        context_entries(
            self.tenant.as_deref(),
            self.track.as_deref(),
            self.phase.as_deref(),
            &self.context,
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message through the router
    Chat {
        #[arg(help = "Message to send")]
        message: String,
        #[arg(long, short, value_parser = parse_mode, help = "Mode (classified when omitted)")]
        mode: Option<Mode>,
        #[command(flatten)]
        context: ContextArgs,
        #[arg(long, short, help = "Stream the answer incrementally")]
        stream: bool,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Stream a message's answer, printing events as they arrive
    Stream {
        #[arg(help = "Message to send")]
        message: String,
        #[arg(long, short, value_parser = parse_mode, help = "Mode (classified when omitted)")]
        mode: Option<Mode>,
        #[command(flatten)]
        context: ContextArgs,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Show which mode a message would be routed to
    Classify {
        #[arg(help = "Message to classify")]
        message: String,
        #[command(flatten)]
        context: ContextArgs,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Show usage, cache and circuit breaker metrics
    Metrics {
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(
            short = 'f',
            long,
            default_value = "toml",
            help = "Output format: toml, json, yaml"
        )]
        format: String,
    },
    /// Show configuration file paths
    Path,
    /// Initialize configuration
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mcopilot-router encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    // Logs go to stderr so streamed answers and JSON stay clean on stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Chat {
            message,
            mode,
            context,
            stream,
            format,
        } => {
            let request = build_request(&message, mode, &context.entries())?;
            let rt = Runtime::new()?;
            rt.block_on(async {
                let ctx = CommandContext::load(config_path)?;
                if stream {
                    commands::chat::stream(&ctx, request, &format).await
                } else {
                    commands::chat::run(&ctx, request, &format).await
                }
            })?;
        }
        Commands::Stream {
            message,
            mode,
            context,
            format,
        } => {
            let request = build_request(&message, mode, &context.entries())?;
            let rt = Runtime::new()?;
            rt.block_on(async {
                let ctx = CommandContext::load(config_path)?;
                commands::chat::stream(&ctx, request, &format).await
            })?;
        }
        Commands::Classify {
            message,
            context,
            format,
        } => {
            let request = build_request(&message, None, &context.entries())?;
            let rt = Runtime::new()?;
            rt.block_on(async {
                let ctx = CommandContext::load(config_path)?;
                commands::classify::run(&ctx, request, &format).await
            })?;
        }
        Commands::Metrics { format } => {
            let ctx = CommandContext::load(config_path)?;
            commands::metrics::run(&ctx, &format)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                commands::config::show(config_path, &format)?;
            }
            ConfigAction::Path => {
                commands::config::path()?;
            }
            ConfigAction::Init { global, force } => {
                commands::config::init(global, force)?;
            }
        },
    }

    Ok(())
}
