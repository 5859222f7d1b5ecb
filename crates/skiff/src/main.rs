use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info};
use tokio::net::TcpListener;

use skiff::config::AppConfig;
use skiff::{AppContext, api, check_engine};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = AppConfig::load(cli.common.config.as_deref())?;
    debug!("resolved config: {config:#?}");

    match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
        Command::Config { command } => handle_config(config, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Skiff - containerized agent session server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Override the bind address
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
}

fn init_logging(opts: &CommonOpts) {
    let level = if opts.quiet {
        LevelFilter::Error
    } else {
        match opts.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();
}

#[tokio::main]
async fn run_serve(mut config: AppConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(bind) = cmd.bind {
        config.bind_addr = bind;
    }

    let ctx = Arc::new(AppContext::initialize(config).await?);
    check_engine(&ctx.engine).await;
    ctx.start();

    let router = api::create_router(ctx.clone());
    let listener = TcpListener::bind(&ctx.config.bind_addr)
        .await
        .with_context(|| format!("binding {}", ctx.config.bind_addr))?;
    info!("listening on {}", ctx.config.bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    ctx.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

fn handle_config(config: AppConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = toml::to_string_pretty(&config).context("rendering config")?;
            print!("{rendered}");
            Ok(())
        }
    }
}
