use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use replbox::{AppConfig, AppState, create_router};
use replbox_storage::{S3Store, StorageMirror, TransferOutcome, TransferReport};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const APP_NAME: &str = "replbox";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Storage { command } => async_storage(ctx, command),
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(ctx, cmd).await
}

#[tokio::main]
async fn async_storage(ctx: RuntimeContext, cmd: StorageCommand) -> Result<()> {
    handle_storage(&ctx, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Replbox - workspace session server for a browser-based coding sandbox.",
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
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP/WebSocket server
    Serve(ServeCommand),
    /// Run object storage transfers out of band
    Storage {
        #[command(subcommand)]
        command: StorageCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum StorageCommand {
    /// Download every object under PREFIX into DIR
    Fetch {
        prefix: String,
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Copy every object under SOURCE_PREFIX to DESTINATION_PREFIX
    Copy {
        source_prefix: String,
        destination_prefix: String,
    },
    /// Upload FILE to PREFIX + RELATIVE_PATH
    Save {
        prefix: String,
        relative_path: String,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.clone() {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        let config = load_or_init_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color = env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> String {
        if self.common.quiet {
            return "error".to_string();
        }
        match self.common.verbose {
            0 => self.config.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

async fn handle_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let mut config = ctx.config;
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }

    fs::create_dir_all(&config.workspaces.root).with_context(|| {
        format!(
            "creating workspaces directory {}",
            config.workspaces.root.display()
        )
    })?;
    info!("Workspaces root: {}", config.workspaces.root.display());

    let mirror = match &config.storage {
        Some(storage) => {
            info!("Object storage: bucket {}", storage.bucket);
            Some(build_mirror(&config).await?)
        }
        None => {
            info!(
                "No object storage configured, provisioning from {}",
                config.workspaces.templates_dir.display()
            );
            None
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing listen address")?;

    let state = AppState::new(config, mirror);
    let pty = state.pty.clone();
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on {}", addr);

    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received, terminating {} shell(s)", pty.len());
        pty.terminate_all();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

async fn handle_storage(ctx: &RuntimeContext, cmd: StorageCommand) -> Result<()> {
    let mirror = build_mirror(&ctx.config).await?;

    let report = match cmd {
        StorageCommand::Fetch { prefix, dir } => {
            let dir = expand_path(dir)?;
            mirror.fetch_folder(&prefix, &dir).await
        }
        StorageCommand::Copy {
            source_prefix,
            destination_prefix,
        } => mirror.copy_folder(&source_prefix, &destination_prefix).await,
        StorageCommand::Save {
            prefix,
            relative_path,
            file,
        } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            mirror
                .save(&prefix, &relative_path, content)
                .await
                .with_context(|| format!("saving {prefix}{relative_path}"))?;
            println!("saved {prefix}{relative_path}");
            return Ok(());
        }
    };

    print_report(&report, ctx.common.json)?;
    match report.outcome() {
        TransferOutcome::Completed => Ok(()),
        outcome => bail!("transfer finished with outcome {outcome:?}"),
    }
}

async fn build_mirror(config: &AppConfig) -> Result<StorageMirror> {
    let storage = config
        .storage
        .as_ref()
        .ok_or_else(|| anyhow!("no [storage] section in configuration"))?;
    let store = S3Store::from_config(&storage.s3()).await;
    Ok(StorageMirror::new(Arc::new(store)))
}

fn print_report(report: &TransferReport, json: bool) -> Result<()> {
    let mut stdout = io::stdout().lock();
    if json {
        let body = serde_json::json!({
            "outcome": report.outcome(),
            "report": report,
        });
        writeln!(stdout, "{}", serde_json::to_string_pretty(&body)?)?;
        return Ok(());
    }

    writeln!(
        stdout,
        "{:?}: {} transferred, {} failed, {} page(s)",
        report.outcome(),
        report.transferred.len(),
        report.failed.len(),
        report.pages
    )?;
    for failed in &report.failed {
        writeln!(stdout, "  failed {}: {}", failed.key, failed.error)?;
    }
    if let Some(error) = &report.listing_error {
        writeln!(stdout, "  listing stopped: {error}")?;
    }
    Ok(())
}

fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        write_default_config(config_file)?;
    }

    let built = Config::builder()
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;
    config.workspaces.root = expand_path(config.workspaces.root)?;
    config.workspaces.templates_dir = expand_path(config.workspaces.templates_dir)?;

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
