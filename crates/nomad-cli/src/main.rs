use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nomad_channels::{
    stdio, AppContext, CommandFolderPicker, NoDialogHost, ShellHost, ShellRelay, TransportManager,
    WebTransport,
};
use nomad_config::{find_settings_path, load_settings, resolve_path, ServerSettings};
use nomad_core::{BinaryRegistry, BinarySource, ConfigStore};

#[derive(Parser)]
#[command(name = "nomad", about = "Workspace instance orchestrator", version)]
struct Cli {
    /// Path to server settings file
    #[arg(short, long, env = "NOMAD_SETTINGS")]
    settings: Option<PathBuf>,

    /// Path to the user config document (overrides settings)
    #[arg(short, long, env = "NOMAD_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and event stream
    Serve {
        /// Address to bind
        #[arg(long, env = "NOMAD_HOST")]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long, env = "NOMAD_PORT")]
        port: Option<u16>,
    },
    /// Relay for an embedded desktop shell over stdin/stdout
    Shell {
        /// Do not start the HTTP API alongside the relay
        #[arg(long)]
        no_web: bool,

        /// Port for the HTTP API
        #[arg(short, long, env = "NOMAD_PORT")]
        port: Option<u16>,
    },
    /// Show settings, binary resolution and server state
    Status,
    /// Inspect or edit the user config document
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Manage agent-server binaries
    Binaries {
        #[command(subcommand)]
        action: BinaryCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the config document
    Show,
    /// Set an environment variable passed to new instances
    SetEnv {
        /// Variable name
        key: String,
        /// Variable value
        value: String,
    },
}

#[derive(Subcommand)]
enum BinaryCommands {
    /// List registered binaries
    List,
    /// Register a binary (name on PATH or file path)
    Add {
        path: String,
        /// Display label
        #[arg(long)]
        label: Option<String>,
    },
    /// Unregister a binary
    Remove { path: String },
    /// Prefer a registered binary for new instances
    Default { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The shell protocol owns stdout.
    init_tracing(matches!(cli.command, Commands::Shell { .. }));

    let settings_path = cli.settings.clone().or_else(find_settings_path);
    let mut settings = match &settings_path {
        Some(path) => load_settings(path)?,
        None => ServerSettings::default(),
    };
    if let Some(config) = cli.config {
        settings.config_path = config;
    }

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            run_serve(settings).await
        }
        Commands::Shell { no_web, port } => {
            if let Some(port) = port {
                settings.port = port;
            }
            run_shell(settings, !no_web).await
        }
        Commands::Status => run_status(&settings, settings_path.as_deref()).await,
        Commands::Config { action } => run_config_command(action, &settings),
        Commands::Binaries { action } => run_binary_command(action, &settings).await,
    }
}

fn init_tracing(to_stderr: bool) {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},hyper=warn,tower_http=warn");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter));
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_serve(settings: ServerSettings) -> Result<()> {
    tracing::info!("Starting nomad server...");
    let ctx = AppContext::from_settings(&settings)?;

    let transports = TransportManager::new();
    transports
        .register(Arc::new(WebTransport::new(
            settings.host.clone(),
            settings.port,
            ctx.clone(),
        )))
        .await;
    transports.start_all().await?;
    tracing::info!(
        "Transports running: {}",
        transports.enabled_transports().await.join(", ")
    );

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    transports.stop_all().await;
    ctx.instances.shutdown().await;
    Ok(())
}

async fn run_shell(settings: ServerSettings, with_web: bool) -> Result<()> {
    let ctx = AppContext::from_settings(&settings)?;
    let host: Arc<dyn ShellHost> = match settings
        .folder_picker_command
        .as_deref()
        .and_then(CommandFolderPicker::new)
    {
        Some(picker) => Arc::new(picker),
        None => Arc::new(NoDialogHost),
    };
    let relay = Arc::new(ShellRelay::new(ctx.clone(), host));

    let transports = TransportManager::new();
    if with_web {
        transports
            .register(Arc::new(WebTransport::new(
                settings.host.clone(),
                settings.port,
                ctx.clone(),
            )))
            .await;
    }
    transports.start_all().await?;
    tracing::info!("Shell relay attached to stdio");

    let result = tokio::select! {
        result = stdio::serve(Arc::clone(&relay), tokio::io::stdin(), tokio::io::stdout()) => {
            tracing::info!("Shell closed its end of the relay");
            result
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutting down...");
            Ok(())
        }
    };

    relay.detach_all();
    transports.stop_all().await;
    ctx.instances.shutdown().await;
    result
}

async fn run_status(settings: &ServerSettings, settings_path: Option<&Path>) -> Result<()> {
    println!("nomad status");
    println!();

    match settings_path {
        Some(path) => println!("  Settings:  {} (found)", path.display()),
        None => println!("  Settings:  (defaults)"),
    }

    let config_path = resolve_path(&settings.config_path);
    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, using defaults)",
            config_path.display()
        );
    }

    let db_path = resolve_path(&settings.instance_db_path);
    println!(
        "  Records:   {} ({})",
        db_path.display(),
        if db_path.exists() {
            "found"
        } else {
            "not created yet"
        }
    );
    println!(
        "  Ports:     {}-{}",
        settings.port_range.start, settings.port_range.end
    );
    println!();

    let store = Arc::new(ConfigStore::new(&settings.config_path, None));
    let config = store.load();
    let registry = BinaryRegistry::new(store, settings.binary_name.clone());
    match registry.resolve() {
        Some(binary) => {
            let source = match binary.source {
                BinarySource::Preferred => "preferred",
                BinarySource::Registered => "registered",
                BinarySource::SearchPath => "PATH",
            };
            println!("  Binary:    {} ({source})", binary.path.display());
        }
        None => println!(
            "  Binary:    (none found, looked for '{}' on PATH)",
            settings.binary_name
        ),
    }
    println!("  Registered binaries: {}", config.opencode_binaries.len());
    println!("  Recent folders:      {}", config.recent_folders.len());
    println!();

    let base = format!("http://{}:{}", settings.host, settings.port);
    match probe_server(&format!("{base}/api/meta")).await {
        Some(meta) => println!(
            "  Server:    running at {base} (v{})",
            meta["version"].as_str().unwrap_or("?")
        ),
        None => println!("  Server:    not running at {base}"),
    }

    Ok(())
}

async fn probe_server(url: &str) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .ok()?;
    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}

fn run_config_command(action: ConfigCommands, settings: &ServerSettings) -> Result<()> {
    let store = ConfigStore::new(&settings.config_path, None);
    match action {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&store.load())?);
        }
        ConfigCommands::SetEnv { key, value } => {
            let mut env = serde_json::Map::new();
            env.insert(key.clone(), serde_json::Value::String(value));
            store.update(serde_json::json!({
                "preferences": { "environmentVariables": env }
            }))?;
            println!("Set {key} for new instances ({})", store.path().display());
        }
    }
    Ok(())
}

async fn run_binary_command(action: BinaryCommands, settings: &ServerSettings) -> Result<()> {
    let store = Arc::new(ConfigStore::new(&settings.config_path, None));
    let registry = BinaryRegistry::new(store, settings.binary_name.clone());

    match action {
        BinaryCommands::List => {
            let binaries = registry.list();
            if binaries.is_empty() {
                println!(
                    "No binaries registered; '{}' is looked up on PATH.",
                    settings.binary_name
                );
                return Ok(());
            }
            let preferred = registry.preferred();
            for binary in binaries {
                let marker = if preferred.as_deref() == Some(binary.path.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {}  {}  {}",
                    binary.path,
                    binary.label.as_deref().unwrap_or("-"),
                    binary.version.as_deref().unwrap_or("unknown version")
                );
            }
        }
        BinaryCommands::Add { path, label } => {
            let added = registry.add(&path, label).await?;
            println!(
                "Registered {} ({})",
                added.path,
                added.version.as_deref().unwrap_or("version unknown")
            );
        }
        BinaryCommands::Remove { path } => {
            if !registry.remove(&path)? {
                anyhow::bail!("binary is not registered: {path}");
            }
            println!("Removed {path}");
        }
        BinaryCommands::Default { path } => {
            registry.set_default(&path)?;
            println!("Default binary set to {path}");
        }
    }
    Ok(())
}
