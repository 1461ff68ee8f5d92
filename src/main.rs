use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::{fs, io::ErrorKind, path::Path, path::PathBuf, sync::Arc};
use swift_objstore::{
    Container, LocalConnection, OpScope, Payload, SwiftConfig,
    config::{ServeArgs, ServerConfig},
    handlers::EmulatorState,
    routes,
};
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tracing_subscriber::EnvFilter;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(author, version, about = "OpenStack Swift object-store client and emulator")]
struct Cli {
    /// YAML connection settings; the OS_* environment is used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Create the container (and segment container) when missing
    #[arg(long, global = true)]
    create: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the entries directly under PREFIX
    Ls { prefix: Option<String> },
    /// Write an object (or a byte range of it) to stdout
    Get {
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Number of bytes; -1 reads to the end
        #[arg(long, allow_hyphen_values = true)]
        length: Option<i64>,
    },
    /// Upload FILE (or stdin when FILE is `-` or absent)
    Put { name: String, file: Option<PathBuf> },
    /// Print size and modification time
    Stat { name: String },
    /// Delete an object and, for large objects, its segments
    Rm { name: String },
    /// Run the Swift API emulator over a local SQLite/disk backend
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup (stderr, so `get` can stream to stdout) ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(&args).await,
        command => {
            let cfg = match &cli.config {
                Some(path) => {
                    let yaml = fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    SwiftConfig::parse(&yaml)?
                }
                None => SwiftConfig::from_env()?,
            };

            // Ctrl-C cancels the running operation.
            let scope = OpScope::new();
            let canceller = scope.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    canceller.cancel();
                }
            });

            let container = scope.run(Container::from_config(&cfg, cli.create)).await?;
            run(&container, &scope, command).await
        }
    }
}

async fn run(container: &Container, scope: &OpScope, command: Command) -> Result<()> {
    match command {
        Command::Ls { prefix } => {
            let prefix = prefix.unwrap_or_default();
            scope
                .run(container.iter(&prefix, |entry| {
                    println!("{entry}");
                    Ok(())
                }))
                .await?;
        }
        Command::Get {
            name,
            offset,
            length,
        } => {
            let mut stream = scope
                .run(async {
                    match (offset, length) {
                        (0, None) => container.get(&name).await,
                        (offset, length) => {
                            container
                                .get_range(&name, offset, length.unwrap_or(-1))
                                .await
                        }
                    }
                })
                .await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout
                    .write_all(&chunk.with_context(|| format!("reading {name}"))?)
                    .await?;
            }
            stdout.flush().await?;
        }
        Command::Put { name, file } => {
            let payload = match file {
                Some(path) if path.as_os_str() != "-" => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    Payload::from_file(file).await?
                }
                _ => Payload::from_reader(tokio::io::stdin()),
            };
            let report = scope.run(container.upload(&name, payload)).await?;
            tracing::info!(
                "uploaded {} ({} bytes, {:?}, {} segments)",
                name,
                report.bytes,
                report.path,
                report.segments
            );
        }
        Command::Stat { name } => {
            let attrs = scope.run(container.attributes(&name)).await?;
            println!("{}", serde_json::to_string_pretty(&attrs)?);
        }
        Command::Rm { name } => {
            scope.run(container.delete(&name)).await?;
        }
        Command::Serve(_) => anyhow::bail!("serve does not run against a remote container"),
    }
    container.close().await?;
    Ok(())
}

async fn serve(args: &ServeArgs) -> Result<()> {
    let cfg = ServerConfig::from_env_and_args(args)?;
    tracing::info!(
        "Starting swift emulator on {} for account {}",
        cfg.addr(),
        cfg.account
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Create the database directory if needed ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Initialize backend (applies migrations) ---
    let backend = LocalConnection::connect(&cfg.database_url, &cfg.storage_dir).await?;
    if args.migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Build router ---
    let state = EmulatorState::new(Arc::new(backend), &cfg.account, &cfg.user, &cfg.key);
    let app: Router = routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
