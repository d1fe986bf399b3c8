use std::{error::Error, path::PathBuf, sync::Arc, sync::atomic::Ordering};

use clap::Parser;
use env_logger::Env;
use log::info;
use netconfd::{
    DatastoreManager, NetconfServer, ServerConfig,
    adapter::{LogBeacon, MemoryKernel, SchemaContext},
    config::{DEFAULT_SOCKET_PATH, DEFAULT_STARTUP_PATH},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for sessions on this socket
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Startup configuration file
    #[arg(long, default_value = DEFAULT_STARTUP_PATH)]
    startup: PathBuf,
    /// Maximum concurrent sessions
    #[arg(long, default_value_t = 16)]
    max_sessions: usize,
    /// Reject edits of running; changes only reach it through commit
    #[arg(long)]
    no_writable_running: bool,
    /// Extra directories searched for schema modules
    #[arg(long = "schema-path")]
    schema_paths: Vec<PathBuf>,
    /// Log more; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let config = ServerConfig {
        socket_path: cli.socket,
        startup_path: Some(cli.startup),
        max_sessions: cli.max_sessions,
        writable_running: !cli.no_writable_running,
        schema_search_paths: cli.schema_paths,
        ..Default::default()
    };

    let schema = SchemaContext::with_default_modules(config.schema_search_paths.clone())?;
    let mut datastores = DatastoreManager::new(Arc::new(schema), Box::new(MemoryKernel::new()))
        .with_writable_running(config.writable_running);
    if let Some(path) = &config.startup_path {
        datastores = datastores.with_startup_path(path);
    }
    datastores.boot()?;

    let server = NetconfServer::new(config, Arc::new(datastores))?
        .with_beacon(Box::new(LogBeacon::default()));
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("interrupt received");
        shutdown.store(true, Ordering::SeqCst);
    })?;

    server.listen()?;
    Ok(())
}
