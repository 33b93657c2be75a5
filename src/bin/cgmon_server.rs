//! cgmon gRPC server
//!
//! Runs the stats, resources and thresholds services over a durable store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;

use cgmon::config::MonitorConfig;
use cgmon::logging::init_logging;
use cgmon::rpc::MonitorServices;
use cgmon::storage::persistent::open_database;
use cgmon::storage::DataDb;
use cgmon::thresholds::LogActionExecutor;
use cgmon::transport::MonitorServiceImpl;

/// Command line options.
struct Args {
    /// Address to bind to
    addr: SocketAddr,
    /// Data directory for persistent storage
    data_dir: PathBuf,
    /// JSON configuration file; defaults enable every service
    config: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 2012)),
            data_dir: PathBuf::from("./cgmon.data"),
            config: None,
        }
    }
}

fn usage_error(msg: &str) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .cloned()
                .unwrap_or_else(|| usage_error(&format!("{} requires a value", args[i])))
        };
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value();
                let port: u16 = raw
                    .parse()
                    .unwrap_or_else(|_| usage_error(&format!("invalid port number: {raw}")));
                parsed.addr.set_port(port);
                i += 2;
            }
            "--data-dir" | "-d" => {
                parsed.data_dir = PathBuf::from(value());
                i += 2;
            }
            "--config" | "-c" => {
                parsed.config = Some(PathBuf::from(value()));
                i += 2;
            }
            "--help" | "-h" => {
                println!("cgmon-server - stats, resources and thresholds over gRPC");
                println!();
                println!("USAGE:");
                println!("    cgmon-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>         Port to listen on [default: 2012]");
                println!("    -d, --data-dir <DIR>      Data directory [default: ./cgmon.data]");
                println!("    -c, --config <FILE>       JSON configuration file");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => usage_error(&format!("unknown argument: {arg}")),
        }
    }

    parsed
}

fn load_config(path: Option<&PathBuf>) -> Result<MonitorConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        let mut cfg = MonitorConfig::default();
        cfg.stats.enabled = true;
        cfg.resources.enabled = true;
        cfg.thresholds.enabled = true;
        return Ok(cfg);
    };
    let json = std::fs::read_to_string(path)?;
    Ok(MonitorConfig::from_json_str(&json)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    let cfg = load_config(args.config.as_ref())?;
    init_logging(&cfg.general)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), data_dir = %args.data_dir.display(), "opening database");
    // Holds an exclusive lock on the directory for the process lifetime.
    let db: Arc<dyn DataDb> = Arc::new(open_database(&args.data_dir, None)?);

    let services = Arc::new(MonitorServices::new(&cfg, db, Arc::new(LogActionExecutor))?);
    let svc = MonitorServiceImpl::new(Arc::clone(&services)).into_server();

    tracing::info!(addr = %args.addr, "serving");
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(args.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    let flush = Arc::clone(&services);
    tokio::task::spawn_blocking(move || flush.shutdown()).await?;
    tracing::info!("shut down");
    Ok(())
}
