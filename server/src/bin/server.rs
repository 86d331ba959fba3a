//! rpcchan demo server binary.

use clap::Parser;
use rpcchan::testing::TestServer;
use rpcchan_server::banner::{BannerConfig, print_banner};
use rpcchan_server::config::{Config, DEFAULT_CONFIG};
use rpcchan_server::{app, logging, signal};
use std::path::PathBuf;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "rpcchan-server")]
#[command(about = "Serves the rpcchan test service over HTTP/1.1")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{}", DEFAULT_CONFIG);
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rpcchan-worker")
        .build()?;

    runtime.block_on(async {
        let listener = TcpListener::bind(config.listen).await?;
        let server = app::build_server(&config, TestServer::new());

        let services = server.handlers().service_names();
        print_banner(&BannerConfig::new(&config, listener.local_addr()?, &services));

        let shutdown = signal::install_signal_handler();
        app::run(server, listener, shutdown).await;
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}
