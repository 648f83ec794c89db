use clap::Parser;
use tracing::error;

use dlnacast::config::{Args, Config};
use dlnacast::{logging, server};

#[tokio::main]
async fn main() {
    // Argument errors exit with status 2 via clap.
    let args = Args::parse();

    if args.generate_config {
        match Config::generate_default() {
            Ok(text) => {
                println!("{text}");
                return;
            }
            Err(e) => {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
    }

    logging::init_logging();

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
