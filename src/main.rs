use clap::Parser;
use interop::broker;
use interop::cli::{Cli, Command};
use interop::client;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let socket_path = match args.socket.clone() {
                Some(path) => path,
                None => broker::default_socket_path().unwrap_or_else(|e| {
                    eprintln!("interopd serve: {e}");
                    std::process::exit(1);
                }),
            };
            if let Err(e) = broker::run(args.into_config(socket_path)).await {
                tracing::error!(error = %e, "broker failed");
                eprintln!("interopd serve: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { socket, action } => {
            if let Err(e) = client::run(socket, action).await {
                tracing::error!(error = %e, "client failed");
                eprintln!("interopd client: {e}");
                std::process::exit(1);
            }
        }
    }
}
