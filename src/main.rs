// src/main.rs
use staticd::{Config, Server};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::from_file(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to load config");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.serve() {
        tracing::error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
