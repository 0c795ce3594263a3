//! Main entry point for the switchboard gateway binary.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use switchboard_core::{introspect_remote_schema, Gateway, RemoteSchema};
use tracing_subscriber::EnvFilter;

/// A GraphQL federation gateway: point it at your services and it serves
/// their merged schema from a single endpoint.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version)]
struct Opt {
    /// A downstream GraphQL endpoint. Pass `URL` to introspect the schema
    /// from the service, or `URL=FILE` to read the SDL from disk. Repeat for
    /// every service.
    #[arg(long = "service", required = true, num_args = 1..)]
    services: Vec<String>,

    /// The address the gateway listens on.
    #[arg(long, default_value = "127.0.0.1:4000", env = "SWITCHBOARD_LISTEN")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();

    let mut sources = Vec::with_capacity(opt.services.len());
    for service in &opt.services {
        let source = match service.split_once('=') {
            Some((url, path)) => {
                let sdl = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("could not read schema file '{path}'"))?;
                RemoteSchema::parse(url, &sdl)
                    .with_context(|| format!("could not parse schema for '{url}'"))?
            }
            None => introspect_remote_schema(service)
                .await
                .with_context(|| format!("could not introspect '{service}'"))?,
        };
        sources.push(source);
    }

    let gateway = Arc::new(Gateway::new(sources).context("could not build the gateway")?);

    let listener = tokio::net::TcpListener::bind(opt.listen)
        .await
        .with_context(|| format!("could not bind {}", opt.listen))?;
    tracing::info!(address = %opt.listen, "gateway listening");

    axum::serve(listener, switchboard::app(gateway))
        .await
        .context("server error")?;

    Ok(())
}
