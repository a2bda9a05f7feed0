//! Abacate CLI
//!
//! Exposes a local HTTP server to the internet so it can receive webhooks.
//!
//! The client opens a tunnel to a relay service, which assigns a public URL
//! and pushes every request sent to that URL back through the tunnel. Each
//! request is forwarded to the configured target and the target's real
//! response is relayed back to the caller. A local listener on port 8954
//! forwards the same way.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod cli;
mod config;
mod error;
mod listener;
mod logging;
mod protocol;
mod relay;
mod tunnel;

#[cfg(test)]
mod test_support;

use cli::Cli;
use config::{Config, Settings};
use error::{ConfigError, TunnelDisconnect, TunnelError};
use listener::LocalListener;
use relay::{RequestRelay, TargetClient};
use tunnel::{SessionState, TunnelSession};

const EXIT_CONFIG: u8 = 1;
const EXIT_HANDSHAKE: u8 = 2;
const EXIT_TUNNEL_LOST: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(cli::normalize_args(std::env::args_os()));

    let file_config = Config::load().unwrap_or_else(|e| {
        eprintln!("Ignoring config file: {:#}", e);
        Config::default()
    });

    let settings = match Settings::resolve(&cli, &file_config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    logging::init(&settings.log);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let client = TargetClient::new(settings.target.clone(), &settings.forward)
        .context("Failed to create HTTP client")?;
    let relay = RequestRelay::new(client, &settings.relay);

    let listener = LocalListener::bind(settings.listen_port)
        .await
        .with_context(|| format!("Failed to bind port {}", settings.listen_port))?;

    info!("🚀 Server running on port {}", listener.local_addr().port());
    info!("🔄 Forwarding requests to {}", settings.target);

    let mut session = TunnelSession::open(&settings.tunnel).await?;

    info!("🌍 Server publicly reachable at: {}", session.public_url());
    info!("🔑 Set the public URL as your webhook endpoint at https://www.abacatepay.com");

    let lifecycle = tokio::spawn(log_lifecycle(session.subscribe()));
    let shutdown = CancellationToken::new();
    let listener_task = tokio::spawn(listener.serve(relay.clone(), shutdown.clone()));

    let outcome = tokio::select! {
        result = relay.run(&mut session) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    };

    // Stop taking requests on both paths. Connections already serving a
    // request stay open until its reply is written.
    session.close();
    shutdown.cancel();
    debug!("Tunnel {}, draining {} request(s)", session.state(), relay.in_flight());

    relay.shutdown().await;
    session.wait_closed().await;
    let _ = listener_task.await;
    let _ = lifecycle.await;

    outcome.map_err(Into::into)
}

async fn log_lifecycle(mut state: watch::Receiver<SessionState>) {
    while state.changed().await.is_ok() {
        if *state.borrow_and_update() == SessionState::Closed {
            info!("❌ Tunnel closed.");
            break;
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else if err.downcast_ref::<TunnelError>().is_some() {
        EXIT_HANDSHAKE
    } else if err.downcast_ref::<TunnelDisconnect>().is_some() {
        EXIT_TUNNEL_LOST
    } else {
        EXIT_CONFIG
    }
}
