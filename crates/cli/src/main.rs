//! `wire` binary: run an echo receiver, send one message or watch topic broadcasts over NATS.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::time::Duration;

use async_nats::Client;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wire_broker::{HandlerError, Receiver, ReceiverConfig, Sender, SenderConfig};
use wire_coordination_nats::{NatsCoordinationAdapter, NatsCoordinationOptions};
use wire_transport_nats::NatsTransport;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Broker error
    #[error(transparent)]
    Broker(#[from] wire_broker::Error),

    /// Could not connect to NATS
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Server URL
        url: String,

        /// Underlying error
        message: String,
    },

    /// Payload was not valid JSON, or a response could not be printed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Prefix of the JetStream KV buckets holding receivers and topic leases
    #[arg(long, default_value = "wire", env = "WIRE_COORDINATION_BUCKET")]
    coordination_bucket: String,

    /// Replicas for the coordination buckets
    #[arg(long, default_value_t = 1, env = "WIRE_COORDINATION_REPLICAS")]
    coordination_replicas: usize,

    /// NATS server URL
    #[arg(long, default_value = "nats://localhost:4222", env = "WIRE_NATS_URL")]
    nats_url: String,

    /// Wire namespace shared by senders and receivers
    #[arg(long, default_value = "default", env = "WIRE_ID")]
    wire_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a receiver that echoes every payload back
    Receive {
        /// Receiver identity (random if not set)
        #[arg(long, env = "WIRE_RECEIVER_ID")]
        receiver_id: Option<String>,

        /// Simulated processing time per message, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },

    /// Send one message and print the response
    Send {
        /// Topic to send to
        #[arg(long)]
        topic: String,

        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,

        /// Message id to reuse (random if not set)
        #[arg(long)]
        message_id: Option<String>,

        /// Response timeout in milliseconds
        #[arg(long, env = "WIRE_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
    },

    /// Print every response broadcast on a topic
    Watch {
        /// Topic to watch
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = connect(&args.nats_url).await?;

    let shutdown_token = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown_token.clone()));

    let coordination = NatsCoordinationAdapter::new(NatsCoordinationOptions {
        bucket: args.coordination_bucket.clone(),
        client: client.clone(),
        num_replicas: args.coordination_replicas,
        operation_timeout: None,
        persist: false,
    });
    let transport = NatsTransport::with_client(client.clone());

    match args.command {
        Command::Receive {
            receiver_id,
            delay_ms,
        } => {
            let config = ReceiverConfig {
                receiver_id,
                ..ReceiverConfig::new(args.wire_id)
            };
            let delay = Duration::from_millis(delay_ms);

            let receiver = Receiver::new(
                config,
                coordination,
                transport,
                move |topic: String, payload: Value| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, HandlerError>(json!({ "echo": payload, "topic": topic }))
                },
            );

            receiver.start().await?;
            info!(receiver_id = receiver.receiver_id(), "receiving");

            shutdown_token.cancelled().await;

            receiver.stop().await?;
        }
        Command::Send {
            topic,
            payload,
            message_id,
            timeout_ms,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let timeout = timeout_ms.map(Duration::from_millis);

            let sender = Sender::new(SenderConfig::new(args.wire_id), coordination, transport);
            sender.connect().await?;

            let result = tokio::select! {
                result = async {
                    match message_id {
                        Some(message_id) => {
                            sender
                                .send_with_message_id(message_id, &topic, payload, timeout)
                                .await
                        }
                        None => sender.send(&topic, payload, timeout).await,
                    }
                } => Some(result),
                () = shutdown_token.cancelled() => None,
            };

            sender.close().await?;

            if let Some(result) = result {
                println!("{}", serde_json::to_string_pretty(&result?)?);
            }
        }
        Command::Watch { topic } => {
            let sender = Sender::new(SenderConfig::new(args.wire_id), coordination, transport);
            sender.connect().await?;

            sender
                .subscribe_topic(&topic, |broadcast| async move {
                    match serde_json::to_string(&broadcast) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "failed to print broadcast"),
                    }
                })
                .await?;
            info!(%topic, "watching");

            shutdown_token.cancelled().await;

            sender.close().await?;
        }
    }

    if let Err(e) = client.flush().await {
        warn!(error = %e, "failed to flush NATS client");
    }

    Ok(())
}

async fn connect(url: &str) -> Result<Client, Error> {
    async_nats::ConnectOptions::new()
        .name("wire")
        .connect(url)
        .await
        .map_err(|e| Error::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })
}

async fn wait_for_signal(shutdown_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            _ => {
                warn!("failed to install signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt signal");
    }

    info!("Shutting down");
    shutdown_token.cancel();
}
