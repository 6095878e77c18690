use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

mod cli;
mod client;
mod config;
mod session;
mod sync;

use cli::{Cli, EXIT_CLI, EXIT_INTERNAL_FAILURE};
use client::{ClientSession, Delivery};
use config::ClientConfig;
use session::{perform_handshake, DirectResolver, EndpointResolver, Reliable, StunResolver, Transport, Unreliable};

/// Discovery/control TCP port.
const TCP_BASE_PORT: u16 = 32273;
/// Media/input UDP port.
const UDP_BASE_PORT: u16 = 32263;
/// Each connection attempt (TCP connect through discovery) budgets this
/// long before it's abandoned and retried.
const HANDSHAKE_BUDGET: Duration = Duration::from_secs(5);
/// Retries after a failed connection attempt, spaced 1s apart.
const MAX_INIT_CONNECTION_ATTEMPTS: u32 = 5;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "castcore=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(message) = cli.validate() {
        eprintln!("{message}");
        std::process::exit(EXIT_CLI);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(EXIT_INTERNAL_FAILURE);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(EXIT_INTERNAL_FAILURE);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let key = castcore_crypto::parse_preshared_key(&cli.key).context("invalid --key")?;

    let tcp_addr = resolve_addr(&cli.server_ip, TCP_BASE_PORT)?;
    let udp_addr = resolve_addr(&cli.server_ip, UDP_BASE_PORT)?;

    info!(server = %cli.server_ip, user = %cli.session_name(), "connecting");

    let (mut reliable, mut unreliable, session_binding) =
        connect_with_retries(tcp_addr, udp_addr, &key, &cli).await?;

    if let Some(stun) = &config.stun_server {
        let resolver = StunResolver { stun_server: resolve_addr(stun, 0)? };
        if let Err(e) = resolver.resolve(unreliable.inner(), udp_addr).await {
            error!("STUN endpoint discovery failed, continuing with a direct path: {e}");
        }
    } else {
        let _ = DirectResolver.resolve(unreliable.inner(), udp_addr).await;
    }

    println!("{}", session_binding.session_id);

    let client_session = Arc::new(Mutex::new(
        ClientSession::new(session_binding.session_id, &config).context("failed to initialize client session")?,
    ));

    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<Delivery>();
    let (reliable_outbound_tx, reliable_outbound_rx) = mpsc::unbounded_channel();
    let (unreliable_outbound_tx, unreliable_outbound_rx) = mpsc::unbounded_channel();

    let unreliable_task = tokio::spawn(sync::run_unreliable_loop(
        client_session.clone(),
        unreliable,
        *key,
        delivery_tx.clone(),
        unreliable_outbound_rx,
    ));
    let reliable_task = tokio::spawn(sync::run_reliable_loop(
        client_session.clone(),
        reliable,
        *key,
        reliable_outbound_rx,
        delivery_tx,
    ));

    let _ = unreliable_outbound_tx.send(castcore_protocol::ClientMessage::Dimensions {
        width: config.output_width,
        height: config.output_height,
        dpi: 96,
    });
    let _ = unreliable_outbound_tx.send(castcore_protocol::ClientMessage::StartStreaming);

    for url in &cli.new_tab_url {
        let _ = reliable_outbound_tx.send(castcore_protocol::ClientMessage::OpenUrl { url: url.clone() });
    }

    let quit_reason = loop {
        match delivery_rx.recv().await {
            Some(Delivery::Quit) => break "server requested shutdown",
            Some(Delivery::Server(msg)) => {
                info!(?msg, "server message");
            }
            None => break "sync loops terminated unexpectedly",
        }
    };

    info!(reason = quit_reason, "shutting down");
    let _ = unreliable_outbound_tx.send(castcore_protocol::ClientMessage::Quit);
    let _ = reliable_outbound_tx.send(castcore_protocol::ClientMessage::Quit);

    tokio::time::sleep(Duration::from_millis(50)).await;
    unreliable_task.abort();
    reliable_task.abort();

    Ok(())
}

/// Runs the full connection sequence (TCP connect, reliable handshake,
/// discovery, UDP connect, unreliable handshake) under a single budget
/// per attempt, retrying up to `MAX_INIT_CONNECTION_ATTEMPTS` times with
/// 1s spacing on any `CoreError::HandshakeFailed`/I/O failure.
async fn connect_with_retries(
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    key: &[u8; 16],
    cli: &Cli,
) -> Result<(Reliable, Unreliable, castcore_protocol::SessionBinding)> {
    let mut last_err = None;
    for attempt in 1..=MAX_INIT_CONNECTION_ATTEMPTS {
        match tokio::time::timeout(HANDSHAKE_BUDGET, connect_once(tcp_addr, udp_addr, key, cli)).await {
            Ok(Ok(connected)) => return Ok(connected),
            Ok(Err(e)) => {
                error!(attempt, "connection attempt failed: {e:#}");
                last_err = Some(e);
            }
            Err(_) => {
                error!(attempt, "connection attempt timed out after {HANDSHAKE_BUDGET:?}");
                last_err = Some(anyhow::anyhow!("handshake budget exceeded"));
            }
        }
        if attempt < MAX_INIT_CONNECTION_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("connection failed")))
        .context(format!("giving up after {MAX_INIT_CONNECTION_ATTEMPTS} attempts"))
}

async fn connect_once(
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    key: &[u8; 16],
    cli: &Cli,
) -> Result<(Reliable, Unreliable, castcore_protocol::SessionBinding)> {
    let mut reliable = Reliable::connect(tcp_addr)
        .await
        .with_context(|| format!("failed to connect TCP control channel to {tcp_addr}"))?;
    perform_handshake(&mut reliable, key)
        .await
        .context("reliable channel handshake failed")?;

    let session_binding = discover_session(&mut reliable, key, cli).await.context("discovery handshake failed")?;

    let mut unreliable = Unreliable::connect(0, udp_addr)
        .await
        .with_context(|| format!("failed to open UDP media channel to {udp_addr}"))?;
    perform_handshake(&mut unreliable, key)
        .await
        .context("unreliable channel handshake failed")?;

    Ok((reliable, unreliable, session_binding))
}

/// Sends the client's `DiscoveryRequest` and awaits the server's
/// `SessionBinding` reply, both carried over the already-authenticated
/// reliable channel, ahead of the UDP media channel being opened.
async fn discover_session(
    reliable: &mut Reliable,
    key: &[u8; 16],
    cli: &Cli,
) -> Result<castcore_protocol::SessionBinding> {
    let mut client_nonce = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut client_nonce);

    let request = castcore_protocol::ClientMessage::DiscoveryRequest { client_nonce };
    let plaintext = postcard::to_allocvec(&request)?;
    let ciphertext = castcore_crypto::encrypt(&plaintext, key);
    reliable.send_datagram(&ciphertext).await.context("failed to send discovery request")?;

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), reliable.recv_datagram(&mut buf))
        .await
        .context("discovery response timed out")?
        .context("failed to read discovery response")?;
    if n == 0 {
        bail!("server closed the connection during discovery");
    }

    let plaintext = castcore_crypto::decrypt(&buf[..n], key).context("failed to decrypt discovery response")?;
    let binding: castcore_protocol::SessionBinding = postcard::from_bytes(&plaintext)?;

    info!(session_id = binding.session_id, user = %cli.session_name(), "session established");
    Ok(binding)
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let Some(path) = &cli.config else {
        return Ok(ClientConfig::default());
    };
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file {path:?}"))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config file {path:?}"))
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if port == 0 {
        return host.to_socket_addrs()?.next().with_context(|| format!("could not resolve {host}"));
    }
    format!("{host}:{port}")
        .to_socket_addrs()
        .with_context(|| format!("could not resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address found for {host}:{port}"))
}
