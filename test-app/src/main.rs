// flexapi-monitor -- connect to a FlexRadio and watch the SmartSDR session.
//
// Usage:
//   flexapi-monitor --host 192.168.1.50 --serial 1234-5678-9012-3456 monitor --duration 30
//   flexapi-monitor --host 192.168.1.50 send info
//   flexapi-monitor --host 192.168.1.50 --non-gui --program Logger clients
//   flexapi-monitor --host 192.168.1.50 --kick 0x40000001 monitor
//   flexapi-monitor --host 203.0.113.7 --wan-handle 1A2B3C --tls-port 4994 \
//       --public-udp-port 4993 monitor
//
// Set RUST_LOG=flexapi=debug for protocol-level tracing.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use flexapi::{Api, ApiEvent, ConnectionParams, ConnectionState, Endpoint, PendingDisconnect};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "flexapi-monitor",
    version,
    about = "Connect to a FlexRadio and print SmartSDR session events"
)]
struct Cli {
    /// Radio IP address.
    #[arg(long)]
    host: IpAddr,

    /// Radio serial number, used only for display.
    #[arg(long, default_value = "unknown")]
    serial: String,

    /// Radio TCP command port.
    #[arg(long, default_value_t = 4992)]
    tcp_port: u16,

    /// Program name reported to the radio.
    #[arg(long, default_value = "flexapi-monitor")]
    program: String,

    /// Station name reported to the radio (GUI clients only).
    #[arg(long, default_value = "Monitor")]
    station: String,

    /// Connect as a non-GUI client.
    #[arg(long)]
    non_gui: bool,

    /// Reuse a GUI client id from an earlier session.
    #[arg(long)]
    client_id: Option<String>,

    /// Bind this non-GUI client to an existing GUI client id.
    #[arg(long)]
    bind_client_id: Option<String>,

    /// Ask the radio for low-bandwidth streams.
    #[arg(long)]
    low_bandwidth: bool,

    /// Disconnect a client before connecting ("all" or a hex handle).
    #[arg(long)]
    kick: Option<String>,

    /// Seconds of ping silence before the session is torn down.
    #[arg(long, default_value_t = 30)]
    ping_timeout: u64,

    /// First local UDP port to try.
    #[arg(long)]
    udp_port: Option<u16>,

    /// WAN connection handle; selects a WAN connection.
    #[arg(long, requires_all = ["tls_port", "public_udp_port"])]
    wan_handle: Option<String>,

    /// Public TLS port of a WAN radio.
    #[arg(long)]
    tls_port: Option<u16>,

    /// Public UDP port of a WAN radio.
    #[arg(long)]
    public_udp_port: Option<u16>,

    /// Hole-punch port for WAN radios behind NAT.
    #[arg(long, requires = "wan_handle")]
    hole_punch_port: Option<u16>,

    /// Local interface to bind for hole-punched connections.
    #[arg(long)]
    local_interface: Option<IpAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print session events until the duration elapses (0 = forever).
    Monitor {
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
    /// Send one command and print the reply.
    Send {
        /// Command text, for example `info` or `slice list`.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// List the client sessions known on the radio.
    Clients,
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

fn parse_kick(value: &str) -> Result<PendingDisconnect> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(PendingDisconnect::All);
    }
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let handle = u32::from_str_radix(digits, 16)
        .with_context(|| format!("invalid client handle '{value}'"))?;
    Ok(PendingDisconnect::Client(handle))
}

fn endpoint(cli: &Cli) -> Result<Endpoint> {
    let endpoint = match &cli.wan_handle {
        Some(handle) => {
            let (Some(tls), Some(udp)) = (cli.tls_port, cli.public_udp_port) else {
                bail!("WAN connections need --tls-port and --public-udp-port");
            };
            let wan = Endpoint::wan(&cli.serial, cli.host, tls, udp, handle);
            match cli.hole_punch_port {
                Some(port) => wan.with_hole_punch(port),
                None => wan,
            }
        }
        None => Endpoint::local(&cli.serial, cli.host).with_tcp_port(cli.tcp_port),
    };
    Ok(endpoint)
}

fn params(cli: &Cli) -> Result<ConnectionParams> {
    let mut params = if cli.non_gui {
        ConnectionParams::non_gui(&cli.program)
    } else {
        ConnectionParams::gui(&cli.program, &cli.station)
    };
    if let Some(id) = &cli.client_id {
        params = params.with_client_id(id);
    }
    if let Some(id) = &cli.bind_client_id {
        params = params.with_bind_client_id(id);
    }
    if let Some(kick) = &cli.kick {
        params = params.with_pending_disconnect(parse_kick(kick)?);
    }
    Ok(params.with_low_bandwidth(cli.low_bandwidth))
}

fn build_api(cli: &Cli) -> Api {
    let mut builder = Api::builder().ping_timeout(Duration::from_secs(cli.ping_timeout));
    if let Some(port) = cli.udp_port {
        builder = builder.first_local_udp_port(port);
    }
    if let Some(addr) = cli.local_interface {
        builder = builder.local_interface(addr);
    }
    builder.build()
}

/// Connect and wait until the radio has accepted us as a client.
async fn connect(api: &Api, cli: &Cli) -> Result<u32> {
    let endpoint = endpoint(cli)?;
    let mut state = api.watch_state();

    println!("Connecting to {} at {}...", endpoint.serial, endpoint.ip);
    api.connect(endpoint, params(cli)?)
        .await
        .context("failed to connect to radio")?;

    let reached = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| s.is_client_connected() || s.is_idle()),
    )
    .await
    .context("radio did not accept the client within 10 s")?
    .context("connection core stopped")?
    .clone();

    match reached {
        ConnectionState::ClientConnected { handle, .. } => {
            println!("Connected as handle 0x{handle:08X}");
            if let Some(version) = api.version() {
                println!("Radio version: {version}");
            }
            Ok(handle)
        }
        _ => bail!("session ended before the radio accepted the client"),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_monitor(api: &Api, duration_secs: u64) -> Result<()> {
    let mut event_rx = api.subscribe();

    println!("Monitoring session events (Ctrl-C to stop)...");

    let deadline = if duration_secs > 0 {
        Some(Instant::now() + Duration::from_secs(duration_secs))
    } else {
        None
    };

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
            received = tokio::time::timeout(timeout, event_rx.recv()) => match received {
                Ok(Ok(ApiEvent::RadioRemoved)) => {
                    println!("[event] RadioRemoved");
                    println!("Session ended by the radio.");
                    break;
                }
                Ok(Ok(event)) => {
                    println!("[event] {event:?}");
                }
                Ok(Err(RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Monitor duration elapsed.");
                    }
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn cmd_send(api: &Api, words: &[String]) -> Result<()> {
    let command = words.join(" ");
    let reply = api
        .request(&command)
        .await
        .with_context(|| format!("'{command}' failed"))?;

    if reply.is_ok() {
        println!("OK  {}", reply.text);
    } else {
        println!("ERR 0x{:08X}  {}", reply.error_code, reply.text);
    }
    if let Some(debug) = &reply.debug {
        println!("    {debug}");
    }
    Ok(())
}

async fn cmd_clients(api: &Api) -> Result<()> {
    // Client status lines follow the handshake; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let clients = api.clients();
    if clients.is_empty() {
        println!("No clients reported.");
        return Ok(());
    }

    println!(
        "{:<12} {:<20} {:<16} {:<5} {}",
        "HANDLE", "PROGRAM", "STATION", "PTT", "CLIENT ID"
    );
    for client in clients {
        let marker = if client.is_this_client { " (this)" } else { "" };
        println!(
            "0x{:08X}  {:<20} {:<16} {:<5} {}{marker}",
            client.handle,
            client.program,
            client.station,
            if client.is_local_ptt { "yes" } else { "no" },
            client.client_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let api = build_api(&cli);
    connect(&api, &cli).await?;

    let result = match &cli.command {
        Command::Monitor { duration } => cmd_monitor(&api, *duration).await,
        Command::Send { command } => cmd_send(&api, command).await,
        Command::Clients => cmd_clients(&api).await,
    };

    if let Some(id) = api.client_id() {
        println!("Client id: {id}");
    }
    if !api.state().is_idle() {
        api.disconnect().await.context("disconnect failed")?;
    }
    result
}
