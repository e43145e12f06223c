#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod event_loop;
mod peek;
mod splice;

use anyhow::Context;
use clap::Parser;
use sharedconn::SharedStream;
use socket2::{Domain, SockAddr, SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::{parse_duration, RelayConfig};
use crate::event_loop::RelayRunner;
use crate::peek::peek_prefix;
use crate::splice::NaiveSplice;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::{pin, select};
use tracing::{debug, error, info, warn, Span};
use tracing_subscriber::EnvFilter;

/// Tcp relay that logs the opening bytes of every connection
///
/// Each accepted connection is peeked, then forwarded to the upstream with the
/// peeked bytes replayed first, so the upstream sees the stream untouched.
#[derive(clap::Parser, Debug)]
#[command(author, version, about, verbatim_doc_comment, long_about = None)]
struct CmdLine {
    /// Address to listen on
    #[arg(short = 'l', long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Address to forward connections to
    #[arg(short = 'u', long)]
    upstream: SocketAddr,

    /// Maximum number of opening bytes to peek at before forwarding
    #[arg(long, default_value_t = 64)]
    peek_bytes: usize,

    /// How long to wait for the opening bytes. i.e: 500ms, 3s
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    peek_timeout: Duration,

    /// How long to wait for the upstream to accept the connection
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    connect_timeout: Duration,

    /// Maximum lifetime of a relayed connection
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    cnx_max_duration: Duration,

    /// Send a proxy protocol v2 header to the upstream
    #[arg(long)]
    proxy_protocol: bool,

    /// Control the log verbosity. i.e: TRACE, DEBUG, INFO, WARN, ERROR, OFF
    /// for more details: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax
    #[arg(
        long,
        global = true,
        value_name = "LOG_LEVEL",
        verbatim_doc_comment,
        env = "RUST_LOG",
        default_value = "INFO"
    )]
    log_lvl: String,
}

impl From<CmdLine> for RelayConfig {
    fn from(cmd_line: CmdLine) -> Self {
        Self {
            listen_addr: cmd_line.listen,
            upstream: cmd_line.upstream,
            peek_bytes: cmd_line.peek_bytes,
            peek_timeout: cmd_line.peek_timeout,
            connect_timeout: cmd_line.connect_timeout,
            cnx_max_duration: cmd_line.cnx_max_duration,
            proxy_protocol: cmd_line.proxy_protocol,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd_line: CmdLine = CmdLine::parse();

    tracing_subscriber::fmt()
        .with_ansi(true)
        .with_env_filter(
            EnvFilter::builder()
                .parse(&cmd_line.log_lvl)
                .with_context(|| format!("Invalid log filter {}", cmd_line.log_lvl))?,
        )
        .init();

    let (shutdown_tx, mut runner) = RelayRunner::new(RelayConfig::from(cmd_line));
    let task_counter = runner.tasks_counter.clone();
    let listener = tokio::spawn(async move { runner.run().await });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    select! {
        biased;
        _ = sigterm.recv() => info!("Receive SIGTERM. Stop accepting new connections"),
        _ = sigint.recv() => info!("Receive SIGINT. Stop accepting new connections"),
        ret = listener => {
            // The listener only returns on its own when it failed
            let err = match ret {
                Ok(ret) => ret.err().unwrap_or_else(|| anyhow::anyhow!("listener stopped")),
                Err(err) => anyhow::Error::from(err),
            };
            error!("Listener exited abruptly: {:?}", err);
            return Err(err);
        }
    }
    let _ = shutdown_tx.send(());

    // Wait to drain all the connections
    let sigint = sigint.recv();
    pin!(sigint);
    loop {
        let nb_task = task_counter.load(Ordering::Relaxed);
        if nb_task == 0 {
            break;
        }

        info!("Waiting for {} cnx to shutdown", nb_task);
        select! {
            biased;

            _ = &mut sigint => {
                info!("Received double SIGINT. Exiting immediately");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    Ok(())
}

fn tcp_keep_alive_cfg() -> &'static TcpKeepalive {
    static KEEP_ALIVE: TcpKeepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(20))
        .with_retries(3);

    &KEEP_ALIVE
}

fn create_socket(bind: SocketAddr) -> anyhow::Result<socket2::Socket> {
    let sock = socket2::Socket::new(
        Domain::for_address(bind),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    sock.set_tcp_keepalive(tcp_keep_alive_cfg())?;
    sock.set_reuse_address(true)?;
    sock.set_keepalive(true)?;
    sock.set_nodelay(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&SockAddr::from(bind))?;

    Ok(sock)
}

async fn handle_client(
    cfg: &RelayConfig,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    info!("handling new connection");
    let _guard = scopeguard::guard((), |_| {
        info!("connections closed");
    });
    stream.set_nodelay(true)?;
    SockRef::from(&stream).set_tcp_keepalive(tcp_keep_alive_cfg())?;
    let local_addr = stream.local_addr()?;

    let mut stream = SharedStream::new(stream);
    let prefix = peek_prefix(&mut stream, cfg.peek_bytes, cfg.peek_timeout).await?;
    Span::current().record("peeked", prefix.len());
    debug!("opening bytes: \"{}\"", prefix.escape_ascii());

    info!("connecting to upstream");
    let mut sock = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(cfg.upstream))
        .await
        .with_context(|| {
            format!(
                "Cannot connect to upstream after {:?}",
                cfg.connect_timeout
            )
        })??;
    sock.set_nodelay(true)?;

    // Send proxy protocol header
    if cfg.proxy_protocol {
        let proxy_protocol_header = ppp::v2::Builder::with_addresses(
            ppp::v2::Version::Two | ppp::v2::Command::Proxy,
            ppp::v2::Protocol::Stream,
            (peer_addr, local_addr),
        )
        .build()?;
        sock.write_all(proxy_protocol_header.as_slice()).await?;
    }

    let splicer = NaiveSplice::default();
    let ret = tokio::time::timeout(
        cfg.cnx_max_duration,
        splicer.splice(&mut stream, &mut sock),
    )
    .await;
    match ret {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            warn!("closing cnx {:?}", err);
        }
        Err(_) => {
            warn!(
                "timeout of {:?} elapsed. Closing cnx",
                cfg.cnx_max_duration
            );
        }
    }

    Ok(())
}
