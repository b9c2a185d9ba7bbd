use std::net::SocketAddr;
use std::time::Duration;
use anyhow::anyhow;
use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, Level};
use zinc::channel::Channel;
use zinc::channel::event_loop::EventLoop;
use zinc::config::ZincConfig;

/// Echo server / client: without `--connect`, every message received is sent back to its sender.
///  With `--connect`, the given messages are sent to the server, and the echoes are awaited.
#[derive(Parser)]
struct Args {
    /// local address, defaults to 0.0.0.0:1337 for the server and to an ephemeral port for the client
    #[clap(long)]
    bind: Option<String>,

    #[clap(long)]
    connect: Option<String>,

    messages: Vec<String>,

    #[clap(long, default_value_t = 1000)]
    retry_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const ECHO_TIMEOUT: Duration = Duration::from_secs(30);

fn preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > 10 {
        format!("{}...", text.chars().take(10).collect::<String>())
    }
    else {
        text.into_owned()
    }
}

async fn run_server(config: &ZincConfig, bind: SocketAddr) -> anyhow::Result<()> {
    let mut event_loop = EventLoop::bind(config, bind, |channel: &mut Channel, payload: Bytes| {
        info!("echoing {} bytes from {:?}: {}", payload.len(), channel.peer_addr(), preview(&payload));
        channel.send(payload);
    }).await?;

    info!("echo server listening on {:?}", event_loop.local_addr()?);
    event_loop.run().await
}

async fn run_client(config: &ZincConfig, bind: SocketAddr, server: SocketAddr, messages: Vec<String>) -> anyhow::Result<()> {
    let (echo_sender, mut echoes) = mpsc::unbounded_channel();
    let mut event_loop = EventLoop::connect(config, bind, server, move |_: &mut Channel, payload: Bytes| {
        if echo_sender.send(payload).is_err() {
            debug!("echo receiver is gone - dropping echo");
        }
    }).await?;

    let handle = event_loop.handle();
    let loop_task = tokio::spawn(async move { event_loop.run().await });

    for msg in &messages {
        handle.send(msg.clone())?;
    }

    for msg in &messages {
        let echo = timeout(ECHO_TIMEOUT, echoes.recv()).await?
            .ok_or_else(|| anyhow!("event loop terminated"))?;
        if echo.as_ref() != msg.as_bytes() {
            return Err(anyhow!("expected echo of {:?}, got {:?}", msg, preview(&echo)));
        }
        info!("received echo: {}", preview(&echo));
    }

    handle.shutdown();
    loop_task.await?
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = ZincConfig {
        retry_interval: Duration::from_millis(args.retry_millis),
        ..ZincConfig::default()
    };

    match args.connect {
        Some(server) => {
            let bind: SocketAddr = args.bind.as_deref().unwrap_or("0.0.0.0:0").parse()?;
            let server: SocketAddr = server.parse()?;
            run_client(&config, bind, server, args.messages).await
        }
        None => {
            let bind: SocketAddr = args.bind.as_deref().unwrap_or("0.0.0.0:1337").parse()?;
            run_server(&config, bind).await
        }
    }
}
