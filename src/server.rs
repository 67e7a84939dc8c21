//! TCP accept loop and the per-connection protocol loop.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::protocol::{Decoder, Frame};
use crate::session::Session;

/// Supervisor tick period while any process is alive.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub async fn run(listener: TcpListener, config: Config) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "daemon listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let config = config.clone();
                tokio::spawn(async move {
                    info!(%peer, "accepted new client");
                    if let Err(err) = handle_client(stream, &config).await {
                        error!(%peer, %err, "client error");
                    }
                    info!(%peer, "client disconnected");
                });
            }
            Err(err) => {
                error!(%err, "accept error");
            }
        }
    }
}

/// Owns one client for its whole lifetime: decodes incoming bytes into
/// frames, dispatches them against the session, and interleaves the
/// supervisor tick whenever a process is alive. Polling never blocks
/// reads and stops on its own once no process remains.
async fn handle_client(stream: TcpStream, config: &Config) -> anyhow::Result<()> {
    let mut session = Session::new(config);
    let result = client_loop(stream, &mut session).await;
    // Runs on clean EOF and on socket errors alike.
    session.shutdown();
    result
}

async fn client_loop(stream: TcpStream, session: &mut Session) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 4096];

    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                for frame in decoder.feed(&buf[..n]) {
                    let responses = session.handle(frame);
                    write_frames(&mut writer, &responses).await?;
                }
            }
            _ = tick.tick(), if session.has_live_processes() => {
                let frames = session.poll().await;
                write_frames(&mut writer, &frames).await?;
            }
        }
    }
}

async fn write_frames(writer: &mut OwnedWriteHalf, frames: &[Frame]) -> anyhow::Result<()> {
    for frame in frames {
        debug!(command = frame.code.name(), "server sending");
        writer.write_all(&frame.encode()).await?;
    }
    if !frames.is_empty() {
        writer.flush().await?;
    }
    Ok(())
}
