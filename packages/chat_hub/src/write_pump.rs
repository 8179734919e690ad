//! Per-connection writer: drains the outbound queue into the transport and
//! keeps the peer alive with periodic pings.

use bytes::Bytes;
use futures::{Sink, SinkExt};
use std::error::Error as StdError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::debug;

/// Frame handed to the transport sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Ping,
    Close,
}

#[derive(Debug, Clone)]
pub struct WritePumpConfig {
    /// Upper bound on a single frame write.
    pub write_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for WritePumpConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WritePumpError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(Box<dyn StdError + Send + Sync>),
}

/// Forward queued payloads to `sink` until the queue is closed and drained,
/// then send a close frame and return.
///
/// A ping is written every `ping_interval`. Any write that fails or exceeds
/// `write_timeout` ends the pump with an error; the caller is expected to
/// unregister the connection.
pub async fn run_write_pump<S>(
    mut queue: mpsc::Receiver<Bytes>,
    mut sink: S,
    config: WritePumpConfig,
) -> Result<(), WritePumpError>
where
    S: Sink<Frame> + Unpin,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(payload) => write_frame(&mut sink, Frame::Text(payload), config.write_timeout).await?,
                None => {
                    if let Err(e) = write_frame(&mut sink, Frame::Close, config.write_timeout).await {
                        debug!("close frame not delivered: {e}");
                    }
                    return Ok(());
                }
            },
            _ = ping.tick() => write_frame(&mut sink, Frame::Ping, config.write_timeout).await?,
        }
    }
}

async fn write_frame<S>(sink: &mut S, frame: Frame, limit: Duration) -> Result<(), WritePumpError>
where
    S: Sink<Frame> + Unpin,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    match timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WritePumpError::Transport(e.into())),
        Err(_) => Err(WritePumpError::Timeout(limit)),
    }
}
