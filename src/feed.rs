//! Realtime feed transport.
//!
//! Keeps a websocket connection to the feed open, forwarding every text
//! frame to the race controller over an mpsc channel. Drops are handled by
//! an explicit reconnect loop with capped exponential backoff; the channel
//! (and everything behind it) survives reconnects untouched.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::state::RaceStats;

/// Appwrite realtime heartbeat frame.
const HEARTBEAT_FRAME: &str = r#"{"type":"ping"}"#;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Upper bound on a single connect and handshake.
    pub connect_timeout: Duration,
    /// Interval for client heartbeats; `None` disables them.
    pub heartbeat: Option<Duration>,
}

/// Why a single connection ended.
#[derive(Debug)]
enum SessionEnd {
    /// Remote closed or the stream errored; reconnect.
    Dropped(String),
    /// Shutdown requested or nobody is listening any more; stop.
    Stop,
}

/// Next delay after a failed connection attempt.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Run the feed until shutdown or until the receiving side goes away.
pub async fn run_feed(
    settings: FeedSettings,
    frames: mpsc::Sender<String>,
    stats: Arc<RaceStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = settings.reconnect_delay;

    loop {
        if *shutdown.borrow() {
            break;
        }

        info!("Connecting to feed...");
        let connect = tokio::time::timeout(
            settings.connect_timeout,
            connect_async(settings.url.as_str()),
        );
        let connected = tokio::select! {
            result = connect => result,
            _ = shutdown.changed() => break,
        };

        let established = match connected {
            Ok(Ok((ws, response))) => {
                RaceStats::bump(&stats.feed_connections);
                delay = settings.reconnect_delay;
                info!("Feed connected ({}), listening for new questions", response.status());
                match pump(ws, &frames, settings.heartbeat, &mut shutdown).await {
                    SessionEnd::Stop => break,
                    SessionEnd::Dropped(reason) => {
                        warn!("Feed dropped: {reason}, reconnecting in {delay:?}");
                    }
                }
                true
            }
            Ok(Err(e)) => {
                warn!("Feed connection failed: {e}, retrying in {delay:?}");
                false
            }
            Err(_) => {
                warn!(
                    "Feed connection timed out after {:?}, retrying in {delay:?}",
                    settings.connect_timeout
                );
                false
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        if !established {
            delay = next_backoff(delay, settings.max_reconnect_delay);
        }
    }

    info!("Feed listener stopped");
}

/// Forward frames from one connection until it ends.
async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    frames: &mpsc::Sender<String>,
    heartbeat: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let period = heartbeat.unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if frames.send(text.as_str().to_owned()).await.is_err() {
                        return SessionEnd::Stop;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("close {} {}", f.code, f.reason.as_str()))
                        .unwrap_or_else(|| "close".to_string());
                    return SessionEnd::Dropped(reason);
                }
                Some(Ok(_)) => {} // ping, pong, binary
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
            _ = ticker.tick(), if heartbeat.is_some() => {
                debug!("Sending feed heartbeat");
                if let Err(e) = write.send(Message::Text(HEARTBEAT_FRAME.into())).await {
                    return SessionEnd::Dropped(format!("heartbeat failed: {e}"));
                }
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Stop;
            }
        }
    }
}
