//! Probe: realtime question feed
//!
//! Connects to the feed and, for a fixed duration:
//! - prints every raw frame with its arrival offset
//! - decodes event frames and shows id, age and lock state
//! - tallies frame types
//!
//! No claims are sent and no session is needed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use acs_autolock::FEED_WS_URL;
use acs_autolock::engine::parse_frame;
use acs_autolock::timing::elapsed_seconds;

#[derive(Parser)]
#[command(name = "probe_feed", about = "Print raw realtime feed frames")]
struct Args {
    /// Feed URL
    #[arg(long, default_value = FEED_WS_URL)]
    url: String,

    /// How long to listen, in seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    println!("=== Probe: Realtime Feed ===");
    println!("URL: {}", args.url);
    println!();

    let (ws, response) = connect_async(args.url.as_str()).await?;
    println!("Connected! Response status: {}", response.status());
    println!();

    let (_write, mut read) = ws.split();
    let start = Instant::now();
    let timeout = Duration::from_secs(args.duration);
    let mut kinds: HashMap<String, usize> = HashMap::new();

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let elapsed = start.elapsed().as_secs_f64();
                let kind = serde_json::from_str::<serde_json::Value>(text.as_str())
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                    .unwrap_or_else(|| "unparsed".to_string());
                *kinds.entry(kind.clone()).or_default() += 1;

                println!("[{elapsed:.1}s] {kind}");
                match parse_frame(text.as_str()) {
                    Ok(Some(payload)) => {
                        let age = elapsed_seconds(&payload.created_at, Utc::now())
                            .map(|a| format!("{a:.2}s"))
                            .unwrap_or_else(|e| format!("? ({e})"));
                        println!(
                            "  id={} age={age} locked={}",
                            payload.id, payload.is_locked
                        );
                    }
                    Ok(None) => {}
                    Err(e) => println!("  undecodable: {e:#}"),
                }
                let preview: String = text.as_str().chars().take(300).collect();
                let ellipsis = if preview.len() < text.len() { "..." } else { "" };
                println!("  {preview}{ellipsis}");
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                println!("Server closed the connection: {frame:?}");
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                eprintln!("Error: {e}");
                break;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    println!();
    println!("=== Summary ===");
    println!("Duration: {:.1}s", start.elapsed().as_secs_f64());
    println!("Frames by type: {kinds:?}");
    Ok(())
}
