use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Debug client: tracks `keyword` on the relay at `url` and prints every message it receives,
/// stopping after `count` messages when given.
pub async fn run_watch(url: String, keyword: String, count: Option<usize>) -> Result<()> {
    let ws_url = format!("{}/track", url.trim_end_matches('/'));
    debug!(url = %ws_url, "connecting");

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow!("connection to {ws_url} failed: {err}")),
        Err(_) => return Err(anyhow!("timed out connecting to {ws_url}")),
    };
    let (mut write, mut read) = ws_stream.split();

    let register = serde_json::json!({ "track": keyword }).to_string();
    write
        .send(Message::Text(register.into()))
        .await
        .context("failed to send track request")?;
    info!(keyword = %keyword, "tracking; waiting for messages");

    let mut received = 0usize;
    loop {
        let frame = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            frame = read.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                println!("{}", text.as_str());
                received += 1;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("relay closed the connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(anyhow!("websocket error: {err}")),
        }
        if count.is_some_and(|limit| received >= limit) {
            break;
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
