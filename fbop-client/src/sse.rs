use std::time::Duration;

use eventsource_stream::{Event, Eventsource};
use fbop_shared::api::ServerEvent;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::AppError;

const MAX_BACKOFF_SECS: u64 = 30;

/// Event streams stay open indefinitely, so no request timeout here.
fn stream_client() -> reqwest::Client {
    reqwest::Client::builder()
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Decodes a `snapshot` event; anything else yields `None`.
pub fn decode_event(ev: &Event) -> Option<ServerEvent> {
    if ev.event != "snapshot" || ev.data.is_empty() {
        return None;
    }
    match serde_json::from_str::<ServerEvent>(&ev.data) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error=%e, "SSE: undecodable snapshot");
            None
        }
    }
}

async fn open(
    client: &reqwest::Client,
    url: &str,
    token: &str,
) -> Result<BoxStream<'static, Result<Event, String>>, AppError> {
    let resp = client
        .get(url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| AppError::Http(e.to_string()))?;
    match resp.status().as_u16() {
        200..=299 => {}
        401 | 403 => return Err(AppError::AccessRevoked),
        other => return Err(AppError::Http(format!("SSE status {other}"))),
    }
    Ok(resp
        .bytes_stream()
        .eventsource()
        .map(|r| r.map_err(|e| e.to_string()))
        .boxed())
}

/// Follows `url` and forwards every snapshot until the receiver goes away
/// or the server refuses the caller. Dropped connections are retried with
/// backoff; each reconnect starts with a fresh snapshot.
pub fn spawn_watch(
    url: String,
    token: String,
) -> mpsc::Receiver<Result<ServerEvent, AppError>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let client = stream_client();
        let mut backoff_secs = 1u64;
        loop {
            match open(&client, &url, &token).await {
                Ok(mut events) => {
                    tracing::debug!(%url, "SSE: connected");
                    backoff_secs = 1;
                    while let Some(ev) = events.next().await {
                        match ev {
                            Ok(ev) => {
                                if let Some(snapshot) = decode_event(&ev)
                                    && tx.send(Ok(snapshot)).await.is_err()
                                {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error=%e, "SSE read error");
                                break;
                            }
                        }
                    }
                }
                Err(AppError::AccessRevoked) => {
                    let _ = tx.send(Err(AppError::AccessRevoked)).await;
                    return;
                }
                Err(e) => tracing::warn!(error=%e, "SSE: connect failed"),
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = std::cmp::min(backoff_secs * 2, MAX_BACKOFF_SECS);
        }
    });
    rx
}
