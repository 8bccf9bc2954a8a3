use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::GatewayStreamChunk;
use crate::providers::types::StreamEvent;

pub async fn parse_sse_stream<S, E>(mut stream: S, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut byte_buf: Vec<u8> = Vec::new();
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        byte_buf.extend_from_slice(&bytes);

        // Decode as much valid UTF-8 as possible, keeping a split code point
        // for the next chunk.
        let decoded = match std::str::from_utf8(&byte_buf) {
            Ok(s) => {
                let decoded = s.to_string();
                byte_buf.clear();
                decoded
            }
            Err(e) if e.error_len().is_some() => {
                let decoded = String::from_utf8_lossy(&byte_buf).into_owned();
                byte_buf.clear();
                decoded
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to == 0 {
                    continue;
                }
                let tail = byte_buf.split_off(valid_up_to);
                let decoded = String::from_utf8_lossy(&byte_buf).into_owned();
                byte_buf = tail;
                decoded
            }
        };

        buffer.push_str(&decoded.replace("\r\n", "\n"));

        // Process complete SSE events (delimited by double newline)
        while let Some(event_end) = buffer.find("\n\n") {
            let event_text = buffer[..event_end].to_string();
            buffer.drain(..event_end + 2);

            for line in event_text.lines() {
                let payload = if let Some(p) = line.strip_prefix("data: ") {
                    p
                } else if let Some(p) = line.strip_prefix("data:") {
                    p
                } else {
                    continue;
                };

                if payload.trim() == "[DONE]" {
                    let _ = tx.send(StreamEvent::Done).await;
                    return;
                }

                match serde_json::from_str::<GatewayStreamChunk>(payload) {
                    Ok(chunk) => {
                        if !forward_chunk(chunk, &tx).await {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse gateway SSE data: {}", e);
                    }
                }
            }
        }
    }

    // The upstream closed without a [DONE] marker.
    let _ = tx.send(StreamEvent::Done).await;
}

/// Returns `false` once the stream should stop: an error was reported or the
/// receiver went away.
async fn forward_chunk(chunk: GatewayStreamChunk, tx: &mpsc::Sender<StreamEvent>) -> bool {
    if let Some(error) = chunk.error {
        let _ = tx.send(StreamEvent::Error(error.into_message())).await;
        return false;
    }

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() && tx.send(StreamEvent::Token(content)).await.is_err() {
                return false;
            }
        }
        for image in choice.delta.images.unwrap_or_default() {
            if tx.send(StreamEvent::Image(image.image_url.url)).await.is_err() {
                return false;
            }
        }
    }

    if let Some(sources) = chunk.sources {
        if tx.send(StreamEvent::Citations(sources)).await.is_err() {
            return false;
        }
    }

    true
}
