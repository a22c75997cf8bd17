use anyhow::{Result, bail};
use reqwest::{Client, Response};
use std::time::Duration;

/// Largest media file (audio/image) fetched for text extraction: 25 MB,
/// the transcription endpoint's own upload limit.
pub const MAX_MEDIA_BYTES: usize = 25 * 1024 * 1024;

/// Response bodies kept from the downstream webhook, for logs and notifier text.
pub const MAX_REPLY_BYTES: usize = 64 * 1024;

/// Build a `reqwest::Client` with a 10 s connect timeout and the given overall timeout.
///
/// Falls back to the default client if the builder fails.
pub fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Read a response body, refusing anything above `max_bytes`.
///
/// A `Content-Length` over the limit fails before any bytes are read.
/// Otherwise the body is streamed and cut at the limit; the flag reports
/// whether that happened.
pub async fn limited_body(resp: Response, max_bytes: usize) -> Result<(Vec<u8>, bool)> {
    if let Some(len) = resp.content_length()
        && usize::try_from(len).unwrap_or(usize::MAX) > max_bytes
    {
        bail!(
            "response body too large: Content-Length {} exceeds limit {}",
            len,
            max_bytes
        );
    }

    let mut buf = Vec::new();
    let mut resp = resp;
    while let Some(chunk) = resp.chunk().await? {
        let room = max_bytes.saturating_sub(buf.len());
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf, false))
}

/// [`limited_body`] decoded lossily as UTF-8, with `[truncated]` appended when cut.
pub async fn limited_text(resp: Response, max_bytes: usize) -> Result<String> {
    let (bytes, truncated) = limited_body(resp, max_bytes).await?;
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str("\n[truncated]");
    }
    Ok(text)
}
