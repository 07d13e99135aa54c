use std::io::SeekFrom;
use std::sync::OnceLock;
use std::time::Duration;

use api::{Metadata, PipelineError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use super::CarrierIo;

// the http client used by every Url carrier is process-shared -- built
// once, lazily, and cloned cheaply afterwards
static SHARED_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client(timeout: Duration) -> Client {
    SHARED_CLIENT
        .get_or_init(|| {
            Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to construct the shared http client")
        })
        .clone()
}

// remote resource accessed through HTTP range requests. logically seekable:
// seeks just move the cursor, the next read issues a ranged GET starting
// there
pub struct UrlCarrier {
    client: Client,
    url: String,
    length: Option<u64>,
    cursor: u64,
    lookahead: usize,
    retry_attempts: u32,
    retry_backoff: Duration,
    metadata: Metadata,
}

impl UrlCarrier {
    pub fn new(
        url: impl Into<String>,
        lookahead: usize,
        retry_attempts: u32,
        retry_backoff: Duration,
        http_timeout: Duration,
        metadata: Metadata,
    ) -> Self {
        UrlCarrier {
            client: shared_client(http_timeout),
            url: url.into(),
            length: None,
            cursor: 0,
            lookahead,
            retry_attempts,
            retry_backoff,
            metadata,
        }
    }

    #[instrument(skip(self))]
    async fn ensure_length(&mut self) -> Result<u64, PipelineError> {
        if let Some(len) = self.length {
            return Ok(len);
        }

        if let Ok(resp) = self.client.head(&self.url).send().await {
            if let Some(len) = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
            {
                self.length = Some(len);
                return Ok(len);
            }
        }

        // HEAD didn't give us a length (some servers don't support it) --
        // fall back to a one-byte ranged GET and read Content-Range's total
        debug!("HEAD failed to establish length, falling back to a 1-byte range GET");
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| PipelineError::NetworkError(e.to_string()))?;

        let len = match resp.headers().get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
            Some(range) => range
                .rsplit('/')
                .next()
                .and_then(|total| total.parse::<u64>().ok())
                .ok_or_else(|| {
                    PipelineError::NetworkError(
                        "malformed Content-Range header from source".into(),
                    )
                })?,
            None => resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| {
                    PipelineError::NetworkError(
                        "source did not advertise a length via HEAD or Range".into(),
                    )
                })?,
        };

        self.length = Some(len);
        Ok(len)
    }

    // issues one ranged GET, retrying idempotent failures with a bounded
    // exponential backoff. concatenates successive 206 responses if the
    // server returns fewer bytes than requested
    #[instrument(skip(self))]
    async fn ranged_get(&self, start: u64, len: u64) -> Result<Bytes, PipelineError> {
        let mut collected = BytesMut::new();
        let mut pos = start;
        let end = start + len;

        while pos < end {
            let chunk = self.ranged_get_once(pos, end - 1).await?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            collected.extend_from_slice(&chunk);
        }

        Ok(collected.freeze())
    }

    async fn ranged_get_once(&self, start: u64, end_inclusive: u64) -> Result<Bytes, PipelineError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .get(&self.url)
                .header(RANGE, format!("bytes={start}-{end_inclusive}"))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT || resp.status().is_success() => {
                    return resp
                        .bytes()
                        .await
                        .map_err(|e| PipelineError::NetworkError(e.to_string()));
                }
                Ok(resp) => {
                    return Err(PipelineError::NetworkError(format!(
                        "source returned unexpected status {}",
                        resp.status()
                    )));
                }
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(attempt, error = %e, "range GET failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(PipelineError::NetworkError(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl CarrierIo for UrlCarrier {
    #[instrument(skip(self))]
    async fn read(&mut self, n: i64) -> Result<Bytes, PipelineError> {
        if n == 0 {
            return Ok(Bytes::new());
        }

        let length = self.ensure_length().await?;
        if self.cursor >= length {
            return Ok(Bytes::new());
        }

        let remaining = length - self.cursor;
        let want = if n < 0 {
            remaining
        } else {
            (n as u64).min(remaining)
        };

        // amortise small reads with the look-ahead buffer, but never read
        // past what the caller asked for when they asked for everything
        let fetch_len = if n < 0 {
            want
        } else {
            want.max(self.lookahead as u64).min(remaining)
        };

        let data = self.ranged_get(self.cursor, fetch_len).await?;
        let data = data.slice(0..(want as usize).min(data.len()));
        self.cursor += data.len() as u64;
        Ok(data)
    }

    fn seekable(&self) -> bool {
        true
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, PipelineError> {
        let length = self.ensure_length().await? as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.cursor as i64 + delta,
            SeekFrom::End(delta) => length + delta,
        };

        self.cursor = target.clamp(0, length) as u64;
        Ok(self.cursor)
    }

    async fn tell(&mut self) -> Result<u64, PipelineError> {
        Ok(self.cursor)
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl std::fmt::Debug for UrlCarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlCarrier")
            .field("url", &self.url)
            .field("length", &self.length)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}
