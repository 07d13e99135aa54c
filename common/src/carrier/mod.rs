pub mod bytes_carrier;
pub mod queue;
pub mod sync_bridge;
pub mod url;

use std::io::SeekFrom;

use api::{Metadata, PipelineError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

pub use bytes_carrier::BytesCarrier;
pub use queue::QueueCarrier;
pub use sync_bridge::SyncBridge;
pub use url::UrlCarrier;

// uniform byte-stream capability shared by all three carrier variants.
//
// seekability is a capability query (`seekable()`), not a runtime type
// error -- callers that require a seek declare it up front and the executor
// inserts a materialiser when it's missing (see executor::ensure_seekable)
#[async_trait]
pub trait CarrierIo: Send {
    // returns up to `n` bytes, or all remaining bytes if `n` is negative.
    // returns an empty buffer at end of stream. a request for exactly zero
    // bytes returns empty without consuming or advancing anything
    async fn read(&mut self, n: i64) -> Result<Bytes, PipelineError>;

    fn seekable(&self) -> bool {
        false
    }

    async fn seek(&mut self, _pos: SeekFrom) -> Result<u64, PipelineError> {
        Err(PipelineError::UnsupportedOperation(
            "seek is not supported on this carrier".into(),
        ))
    }

    async fn tell(&mut self) -> Result<u64, PipelineError> {
        Err(PipelineError::UnsupportedOperation(
            "tell is not supported on this carrier".into(),
        ))
    }

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;
}

// the carrier enum is the concrete type that flows between steps. `Carrier`
// itself just delegates to whichever variant is active
#[derive(Debug)]
pub enum Carrier {
    Queue(QueueCarrier),
    Bytes(BytesCarrier),
    Url(UrlCarrier),
}

impl Carrier {
    pub fn bytes(data: impl Into<Bytes>, metadata: Metadata) -> Self {
        Carrier::Bytes(BytesCarrier::new(data.into(), metadata))
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, PipelineError> {
        self.read(-1).await
    }
}

// the zip steps need a seekable carrier to walk a central directory (section
// 4.4). a carrier that doesn't support seeking is materialised into memory
// here, and rejected outright if it would blow the configured limit rather
// than silently exhausting the process
pub async fn ensure_seekable(
    mut carrier: Carrier,
    limit: u64,
) -> Result<Carrier, PipelineError> {
    if carrier.seekable() {
        return Ok(carrier);
    }

    let mut buf = BytesMut::new();
    loop {
        let chunk = carrier.read(64 * 1024).await?;
        if chunk.is_empty() {
            break;
        }
        if buf.len() as u64 + chunk.len() as u64 > limit {
            return Err(PipelineError::ResourceLimit(format!(
                "non-seekable input exceeds the {limit} byte buffering limit"
            )));
        }
        buf.extend_from_slice(&chunk);
    }

    let metadata = carrier.metadata().clone();
    Ok(Carrier::bytes(buf.freeze(), metadata))
}

#[async_trait]
impl CarrierIo for Carrier {
    async fn read(&mut self, n: i64) -> Result<Bytes, PipelineError> {
        match self {
            Carrier::Queue(c) => c.read(n).await,
            Carrier::Bytes(c) => c.read(n).await,
            Carrier::Url(c) => c.read(n).await,
        }
    }

    fn seekable(&self) -> bool {
        match self {
            Carrier::Queue(c) => c.seekable(),
            Carrier::Bytes(c) => c.seekable(),
            Carrier::Url(c) => c.seekable(),
        }
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, PipelineError> {
        match self {
            Carrier::Queue(c) => c.seek(pos).await,
            Carrier::Bytes(c) => c.seek(pos).await,
            Carrier::Url(c) => c.seek(pos).await,
        }
    }

    async fn tell(&mut self) -> Result<u64, PipelineError> {
        match self {
            Carrier::Queue(c) => c.tell().await,
            Carrier::Bytes(c) => c.tell().await,
            Carrier::Url(c) => c.tell().await,
        }
    }

    fn metadata(&self) -> &Metadata {
        match self {
            Carrier::Queue(c) => c.metadata(),
            Carrier::Bytes(c) => c.metadata(),
            Carrier::Url(c) => c.metadata(),
        }
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Carrier::Queue(c) => c.metadata_mut(),
            Carrier::Bytes(c) => c.metadata_mut(),
            Carrier::Url(c) => c.metadata_mut(),
        }
    }
}
