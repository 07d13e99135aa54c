use api::{Metadata, PipelineError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::instrument;

use super::CarrierIo;

// items pushed onto a queue carrier's channel. the producer signals end of
// stream with `End` and a failed producer with `Error`, which the next
// `read()` call re-raises to the consumer as the original error variant --
// carrying the whole `PipelineError` (not just its message) is what lets a
// `NotFound`/`CryptoAuthError`/etc. raised deep inside a producer task reach
// the http layer as the right status code instead of collapsing to Internal
enum Item {
    Chunk(Bytes),
    End,
    Error(PipelineError),
}

// the sending half handed to a step's producer task. not `Clone`: a queue
// carrier has exactly one producer
pub struct QueueProducer {
    tx: mpsc::Sender<Item>,
}

impl QueueProducer {
    pub async fn push(&self, chunk: Bytes) -> Result<(), PipelineError> {
        self.tx
            .send(Item::Chunk(chunk))
            .await
            .map_err(|_| PipelineError::Cancelled)
    }

    pub async fn finish(self) {
        let _ = self.tx.send(Item::End).await;
    }

    pub async fn fail(self, err: &PipelineError) {
        let _ = self.tx.send(Item::Error(err.clone())).await;
    }
}

// bounded async FIFO of byte chunks backing the Queue carrier. not seekable.
// holding the abort handle for the producer task lets the executor cancel
// upstream work the moment a consumer is dropped
pub struct QueueCarrier {
    rx: mpsc::Receiver<Item>,
    leftover: BytesMut,
    finished: bool,
    producer_handle: Option<AbortHandle>,
    metadata: Metadata,
}

impl QueueCarrier {
    pub fn new(capacity: usize, metadata: Metadata) -> (QueueProducer, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            QueueProducer { tx },
            QueueCarrier {
                rx,
                leftover: BytesMut::new(),
                finished: false,
                producer_handle: None,
                metadata,
            },
        )
    }

    // records the spawned producer task's abort handle so drop-time
    // cancellation can reach it and propagate upstream
    pub fn with_producer_handle(mut self, handle: AbortHandle) -> Self {
        self.producer_handle = Some(handle);
        self
    }

    async fn recv_chunk(&mut self) -> Result<Option<Bytes>, PipelineError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Item::Chunk(b)) => Ok(Some(b)),
            Some(Item::End) | None => {
                self.finished = true;
                Ok(None)
            }
            Some(Item::Error(err)) => {
                self.finished = true;
                Err(err)
            }
        }
    }
}

impl Drop for QueueCarrier {
    fn drop(&mut self) {
        if let Some(handle) = self.producer_handle.take() {
            if !self.finished {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl CarrierIo for QueueCarrier {
    #[instrument(skip(self))]
    async fn read(&mut self, n: i64) -> Result<Bytes, PipelineError> {
        if n == 0 {
            return Ok(Bytes::new());
        }

        if n < 0 {
            let mut out = BytesMut::new();
            out.extend_from_slice(&self.leftover);
            self.leftover.clear();
            while let Some(chunk) = self.recv_chunk().await? {
                out.extend_from_slice(&chunk);
            }
            return Ok(out.freeze());
        }

        let want = n as usize;
        while self.leftover.len() < want {
            match self.recv_chunk().await? {
                Some(chunk) => self.leftover.extend_from_slice(&chunk),
                None => break,
            }
        }

        let take = want.min(self.leftover.len());
        let out = self.leftover.split_to(take).freeze();
        Ok(out)
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl std::fmt::Debug for QueueCarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCarrier")
            .field("finished", &self.finished)
            .field("leftover_len", &self.leftover.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_n_then_drain_matches_concatenation() {
        let (producer, mut carrier) = QueueCarrier::new(8, Metadata::default());
        let handle = tokio::spawn(async move {
            producer.push(Bytes::from_static(b"hello ")).await.unwrap();
            producer.push(Bytes::from_static(b"world")).await.unwrap();
            producer.finish().await;
        });

        let first = carrier.read(5).await.unwrap();
        assert_eq!(&first[..], b"hello");

        let rest = carrier.read(-1).await.unwrap();
        assert_eq!(&rest[..], b" world");

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn seek_and_tell_are_unsupported() {
        let (_producer, mut carrier) = QueueCarrier::new(8, Metadata::default());
        assert!(carrier.seek(std::io::SeekFrom::Start(0)).await.is_err());
        assert!(carrier.tell().await.is_err());
    }

    #[tokio::test]
    async fn zero_length_read_does_not_consume() {
        let (producer, mut carrier) = QueueCarrier::new(8, Metadata::default());
        producer.push(Bytes::from_static(b"abc")).await.unwrap();
        producer.finish().await;

        let empty = carrier.read(0).await.unwrap();
        assert!(empty.is_empty());

        let rest = carrier.read(-1).await.unwrap();
        assert_eq!(&rest[..], b"abc");
    }
}
