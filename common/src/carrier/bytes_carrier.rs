use std::io::SeekFrom;

use api::{Metadata, PipelineError};
use async_trait::async_trait;
use bytes::Bytes;

use super::CarrierIo;

// fully materialised in-memory buffer with a cursor. intended for small
// payloads -- previews, created zips under a few MB -- where seeking is
// cheap because the whole thing already lives in memory
#[derive(Debug)]
pub struct BytesCarrier {
    data: Bytes,
    cursor: u64,
    metadata: Metadata,
}

impl BytesCarrier {
    pub fn new(data: Bytes, metadata: Metadata) -> Self {
        BytesCarrier {
            data,
            cursor: 0,
            metadata,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl CarrierIo for BytesCarrier {
    async fn read(&mut self, n: i64) -> Result<Bytes, PipelineError> {
        let len = self.len();
        if self.cursor >= len || n == 0 {
            return Ok(Bytes::new());
        }

        let remaining = (len - self.cursor) as usize;
        let take = if n < 0 {
            remaining
        } else {
            (n as usize).min(remaining)
        };

        let start = self.cursor as usize;
        let out = self.data.slice(start..start + take);
        self.cursor += take as u64;
        Ok(out)
    }

    fn seekable(&self) -> bool {
        true
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, PipelineError> {
        let len = self.len() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.cursor as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };

        if target < 0 || target > len {
            return Err(PipelineError::InvalidArguments(format!(
                "seek target {target} out of bounds [0, {len}]"
            )));
        }

        self.cursor = target as u64;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seek_then_read_returns_remaining_bytes() {
        let mut c = BytesCarrier::new(Bytes::from_static(b"0123456789"), Metadata::default());

        c.seek(SeekFrom::Start(4)).await.unwrap();
        assert_eq!(c.tell().await.unwrap(), 4);

        let rest = c.read(-1).await.unwrap();
        assert_eq!(&rest[..], b"456789");
    }

    #[tokio::test]
    async fn seek_out_of_bounds_is_rejected() {
        let mut c = BytesCarrier::new(Bytes::from_static(b"abc"), Metadata::default());
        assert!(c.seek(SeekFrom::Start(4)).await.is_err());
        assert!(c.seek(SeekFrom::End(-10)).await.is_err());
    }

    #[tokio::test]
    async fn zero_length_read_does_not_advance_cursor() {
        let mut c = BytesCarrier::new(Bytes::from_static(b"abc"), Metadata::default());
        let empty = c.read(0).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(c.tell().await.unwrap(), 0);
    }
}
