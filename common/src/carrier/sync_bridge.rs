use std::io::{Read, Seek, SeekFrom};

use super::{Carrier, CarrierIo};

// bridges a seekable `Carrier` into the blocking `Read + Seek` traits the
// `zip` crate expects. must be constructed on a tokio worker thread (so
// `Handle::current()` succeeds) and then moved into a `spawn_blocking`
// closure
pub struct SyncBridge {
    carrier: Carrier,
    handle: tokio::runtime::Handle,
}

impl SyncBridge {
    pub fn new(carrier: Carrier) -> Self {
        SyncBridge {
            carrier,
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn into_inner(self) -> Carrier {
        self.carrier
    }
}

impl Read for SyncBridge {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self
            .handle
            .clone()
            .block_on(self.carrier.read(buf.len() as i64))
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Seek for SyncBridge {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.handle
            .clone()
            .block_on(self.carrier.seek(pos))
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
