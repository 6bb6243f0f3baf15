//! Ring buffer session over a digitizer's cyclic transfer.
//!
//! Owns the acquisition buffer and validates every producer-reported chunk
//! against it, so downstream code only ever sees bounded slices. The chunk
//! (notify) size must divide the capacity and the read offset is always a
//! multiple of the chunk size.

use crate::device::{CardConfig, Digitizer};
use crate::errors::{DaqError, Result};

/// One validated, consumable chunk of the ring.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
    /// Producer fill level in promille, diagnostics only.
    pub fill: u32,
}

pub struct RingBufferSession<D: Digitizer> {
    card: D,
    data: Vec<i8>,
    notify: usize,
    read_ofs: usize,
    open: bool,
}

impl<D: Digitizer> RingBufferSession<D> {
    /// Allocate the buffer and define the transfer on `card`.
    pub fn open(mut card: D, cfg: &CardConfig) -> Result<Self> {
        if cfg.notify_size == 0 || cfg.buffer_size == 0 {
            return Err(DaqError::Buffer(
                "notify and buffer sizes must be non-zero".to_string(),
            ));
        }
        if cfg.buffer_size % cfg.notify_size != 0 {
            return Err(DaqError::Buffer(format!(
                "notify size {} does not divide buffer size {}",
                cfg.notify_size, cfg.buffer_size
            )));
        }
        let mut data = vec![0i8; cfg.buffer_size];
        card.define_transfer(&mut data)?;
        Ok(Self {
            card,
            data,
            notify: cfg.notify_size,
            read_ofs: 0,
            open: true,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn notify_size(&self) -> usize {
        self.notify
    }

    pub fn read_offset(&self) -> usize {
        self.read_ofs
    }

    /// Arm the card and start streaming.
    pub fn start(&mut self) -> Result<()> {
        self.card.start()
    }

    /// Block until at least one chunk is available. Device timeouts and
    /// status errors surface here as fatal errors.
    pub fn wait_chunk(&mut self) -> Result<Chunk> {
        let st = self.card.wait_chunk()?;
        if st.pos % self.notify != 0 || st.pos + self.notify > self.data.len() {
            return Err(DaqError::Buffer(format!(
                "producer position {:#x} outside ring of {} bytes",
                st.pos,
                self.data.len()
            )));
        }
        if st.avail < self.notify {
            return Err(DaqError::Buffer(format!(
                "producer reported {} bytes available, below chunk size {}",
                st.avail, self.notify
            )));
        }
        self.read_ofs = st.pos;
        Ok(Chunk {
            offset: st.pos,
            len: self.notify,
            fill: st.fill,
        })
    }

    /// Bounded view of a chunk's bytes. `wait_chunk` already validated the
    /// offset and length against capacity.
    pub fn chunk(&self, chunk: &Chunk) -> &[i8] {
        &self.data[chunk.offset..chunk.offset + chunk.len]
    }

    /// Bounded view of an arbitrary region, used for diagnostic dumps.
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[i8]> {
        self.data.get(offset..offset + len)
    }

    /// Hand the chunk back to the producer.
    pub fn release(&mut self, chunk: Chunk) -> Result<()> {
        self.card.release_chunk(chunk.len)
    }

    /// Stop streaming and release the session.
    pub fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.card.stop()?;
        }
        Ok(())
    }
}

impl<D: Digitizer> Drop for RingBufferSession<D> {
    fn drop(&mut self) {
        // Best effort, the fatal path already reported the interesting error.
        let _ = self.close();
    }
}
