//! Narrow capability interface over the digitizer card.
//!
//! The realtime loop only ever talks to the [`Digitizer`] trait, so its logic
//! is identical whether the chunks come from real hardware or from the
//! deterministic [`SimCard`] stand-in. A hardware-backed adapter implements
//! the same trait on top of the vendor driver and is selected at startup.

use std::thread;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::errors::{DaqError, Result};

/// Scalar card setup, applied in one step instead of per-register pokes.
#[derive(Debug, Clone)]
pub struct CardConfig {
    /// Channel enable mask: 1, 2, or 3 (both).
    pub channel_mask: u32,
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Use the external reference clock instead of the internal PLL.
    pub ext_clock: bool,
    /// ADC input range in mV.
    pub adc_range_mv: i32,
    /// Chunk ("notify") size in bytes.
    pub notify_size: usize,
    /// Total ring capacity in bytes. Must be a multiple of `notify_size`.
    pub buffer_size: usize,
    /// DMA wait timeout in ms.
    pub timeout_ms: u64,
}

impl CardConfig {
    pub fn two_channel(&self) -> bool {
        self.channel_mask == 3
    }

    pub fn nchannels(&self) -> usize {
        1 + self.two_channel() as usize
    }
}

/// Producer-side state after a successful chunk wait.
#[derive(Debug, Clone, Copy)]
pub struct ChunkStatus {
    /// Byte offset of the ready chunk inside the ring.
    pub pos: usize,
    /// Bytes available to the consumer (at least one notify size).
    pub avail: usize,
    /// Buffer occupancy in promille, diagnostics only.
    pub fill: u32,
}

pub trait Digitizer {
    fn name(&self) -> &str;

    /// Define the cyclic transfer over `buf`. The simulated card fills the
    /// buffer with its test pattern here; hardware arms DMA into it.
    fn define_transfer(&mut self, buf: &mut [i8]) -> Result<()>;

    /// Start streaming (card start + trigger + DMA).
    fn start(&mut self) -> Result<()>;

    /// Block until the next chunk is ready, bounded by the card timeout.
    fn wait_chunk(&mut self) -> Result<ChunkStatus>;

    /// Tell the producer `nbytes` have been consumed so the ring can advance.
    fn release_chunk(&mut self, nbytes: usize) -> Result<()>;

    /// Stop streaming.
    fn stop(&mut self) -> Result<()>;
}

/// Baseline fill level the simulated drift decays back to.
const SIM_FILL_FLOOR: u32 = 69;
/// Per-chunk fill drift step in promille.
const SIM_FILL_STEP: u32 = 30;

/// Deterministic software digitizer.
///
/// The buffer is filled once at transfer definition with a randomized
/// half-zeros/half-full-scale pattern per channel lane, which gives the
/// downstream averaging and outlier screening realistic spread. Chunk pacing
/// is emulated by sleeping out the remainder of the block period, and a faked
/// fill level drifts up whenever the consumer falls behind the cadence.
pub struct SimCard {
    cfg: CardConfig,
    fft_size: usize,
    rng: StdRng,
    sim_ofs: usize,
    buf_mult: usize,
    fill: u32,
    period: Duration,
    last: Instant,
    running: bool,
}

impl SimCard {
    pub fn new(cfg: CardConfig, fft_size: usize) -> Self {
        Self::with_seed(cfg, fft_size, rand::random())
    }

    /// Seeded variant so tests can reproduce the exact buffer contents.
    pub fn with_seed(cfg: CardConfig, fft_size: usize, seed: u64) -> Self {
        let period = Duration::from_secs_f64(fft_size as f64 / cfg.sample_rate);
        let buf_mult = if cfg.notify_size > 0 {
            cfg.buffer_size / cfg.notify_size
        } else {
            0
        };
        Self {
            cfg,
            fft_size,
            rng: StdRng::seed_from_u64(seed),
            sim_ofs: 0,
            buf_mult,
            fill: SIM_FILL_FLOOR,
            period,
            last: Instant::now(),
            running: false,
        }
    }

    /// One channel lane of the test pattern: half zeros, half full scale,
    /// shuffled.
    fn pattern(&mut self) -> Vec<i8> {
        let mut sh = vec![0i8; self.fft_size];
        for s in sh.iter_mut().skip(self.fft_size / 2) {
            *s = 127;
        }
        sh.shuffle(&mut self.rng);
        sh
    }
}

impl Digitizer for SimCard {
    fn name(&self) -> &str {
        "simulated digitizer"
    }

    fn define_transfer(&mut self, buf: &mut [i8]) -> Result<()> {
        if buf.len() != self.cfg.buffer_size {
            return Err(DaqError::Buffer(format!(
                "transfer buffer is {} bytes, card expects {}",
                buf.len(),
                self.cfg.buffer_size
            )));
        }
        let stride = self.cfg.nchannels();
        for lane in 0..stride {
            let sh = self.pattern();
            let mut i = 0usize;
            for k in (lane..buf.len()).step_by(stride) {
                buf[k] = sh[i];
                i += 1;
                if i == self.fft_size {
                    i = 0;
                }
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        self.last = Instant::now();
        Ok(())
    }

    fn wait_chunk(&mut self) -> Result<ChunkStatus> {
        if !self.running {
            return Err(DaqError::Device("card is not streaming".to_string()));
        }
        let pos = self.cfg.notify_size * self.sim_ofs;
        self.sim_ofs = (self.sim_ofs + 1) % self.buf_mult;
        // Pacing: if the consumer took longer than one block period the fake
        // fill level drifts up, otherwise sleep out the remainder and decay.
        let elapsed = self.last.elapsed();
        if elapsed > self.period {
            self.fill += SIM_FILL_STEP;
        } else {
            thread::sleep(self.period - elapsed);
            if self.fill > SIM_FILL_FLOOR {
                self.fill -= SIM_FILL_STEP;
            }
        }
        self.last = Instant::now();
        Ok(ChunkStatus {
            pos,
            avail: self.cfg.notify_size,
            fill: self.fill,
        })
    }

    fn release_chunk(&mut self, _nbytes: usize) -> Result<()> {
        // Nothing to advance, the pattern buffer is static.
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(notify: usize, mult: usize) -> CardConfig {
        CardConfig {
            channel_mask: 3,
            sample_rate: 1e9,
            ext_clock: false,
            adc_range_mv: 250,
            notify_size: notify,
            buffer_size: notify * mult,
            timeout_ms: 5000,
        }
    }

    #[test]
    fn pattern_is_half_zero_half_full_scale() {
        let mut card = SimCard::with_seed(cfg(2048, 4), 1024, 7);
        let mut buf = vec![0i8; 8192];
        card.define_transfer(&mut buf).unwrap();
        let zeros = buf.iter().filter(|&&b| b == 0).count();
        let full = buf.iter().filter(|&&b| b == 127).count();
        assert_eq!(zeros, 4096);
        assert_eq!(full, 4096);
    }

    #[test]
    fn chunk_positions_cycle_through_the_ring() {
        let mut card = SimCard::with_seed(cfg(1024, 4), 512, 1);
        card.start().unwrap();
        for k in 0..10 {
            let st = card.wait_chunk().unwrap();
            assert_eq!(st.pos, (k * 1024) % 4096);
            assert_eq!(st.avail, 1024);
            card.release_chunk(st.avail).unwrap();
        }
    }

    #[test]
    fn wait_before_start_is_a_device_error() {
        let mut card = SimCard::with_seed(cfg(1024, 4), 512, 1);
        assert!(matches!(card.wait_chunk(), Err(DaqError::Device(_))));
    }

    #[test]
    fn seeded_cards_produce_identical_buffers() {
        let mut a = vec![0i8; 4096];
        let mut b = vec![1i8; 4096];
        SimCard::with_seed(cfg(1024, 4), 512, 42)
            .define_transfer(&mut a)
            .unwrap();
        SimCard::with_seed(cfg(1024, 4), 512, 42)
            .define_transfer(&mut b)
            .unwrap();
        assert_eq!(a, b);
    }
}
