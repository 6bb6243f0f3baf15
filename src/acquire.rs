//! The realtime acquisition loop.
//!
//! Single-threaded, cooperative, one iteration per chunk: wait for the next
//! chunk (the only blocking call, bounded by the card timeout), process it,
//! drive the side collaborators once, release it. Cancellation is observed
//! only at iteration boundaries; device errors are fatal and propagate out
//! so the process can clean up and exit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::accumulate::Accumulator;
use crate::args::Settings;
use crate::aux::{AuxTelemetry, EnvSensor, FreqGen};
use crate::device::Digitizer;
use crate::errors::Result;
use crate::exfil;
use crate::process::SpectralProcessor;
use crate::ring::RingBufferSession;

/// Why the loop left its running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// External stop request (Ctrl-C).
    Cancelled,
    /// The configured chunk target was reached.
    SampleTarget,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSummary {
    pub exit: LoopExit,
    /// Chunk-accept iterations performed.
    pub samples: u64,
    /// Inter-chunk latency of the last iteration, seconds.
    pub last_dt: f32,
}

pub struct AcquisitionLoop<D: Digitizer, P: SpectralProcessor> {
    ring: RingBufferSession<D>,
    processor: P,
    accumulator: Accumulator,
    fgen: Option<Box<dyn FreqGen>>,
    sensor: Option<Box<dyn EnvSensor>>,
    cancel: Arc<AtomicBool>,
    nsamples: u64,
    wave_nbytes: usize,
    wave_path: PathBuf,
    dump_last: bool,
    dump_path: PathBuf,
    block_period: f32,
}

impl<D: Digitizer, P: SpectralProcessor> AcquisitionLoop<D, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: RingBufferSession<D>,
        processor: P,
        accumulator: Accumulator,
        fgen: Option<Box<dyn FreqGen>>,
        sensor: Option<Box<dyn EnvSensor>>,
        cancel: Arc<AtomicBool>,
        set: &Settings,
    ) -> Self {
        Self {
            ring,
            processor,
            accumulator,
            fgen,
            sensor,
            cancel,
            nsamples: set.nsamples,
            wave_nbytes: set.wave_nbytes,
            wave_path: set.outdir.join(&set.wave_fname),
            dump_last: set.dump_last_buffer,
            dump_path: set.outdir.join("last_buffer.data"),
            block_period: (set.fft_size as f64 / set.sample_rate) as f32,
        }
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Run to completion. Returns the exit summary, or a fatal device error
    /// after which only cleanup remains.
    pub fn run(&mut self) -> Result<LoopSummary> {
        info!("starting acquisition loop");
        self.ring.start()?;

        let t_start = Instant::now();
        let mut t_last = Instant::now();
        let mut samples = 0u64;
        let mut last_dt = 0.0f32;
        let mut last_chunk = None;

        let exit = loop {
            // Cooperative cancellation, once per iteration boundary.
            if self.cancel.load(Ordering::Relaxed) {
                break LoopExit::Cancelled;
            }
            let chunk = self.ring.wait_chunk()?;
            last_dt = t_last.elapsed().as_secs_f32();
            t_last = Instant::now();

            let rec = self.processor.process(self.ring.chunk(&chunk));
            let aux = match &mut self.sensor {
                Some(sensor) => sensor.poll(),
                None => AuxTelemetry::default(),
            };
            let tone = match &mut self.fgen {
                Some(fgen) => {
                    fgen.step();
                    fgen.tone_freq()
                }
                None => 0.0,
            };
            self.accumulator.ingest(&rec, &aux, tone)?;

            if self.wave_nbytes > 0 {
                let n = self.wave_nbytes.min(chunk.len);
                if let Some(data) = self.ring.slice(chunk.offset, n) {
                    if let Err(e) = exfil::write_waveform(&self.wave_path, data) {
                        warn!("waveform snapshot failed: {e}");
                    }
                }
            }

            debug!(
                dt = last_dt,
                period = self.block_period,
                fill = chunk.fill,
                stream = rec.stream,
                "chunk processed"
            );

            last_chunk = Some((chunk.offset, chunk.len));
            self.ring.release(chunk)?;
            samples += 1;
            if self.nsamples > 0 && samples == self.nsamples {
                break LoopExit::SampleTarget;
            }
        };

        match exit {
            LoopExit::Cancelled => info!("stop requested, shutting down"),
            LoopExit::SampleTarget => info!(samples, "reached requested sample count"),
        }
        if self.dump_last {
            if let Some((offset, len)) = last_chunk {
                if let Some(data) = self.ring.slice(offset, len) {
                    if let Err(e) = exfil::write_waveform(&self.dump_path, data) {
                        warn!("last buffer dump failed: {e}");
                    }
                }
            }
        }
        self.ring.close()?;
        info!(
            elapsed = t_start.elapsed().as_secs_f32(),
            samples, "acquisition loop closed"
        );
        Ok(LoopSummary {
            exit,
            samples,
            last_dt,
        })
    }
}
