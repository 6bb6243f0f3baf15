//! Double-buffered ("tick/tock") accumulation of per-chunk spectra.
//!
//! The realtime loop ingests into the active buffer; when the configured
//! averaging depth is reached the buffer is finalized into means and handed
//! to the persistence worker as an owned job, while the other buffer takes
//! over immediately. A buffer slot is only ever reused after the worker has
//! sent it back, so at most one write is in flight and the worker can never
//! observe a half-written average. If a second average completes before the
//! first write finishes, the swap blocks on the recycle channel instead of
//! dropping data.

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::aux::AuxTelemetry;
use crate::errors::{DaqError, Result};
use crate::process::SpectrumRecord;

/// One averaging buffer. While "active" it holds running sums; once handed
/// off it holds means and is read-only to the acquisition side.
#[derive(Debug, Clone)]
pub struct AvgBuffer {
    pub ps: Vec<f32>,
    pub aux: AuxTelemetry,
    /// Tone frequency at completion time, stamped into the record.
    pub tone_freq: f32,
    pub count: u32,
    /// Bumped each time the slot is reset for reuse, which only happens
    /// after the persistence worker has confirmed completion.
    pub generation: u64,
}

impl AvgBuffer {
    fn new(len_ps: usize) -> Self {
        Self {
            ps: vec![0.0; len_ps],
            aux: AuxTelemetry::default(),
            tone_freq: 0.0,
            count: 0,
            generation: 0,
        }
    }

    fn reset(&mut self) {
        self.ps.iter_mut().for_each(|v| *v = 0.0);
        self.aux.zero();
        self.tone_freq = 0.0;
        self.count = 0;
        self.generation += 1;
    }

    /// Turn sums into means. Called exactly once, at averaging depth.
    fn finalize(&mut self) {
        let n = self.count as f32;
        self.ps.iter_mut().for_each(|v| *v /= n);
        self.aux.mean(self.count);
    }
}

/// A completed, immutable average on its way to disk.
pub struct WriteJob {
    pub buf: AvgBuffer,
}

pub struct Accumulator {
    average_recs: u32,
    active: AvgBuffer,
    /// The idle slot. `None` while its previous contents are still being
    /// written, in which case the next swap blocks on `recycled`.
    spare: Option<AvgBuffer>,
    jobs: Sender<WriteJob>,
    recycled: Receiver<AvgBuffer>,
    completed: u64,
}

impl Accumulator {
    pub fn new(
        len_ps: usize,
        average_recs: u32,
        jobs: Sender<WriteJob>,
        recycled: Receiver<AvgBuffer>,
    ) -> Result<Self> {
        if average_recs == 0 {
            return Err(DaqError::Config(
                "averaging depth must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            average_recs,
            active: AvgBuffer::new(len_ps),
            spare: Some(AvgBuffer::new(len_ps)),
            jobs,
            recycled,
            completed: 0,
        })
    }

    /// Completed averages handed off so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// True while a handed-off buffer has not been recycled yet.
    pub fn write_in_flight(&self) -> bool {
        self.spare.is_none()
    }

    /// Add one spectrum (and its aux sample) into the active buffer. Swaps
    /// buffers and hands the completed average off when the averaging depth
    /// is reached.
    pub fn ingest(&mut self, rec: &SpectrumRecord, aux: &AuxTelemetry, tone_freq: f32) -> Result<()> {
        if rec.ps.len() != self.active.ps.len() {
            return Err(DaqError::Buffer(format!(
                "spectrum record has {} values, accumulator expects {}",
                rec.ps.len(),
                self.active.ps.len()
            )));
        }
        for (sum, v) in self.active.ps.iter_mut().zip(&rec.ps) {
            *sum += v;
        }
        self.active.aux.add(aux);
        self.active.tone_freq = tone_freq;
        self.active.count += 1;
        if self.active.count == self.average_recs {
            self.rotate()?;
        }
        Ok(())
    }

    /// Swap roles: the full buffer drains to the worker, the other slot
    /// becomes active. Blocks only when the previous write is still in
    /// flight (back-pressure, never data loss).
    fn rotate(&mut self) -> Result<()> {
        self.active.finalize();
        let mut next = match self.spare.take() {
            Some(buf) => buf,
            None => {
                debug!("previous write still in flight, waiting for buffer");
                self.recycled
                    .recv()
                    .map_err(|_| DaqError::Buffer("persistence worker is gone".to_string()))?
            }
        };
        next.reset();
        let full = std::mem::replace(&mut self.active, next);
        self.jobs
            .send(WriteJob { buf: full })
            .map_err(|_| DaqError::Buffer("persistence worker is gone".to_string()))?;
        self.completed += 1;
        debug!(completed = self.completed, "average handed to writer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn rec(ps: &[f32]) -> SpectrumRecord {
        SpectrumRecord {
            ps: ps.to_vec(),
            stream: 0,
        }
    }

    #[test]
    fn hands_off_component_wise_means_after_depth_records() {
        let (jtx, jrx) = bounded(1);
        let (_rtx, rrx) = bounded::<AvgBuffer>(2);
        let mut acc = Accumulator::new(2, 4, jtx, rrx).unwrap();
        let aux = AuxTelemetry {
            temp_fpga: [40.0, 40.0],
            ..Default::default()
        };
        for k in 1..=4 {
            acc.ingest(&rec(&[k as f32, 2.0 * k as f32]), &aux, 150.0).unwrap();
        }
        assert_eq!(acc.completed(), 1);
        let job = jrx.try_recv().expect("one job after four records");
        assert_eq!(job.buf.ps, vec![2.5, 5.0]);
        assert_eq!(job.buf.count, 4);
        assert_eq!(job.buf.aux.temp_fpga, [40.0, 40.0]);
        assert_eq!(job.buf.tone_freq, 150.0);
    }

    #[test]
    fn roles_swap_exactly_once_per_completed_average() {
        let (jtx, jrx) = bounded(1);
        let (rtx, rrx) = bounded(2);
        let mut acc = Accumulator::new(1, 2, jtx, rrx).unwrap();
        for _ in 0..2 {
            acc.ingest(&rec(&[1.0]), &AuxTelemetry::default(), 0.0).unwrap();
        }
        assert_eq!(acc.completed(), 1);
        assert!(acc.write_in_flight());
        // Worker confirms, slot becomes reusable.
        let job = jrx.recv().unwrap();
        rtx.send(job.buf).unwrap();
        for _ in 0..2 {
            acc.ingest(&rec(&[3.0]), &AuxTelemetry::default(), 0.0).unwrap();
        }
        assert_eq!(acc.completed(), 2);
        let job = jrx.recv().unwrap();
        assert_eq!(job.buf.ps, vec![3.0]);
    }

    #[test]
    fn generation_advances_only_after_worker_confirmation() {
        let (jtx, jrx) = bounded(1);
        let (rtx, rrx) = bounded(2);
        let mut acc = Accumulator::new(1, 1, jtx, rrx).unwrap();
        acc.ingest(&rec(&[1.0]), &AuxTelemetry::default(), 0.0).unwrap();
        let first = jrx.recv().unwrap();
        assert_eq!(first.buf.generation, 0);
        // Second average uses the pristine spare, still generation 1 after
        // its reset; the drained buffer keeps its generation while in
        // flight.
        rtx.send(first.buf).unwrap();
        acc.ingest(&rec(&[2.0]), &AuxTelemetry::default(), 0.0).unwrap();
        let second = jrx.recv().unwrap();
        assert_eq!(second.buf.generation, 1);
        rtx.send(second.buf).unwrap();
        // Third reuses the recycled first buffer, whose generation only now
        // advances.
        acc.ingest(&rec(&[3.0]), &AuxTelemetry::default(), 0.0).unwrap();
        let third = jrx.recv().unwrap();
        assert_eq!(third.buf.generation, 1);
        assert_eq!(third.buf.ps, vec![3.0]);
    }

    #[test]
    fn mismatched_record_length_is_rejected() {
        let (jtx, _jrx) = bounded(1);
        let (_rtx, rrx) = bounded(2);
        let mut acc = Accumulator::new(4, 2, jtx, rrx).unwrap();
        assert!(matches!(
            acc.ingest(&rec(&[1.0]), &AuxTelemetry::default(), 0.0),
            Err(DaqError::Buffer(_))
        ));
    }
}
