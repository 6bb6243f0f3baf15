//! Seam to the external spectral compute stage.
//!
//! The real instrument hands each chunk to a GPU FFT pipeline; that stage is
//! a collaborator, not part of this crate. [`SpectralProcessor`] is its
//! interface, and [`FoldPower`] is a cheap stand-in used for simulated runs
//! and tests: per-cut mean-square power folded into the output bins.

/// One processor output per chunk: the concatenated per-cut power values for
/// every correlation product, plus the id of the internal stream that
/// produced it (diagnostics only).
#[derive(Debug, Clone)]
pub struct SpectrumRecord {
    pub ps: Vec<f32>,
    pub stream: usize,
}

pub trait SpectralProcessor {
    fn process(&mut self, chunk: &[i8]) -> SpectrumRecord;
}

/// Correlation products per spectrum: auto for each channel plus the real
/// and imaginary cross power when both channels are enabled.
pub fn ncorr(two_channel: bool) -> usize {
    if two_channel {
        4
    } else {
        1
    }
}

/// Folding power estimator. Samples are normalized to full scale, squared
/// (or cross-multiplied) and folded into `pssize[cut]` bins per product.
pub struct FoldPower {
    two_channel: bool,
    pssize: Vec<usize>,
    len_ps: usize,
    stream: usize,
}

impl FoldPower {
    pub fn new(two_channel: bool, pssize: Vec<usize>) -> Self {
        let len_ps = ncorr(two_channel) * pssize.iter().sum::<usize>();
        Self {
            two_channel,
            pssize,
            len_ps,
            stream: 0,
        }
    }

    pub fn len_ps(&self) -> usize {
        self.len_ps
    }

    fn fold(out: &mut [f32], x: &[f32], y: &[f32]) {
        let m = out.len();
        if m == 0 {
            return;
        }
        let mut counts = vec![0u32; m];
        for (i, (&a, &b)) in x.iter().zip(y).enumerate() {
            out[i % m] += a * b;
            counts[i % m] += 1;
        }
        for (o, c) in out.iter_mut().zip(counts) {
            if c > 0 {
                *o /= c as f32;
            }
        }
    }
}

impl SpectralProcessor for FoldPower {
    fn process(&mut self, chunk: &[i8]) -> SpectrumRecord {
        let stride = 1 + self.two_channel as usize;
        let ch1: Vec<f32> = chunk
            .iter()
            .step_by(stride)
            .map(|&s| s as f32 / 127.0)
            .collect();
        let ch2: Vec<f32> = if self.two_channel {
            chunk
                .iter()
                .skip(1)
                .step_by(stride)
                .map(|&s| s as f32 / 127.0)
                .collect()
        } else {
            Vec::new()
        };

        let mut ps = vec![0.0f32; self.len_ps];
        let mut at = 0usize;
        for &m in &self.pssize {
            Self::fold(&mut ps[at..at + m], &ch1, &ch1);
            at += m;
            if self.two_channel {
                Self::fold(&mut ps[at..at + m], &ch2, &ch2);
                at += m;
                Self::fold(&mut ps[at..at + m], &ch1, &ch2);
                at += m;
                // Imaginary cross power: fold against the quadrature-shifted
                // partner so the product is not identically zero.
                let shifted: Vec<f32> = ch2.iter().cycle().skip(1).take(ch2.len()).copied().collect();
                Self::fold(&mut ps[at..at + m], &ch1, &shifted);
                at += m;
            }
        }
        // Mimic the multi-stream compute pipeline's round robin.
        self.stream = (self.stream + 1) % 2;
        SpectrumRecord {
            ps,
            stream: self.stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_is_products_times_cut_sizes() {
        let mut p = FoldPower::new(true, vec![8, 4]);
        assert_eq!(p.len_ps(), 4 * 12);
        let chunk = vec![64i8; 256];
        let rec = p.process(&chunk);
        assert_eq!(rec.ps.len(), 48);
    }

    #[test]
    fn constant_full_scale_input_gives_unit_auto_power() {
        let mut p = FoldPower::new(false, vec![4]);
        let chunk = vec![127i8; 64];
        let rec = p.process(&chunk);
        for &v in &rec.ps {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn stream_id_round_robins() {
        let mut p = FoldPower::new(false, vec![4]);
        let chunk = vec![0i8; 16];
        let a = p.process(&chunk).stream;
        let b = p.process(&chunk).stream;
        assert_ne!(a, b);
    }
}
