//! Sigma-threshold outlier screening of completed averages.
//!
//! Single pass: one mean/std over the whole record, then classify. An
//! iterative trimmed-mean refinement would also be defensible; the single
//! pass is a deliberate policy choice, see DESIGN.md.

/// Outcome of one screening pass over a completed average.
#[derive(Debug, Clone)]
pub struct RfiResult {
    /// Mean of the unflagged bins. Falls back to the overall mean when every
    /// bin is flagged, so it is always well defined.
    pub clean_mean: f32,
    /// Mean of the flagged bins, 0.0 when nothing is flagged.
    pub outlier_mean: f32,
    /// Per-bin flag, `flags[i]` is true when bin `i` is an outlier.
    pub flags: Vec<bool>,
    pub nbad: usize,
}

impl RfiResult {
    pub fn bad_fraction(&self) -> f32 {
        if self.flags.is_empty() {
            0.0
        } else {
            self.nbad as f32 / self.flags.len() as f32
        }
    }
}

/// Flag every value deviating more than `nsigma` standard deviations from
/// the record mean.
pub fn detect(values: &[f32], nsigma: f32) -> RfiResult {
    let n = values.len();
    if n == 0 {
        return RfiResult {
            clean_mean: 0.0,
            outlier_mean: 0.0,
            flags: Vec::new(),
            nbad: 0,
        };
    }
    let mean = values.iter().sum::<f32>() / n as f32;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
    let std = var.max(0.0).sqrt();
    let cutoff = nsigma * std;

    let mut clean_sum = 0.0f32;
    let mut bad_sum = 0.0f32;
    let mut nbad = 0usize;
    let flags: Vec<bool> = values
        .iter()
        .map(|&v| {
            let bad = (v - mean).abs() > cutoff;
            if bad {
                bad_sum += v;
                nbad += 1;
            } else {
                clean_sum += v;
            }
            bad
        })
        .collect();

    let clean_mean = if nbad == n {
        mean
    } else {
        clean_sum / (n - nbad) as f32
    };
    let outlier_mean = if nbad == 0 { 0.0 } else { bad_sum / nbad as f32 };
    RfiResult {
        clean_mean,
        outlier_mean,
        flags,
        nbad,
    }
}
