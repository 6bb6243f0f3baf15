//! Auxiliary telemetry and the side collaborators the loop drives once per
//! chunk: an environmental sensor and a frequency generator. Neither feeds
//! the accumulation path; their readings are averaged alongside the spectrum
//! and stamped into each output record.

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Per-cycle environment sample: two devices' worth of temperatures, four
/// auxiliary voltages and a diode state flag.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AuxTelemetry {
    pub temp_fpga: [f32; 2],
    pub temp_adc: [f32; 2],
    pub temp_frontend: [f32; 2],
    pub voltage: [f32; 4],
    pub diode: i32,
}

impl AuxTelemetry {
    pub fn zero(&mut self) {
        *self = Self::default();
    }

    /// Add a sample into this running sum.
    pub fn add(&mut self, s: &AuxTelemetry) {
        for i in 0..2 {
            self.temp_fpga[i] += s.temp_fpga[i];
            self.temp_adc[i] += s.temp_adc[i];
            self.temp_frontend[i] += s.temp_frontend[i];
        }
        for i in 0..4 {
            self.voltage[i] += s.voltage[i];
        }
        self.diode += s.diode;
    }

    /// Turn the running sum into a mean over `nrec` samples.
    pub fn mean(&mut self, nrec: u32) {
        if nrec == 0 {
            return;
        }
        let n = nrec as f32;
        for i in 0..2 {
            self.temp_fpga[i] /= n;
            self.temp_adc[i] /= n;
            self.temp_frontend[i] /= n;
        }
        for i in 0..4 {
            self.voltage[i] /= n;
        }
        self.diode /= nrec as i32;
    }
}

/// Environmental sensor collaborator, polled once per chunk.
pub trait EnvSensor {
    fn poll(&mut self) -> AuxTelemetry;
}

/// Frequency generator collaborator, stepped once per chunk. The current
/// tone frequency is stamped into each output record.
pub trait FreqGen {
    fn step(&mut self);
    fn tone_freq(&self) -> f32;
}

/// Jittered but plausible readings for simulated runs.
pub struct SimSensor {
    rng: StdRng,
}

impl SimSensor {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn around(&mut self, base: f32) -> f32 {
        base + self.rng.gen_range(-0.5..0.5)
    }
}

impl EnvSensor for SimSensor {
    fn poll(&mut self) -> AuxTelemetry {
        AuxTelemetry {
            temp_fpga: [self.around(48.0), self.around(48.0)],
            temp_adc: [self.around(41.0), self.around(41.0)],
            temp_frontend: [self.around(29.0), self.around(29.0)],
            voltage: [
                self.around(5.0),
                self.around(5.0),
                self.around(12.0),
                self.around(12.0),
            ],
            diode: 0,
        }
    }
}

/// Cycles through a fixed tone list, one step per chunk.
pub struct SimFreqGen {
    freqs: Vec<f32>,
    idx: usize,
}

impl SimFreqGen {
    pub fn new(freqs: Vec<f32>) -> Self {
        Self { freqs, idx: 0 }
    }
}

impl FreqGen for SimFreqGen {
    fn step(&mut self) {
        if !self.freqs.is_empty() {
            self.idx = (self.idx + 1) % self.freqs.len();
        }
    }

    fn tone_freq(&self) -> f32 {
        self.freqs.get(self.idx).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_then_mean_matches_arithmetic_mean() {
        let mut acc = AuxTelemetry::default();
        for k in 1..=4 {
            let s = AuxTelemetry {
                temp_fpga: [k as f32, 2.0 * k as f32],
                voltage: [k as f32, 0.0, 0.0, 0.0],
                diode: 1,
                ..Default::default()
            };
            acc.add(&s);
        }
        acc.mean(4);
        assert_eq!(acc.temp_fpga, [2.5, 5.0]);
        assert_eq!(acc.voltage[0], 2.5);
        assert_eq!(acc.diode, 1);
    }

    #[test]
    fn freq_gen_cycles_its_tone_list() {
        let mut fg = SimFreqGen::new(vec![100.0, 200.0]);
        assert_eq!(fg.tone_freq(), 100.0);
        fg.step();
        assert_eq!(fg.tone_freq(), 200.0);
        fg.step();
        assert_eq!(fg.tone_freq(), 100.0);
    }
}
