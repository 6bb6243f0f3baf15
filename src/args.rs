//! Argument parsing for running from the command line, and the derived
//! run settings shared across the pipeline.

use std::path::PathBuf;

use clap::Parser;

use crate::device::CardConfig;
use crate::errors::{DaqError, Result};
use crate::process;
use crate::MAXCUTS;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Run against the simulated digitizer instead of real hardware
    #[clap(long)]
    pub simulate: bool,
    /// Samples per FFT block, one channel (must be even)
    #[clap(long, default_value_t = 1 << 14)]
    pub fft_size: usize,
    /// Channel enable mask: 1, 2, or 3 for both
    #[clap(long, default_value_t = 3)]
    pub channel_mask: u32,
    /// Digitizer sample rate in Hz
    #[clap(long, default_value_t = 1.1e9)]
    pub sample_rate: f64,
    /// Ring capacity as a multiple of the chunk (notify) size
    #[clap(long, default_value_t = 8)]
    pub buf_mult: usize,
    /// Spectra averaged into one output record
    #[clap(long, default_value_t = 32)]
    pub average_recs: u32,
    /// Stop after this many chunks (0 = run until interrupted)
    #[clap(short, long, default_value_t = 0)]
    pub nsamples: u64,
    /// Sigma threshold for RFI outlier flagging
    #[clap(long, default_value_t = 3.0)]
    pub rfi_sigma: f32,
    /// Write the RFI outlier stream alongside the power spectra
    #[clap(long)]
    pub rfi: bool,
    /// Minutes between output file rotations (0 = one file per run)
    #[clap(long, default_value_t = 15)]
    pub new_file_every: i64,
    /// Output directory
    #[clap(short, long, default_value = ".")]
    pub outdir: PathBuf,
    /// Frequency cut as min:max:avg (MHz, MHz, bins averaged); repeatable
    #[clap(long = "cut", value_parser = parse_cut, multiple_occurrences(true))]
    pub cuts: Vec<CutSpec>,
    /// Bytes of raw waveform to snapshot each chunk (0 = off)
    #[clap(long, default_value_t = 0)]
    pub wave_nbytes: usize,
    /// Dump the last chunk to a file on shutdown
    #[clap(long)]
    pub dump_last_buffer: bool,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

/// One frequency sub-range of the band with its own bin averaging.
#[derive(Debug, Clone)]
pub struct CutSpec {
    pub nu_min: f32,
    pub nu_max: f32,
    /// Raw FFT bins averaged into one output bin.
    pub fft_avg: u32,
    /// Output bins this cut contributes, derived from the band fraction.
    pub pssize: usize,
}

fn parse_cut(s: &str) -> std::result::Result<CutSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err("expected min:max:avg".to_string());
    }
    let nu_min: f32 = parts[0].parse().map_err(|_| "bad min frequency")?;
    let nu_max: f32 = parts[1].parse().map_err(|_| "bad max frequency")?;
    let fft_avg: u32 = parts[2].parse().map_err(|_| "bad bin average")?;
    if nu_max <= nu_min {
        return Err("cut max must exceed min".to_string());
    }
    if fft_avg == 0 {
        return Err("bin average must be at least 1".to_string());
    }
    Ok(CutSpec {
        nu_min,
        nu_max,
        fft_avg,
        pssize: 0,
    })
}

/// Validated run configuration with all derived quantities.
#[derive(Debug, Clone)]
pub struct Settings {
    pub simulate: bool,
    pub fft_size: usize,
    pub channel_mask: u32,
    pub sample_rate: f64,
    pub buf_mult: usize,
    pub average_recs: u32,
    pub nsamples: u64,
    pub rfi_on: bool,
    pub rfi_sigma: f32,
    pub new_file_every: i64,
    pub outdir: PathBuf,
    pub fname_ps: String,
    pub fname_rfi: String,
    pub wave_nbytes: usize,
    pub wave_fname: String,
    pub dump_last_buffer: bool,
    pub cuts: Vec<CutSpec>,
    pub daq_num: i32,
    pub wires: [u8; 8],
    pub bufdelay: [i32; 2],
    pub delay: [i32; 2],
    // derived
    pub two_channel: bool,
    pub notify_size: usize,
    pub buffer_size: usize,
    pub len_ps: usize,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.fft_size == 0 || args.fft_size % 2 != 0 {
            return Err(DaqError::Config(format!(
                "fft size {} must be even and non-zero",
                args.fft_size
            )));
        }
        if !(1..=3).contains(&args.channel_mask) {
            return Err(DaqError::Config(format!(
                "channel mask {} not in 1..=3",
                args.channel_mask
            )));
        }
        if args.buf_mult < 2 {
            return Err(DaqError::Config(
                "ring must hold at least two chunks".to_string(),
            ));
        }
        if args.cuts.len() > MAXCUTS {
            return Err(DaqError::Config(format!(
                "at most {MAXCUTS} frequency cuts supported"
            )));
        }
        let nyquist_mhz = (args.sample_rate / 2.0 / 1e6) as f32;
        let mut cuts = if args.cuts.is_empty() {
            // Full band, 32-fold bin averaging.
            vec![CutSpec {
                nu_min: 0.0,
                nu_max: nyquist_mhz,
                fft_avg: 32,
                pssize: 0,
            }]
        } else {
            args.cuts.clone()
        };
        for cut in &mut cuts {
            if cut.nu_max > nyquist_mhz {
                return Err(DaqError::Config(format!(
                    "cut reaches {} MHz, above Nyquist {} MHz",
                    cut.nu_max, nyquist_mhz
                )));
            }
            let bins = ((cut.nu_max - cut.nu_min) / nyquist_mhz * (args.fft_size / 2) as f32)
                .round() as usize;
            cut.pssize = (bins / cut.fft_avg as usize).max(1);
        }

        let two_channel = args.channel_mask == 3;
        let notify_size = args.fft_size * (1 + two_channel as usize);
        let ncorr = process::ncorr(two_channel);
        let len_ps = ncorr * cuts.iter().map(|c| c.pssize).sum::<usize>();
        Ok(Self {
            simulate: args.simulate,
            fft_size: args.fft_size,
            channel_mask: args.channel_mask,
            sample_rate: args.sample_rate,
            buf_mult: args.buf_mult,
            average_recs: args.average_recs,
            nsamples: args.nsamples,
            rfi_on: args.rfi,
            rfi_sigma: args.rfi_sigma,
            new_file_every: args.new_file_every,
            outdir: args.outdir.clone(),
            fname_ps: "ps_%y%m%d_%H%M.data".to_string(),
            fname_rfi: "rfi_%y%m%d_%H%M.data".to_string(),
            wave_nbytes: args.wave_nbytes,
            wave_fname: "waveform.data".to_string(),
            dump_last_buffer: args.dump_last_buffer,
            cuts,
            daq_num: 1,
            wires: *b"12342134",
            bufdelay: [0, 0],
            delay: [0, 0],
            two_channel,
            notify_size,
            buffer_size: notify_size * args.buf_mult,
            len_ps,
        })
    }

    /// Simulated-run settings with the default full-band cut, used by tests
    /// and the end-to-end scenario.
    pub fn simulated(fft_size: usize, channel_mask: u32, average_recs: u32) -> Self {
        let args = Args::parse_from([
            "ps_slurper".to_string(),
            "--simulate".to_string(),
            "--sample-rate=1e9".to_string(),
            format!("--fft-size={fft_size}"),
            format!("--channel-mask={channel_mask}"),
            format!("--average-recs={average_recs}"),
        ]);
        // Defaults above are always valid.
        match Self::from_args(&args) {
            Ok(set) => set,
            Err(_) => unreachable!("builtin simulated settings are valid"),
        }
    }

    pub fn nchannels(&self) -> usize {
        1 + self.two_channel as usize
    }

    pub fn card_config(&self) -> CardConfig {
        CardConfig {
            channel_mask: self.channel_mask,
            sample_rate: self.sample_rate,
            ext_clock: false,
            adc_range_mv: 250,
            notify_size: self.notify_size,
            buffer_size: self.buffer_size,
            timeout_ms: 5000,
        }
    }

    pub fn pssizes(&self) -> Vec<usize> {
        self.cuts.iter().map(|c| c.pssize).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sizes_follow_the_channel_mask() {
        let set = Settings::simulated(1024, 3, 4);
        assert!(set.two_channel);
        assert_eq!(set.notify_size, 2048);
        assert_eq!(set.buffer_size, 2048 * 8);
        // Full band cut: 512 raw bins / 32 averaged, 4 products.
        assert_eq!(set.len_ps, 4 * 16);

        let set = Settings::simulated(1024, 1, 4);
        assert_eq!(set.notify_size, 1024);
        assert_eq!(set.len_ps, 16);
    }

    #[test]
    fn degenerate_configs_are_rejected_before_the_loop() {
        let args = Args::parse_from(["ps_slurper", "--simulate", "--channel-mask=5"]);
        assert!(matches!(
            Settings::from_args(&args),
            Err(DaqError::Config(_))
        ));
        let args = Args::parse_from(["ps_slurper", "--simulate", "--fft-size=1023"]);
        assert!(matches!(
            Settings::from_args(&args),
            Err(DaqError::Config(_))
        ));
    }

    #[test]
    fn cut_parsing_accepts_min_max_avg() {
        let cut = parse_cut("100:200:16").unwrap();
        assert_eq!(cut.nu_min, 100.0);
        assert_eq!(cut.nu_max, 200.0);
        assert_eq!(cut.fft_avg, 16);
        assert!(parse_cut("200:100:16").is_err());
        assert!(parse_cut("1:2").is_err());
        assert!(parse_cut("1:2:0").is_err());
    }

    #[test]
    fn cut_pssize_scales_with_band_fraction() {
        let args = Args::parse_from([
            "ps_slurper",
            "--simulate",
            "--fft-size=1024",
            "--channel-mask=1",
            "--sample-rate=1e9",
            "--cut=0:250:1",
        ]);
        let set = Settings::from_args(&args).unwrap();
        // Half the 500 MHz band: 256 of 512 raw bins.
        assert_eq!(set.cuts[0].pssize, 256);
        let args = Args::parse_from([
            "ps_slurper",
            "--simulate",
            "--sample-rate=1e9",
            "--cut=0:600:1",
        ]);
        assert!(matches!(
            Settings::from_args(&args),
            Err(DaqError::Config(_))
        ));
    }
}
