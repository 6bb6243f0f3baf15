use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use ps_slurper::accumulate::Accumulator;
use ps_slurper::acquire::AcquisitionLoop;
use ps_slurper::args::{convert_filter, Args, Settings};
use ps_slurper::aux::{SimFreqGen, SimSensor};
use ps_slurper::device::SimCard;
use ps_slurper::exfil;
use ps_slurper::process::FoldPower;
use ps_slurper::ring::RingBufferSession;

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let set = match Settings::from_args(&args) {
        Ok(set) => set,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };
    if !set.simulate {
        // The hardware adapter plugs in behind the Digitizer trait; this
        // build only carries the simulated card.
        error!("hardware digitizer support is not linked into this build, run with --simulate");
        std::process::exit(2);
    }
    info!(
        fft_size = set.fft_size,
        channels = set.nchannels(),
        average_recs = set.average_recs,
        len_ps = set.len_ps,
        "configured simulated digitizer"
    );

    // Ctrl-C requests a graceful stop, observed at loop iteration
    // boundaries.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed)) {
            warn!("no Ctrl-C handler, stop with the sample target only: {e}");
        }
    }

    // One write in flight per run; the recycle lane returns drained buffers.
    let (job_tx, job_rx) = bounded(1);
    let (recycle_tx, recycle_rx) = bounded(2);
    let writer = exfil::spawn_writer(&set, job_rx, recycle_tx);

    let fatal = {
        let card = SimCard::new(set.card_config(), set.fft_size);
        let ring = match RingBufferSession::open(card, &set.card_config()) {
            Ok(ring) => ring,
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        };
        let accumulator = match Accumulator::new(set.len_ps, set.average_recs, job_tx, recycle_rx)
        {
            Ok(acc) => acc,
            Err(e) => {
                error!("{e}");
                std::process::exit(2);
            }
        };
        let processor = FoldPower::new(set.two_channel, set.pssizes());
        let mut aloop = AcquisitionLoop::new(
            ring,
            processor,
            accumulator,
            Some(Box::new(SimFreqGen::new(vec![0.0]))),
            Some(Box::new(SimSensor::new(rand::random()))),
            cancel,
            &set,
        );
        match aloop.run() {
            Ok(summary) => {
                info!(
                    samples = summary.samples,
                    averages = aloop.accumulator().completed(),
                    "acquisition finished"
                );
                false
            }
            Err(e) => {
                error!("fatal: {e}");
                true
            }
        }
        // Dropping the loop drops the accumulator, closing the job channel
        // so the writer drains and finalizes its files.
    };

    if writer.join().is_err() {
        error!("persistence worker panicked");
    }
    if fatal {
        std::process::exit(1);
    }
}
