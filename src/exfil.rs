//! This module is responsible for exfilling averaged spectra to disk:
//! versioned binary headers, time-rotated output files with atomic
//! visibility, and the writer worker the realtime loop hands completed
//! averages to.
//!
//! Layout is little-endian and written by explicit routines, so the wire
//! format is stable independent of the in-memory structs.

use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::thread;

use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::accumulate::{AvgBuffer, WriteJob};
use crate::args::Settings;
use crate::rfi;
use crate::MAXCUTS;

/// Magic tag opening every power-spectrum file.
pub const PS_MAGIC: &[u8; 8] = b">>BMX<<\0";
pub const PS_HEADER_VERSION: i32 = 10;
/// Magic tag of the independently versioned RFI outlier stream.
pub const RFI_MAGIC: &[u8; 8] = b">>RFI2<\0";
pub const RFI_HEADER_VERSION: i32 = 2;

/// Suffix of an in-progress file; only removed by the atomic rename after a
/// complete write.
const TMP_SUFFIX: &str = ".new";

/// Modified Julian Date. The Unix epoch is MJD 40587.
pub fn mjd(time: &DateTime<Utc>) -> f64 {
    40587.0 + time.timestamp() as f64 / 86400.0 + time.timestamp_subsec_micros() as f64 / 86.4e9
}

/// Per-file header of the power-spectrum stream, written once per newly
/// opened file before the first record and never rewritten mid-file.
#[derive(Debug, Clone)]
pub struct PsHeader {
    pub daq_num: i32,
    pub wires: [u8; 8],
    pub card_mask: i32,
    pub nchannels: i32,
    pub sample_rate: f32,
    pub fft_size: u32,
    pub average_recs: u32,
    pub ncuts: i32,
    pub nu_min: [f32; MAXCUTS],
    pub nu_max: [f32; MAXCUTS],
    pub fft_avg: [u32; MAXCUTS],
    pub pssize: [i32; MAXCUTS],
    pub bufdelay: [i32; 2],
    pub delay: [i32; 2],
    /// Ordinal of the file's first record; monotonic across rotation.
    pub rec_num: u32,
}

impl PsHeader {
    pub fn from_settings(set: &Settings) -> Self {
        let mut nu_min = [0.0f32; MAXCUTS];
        let mut nu_max = [0.0f32; MAXCUTS];
        let mut fft_avg = [0u32; MAXCUTS];
        let mut pssize = [0i32; MAXCUTS];
        for (i, cut) in set.cuts.iter().enumerate() {
            nu_min[i] = cut.nu_min;
            nu_max[i] = cut.nu_max;
            fft_avg[i] = cut.fft_avg;
            pssize[i] = cut.pssize as i32;
        }
        Self {
            daq_num: set.daq_num,
            wires: set.wires,
            card_mask: set.channel_mask as i32,
            nchannels: set.nchannels() as i32,
            sample_rate: set.sample_rate as f32,
            fft_size: set.fft_size as u32,
            average_recs: set.average_recs,
            ncuts: set.cuts.len() as i32,
            nu_min,
            nu_max,
            fft_avg,
            pssize,
            bufdelay: set.bufdelay,
            delay: set.delay,
            rec_num: 0,
        }
    }

    pub const fn serialized_len() -> usize {
        8 + 4 + 4 + 8 + 4 + 4 + 4 + 4 + 4 + 4 + 4 * MAXCUTS * 4 + 8 + 8 + 4
    }

    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(PS_MAGIC)?;
        w.write_all(&PS_HEADER_VERSION.to_le_bytes())?;
        w.write_all(&self.daq_num.to_le_bytes())?;
        w.write_all(&self.wires)?;
        w.write_all(&self.card_mask.to_le_bytes())?;
        w.write_all(&self.nchannels.to_le_bytes())?;
        w.write_all(&self.sample_rate.to_le_bytes())?;
        w.write_all(&self.fft_size.to_le_bytes())?;
        w.write_all(&self.average_recs.to_le_bytes())?;
        w.write_all(&self.ncuts.to_le_bytes())?;
        w.write_all(self.nu_min.as_byte_slice())?;
        w.write_all(self.nu_max.as_byte_slice())?;
        w.write_all(self.fft_avg.as_byte_slice())?;
        w.write_all(self.pssize.as_byte_slice())?;
        w.write_all(self.bufdelay.as_byte_slice())?;
        w.write_all(self.delay.as_byte_slice())?;
        w.write_all(&self.rec_num.to_le_bytes())
    }
}

#[derive(Debug, Clone)]
pub struct RfiHeader {
    pub nsigma: f32,
}

impl RfiHeader {
    pub const fn serialized_len() -> usize {
        8 + 4 + 4
    }

    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(RFI_MAGIC)?;
        w.write_all(&RFI_HEADER_VERSION.to_le_bytes())?;
        w.write_all(&self.nsigma.to_le_bytes())
    }
}

struct OpenFile {
    file: File,
    final_path: PathBuf,
    tmp_path: PathBuf,
    opened: DateTime<Utc>,
}

/// Owns one output stream's file handle and its time-boundary rotation.
/// Files are written under a temporary name and only renamed to their final
/// name after a complete, successful write.
pub struct FileRotator {
    dir: PathBuf,
    pattern: String,
    rotate_every_min: i64,
    open: Option<OpenFile>,
}

impl FileRotator {
    pub fn new(dir: PathBuf, pattern: String, rotate_every_min: i64) -> Self {
        Self {
            dir,
            pattern,
            rotate_every_min,
            open: None,
        }
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        match &self.open {
            None => true,
            Some(f) => {
                self.rotate_every_min > 0
                    && now.signed_duration_since(f.opened)
                        >= chrono::Duration::minutes(self.rotate_every_min)
            }
        }
    }

    /// Rotate if the boundary has elapsed (checked at write time): finalize
    /// the in-flight file, open a fresh temporary one and let `write_header`
    /// stamp it. Returns whether a new file was opened.
    pub fn rotate_if_due<F>(&mut self, now: DateTime<Utc>, write_header: F) -> io::Result<bool>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        if !self.due(now) {
            return Ok(false);
        }
        self.finalize()?;
        let final_path = self.dir.join(now.format(&self.pattern).to_string());
        let tmp_path = PathBuf::from(format!("{}{}", final_path.display(), TMP_SUFFIX));
        let mut file = File::create(&tmp_path)?;
        write_header(&mut file)?;
        info!(file = %final_path.display(), "opened new output file");
        self.open = Some(OpenFile {
            file,
            final_path,
            tmp_path,
            opened: now,
        });
        Ok(true)
    }

    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.open {
            Some(f) => f.file.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no output file open",
            )),
        }
    }

    /// Flush and atomically publish the current file under its final name.
    pub fn finalize(&mut self) -> io::Result<()> {
        if let Some(mut f) = self.open.take() {
            f.file.flush()?;
            drop(f.file);
            fs::rename(&f.tmp_path, &f.final_path)?;
            info!(file = %f.final_path.display(), "output file completed");
        }
        Ok(())
    }
}

/// Owns both output streams, the header state and the monotonic record
/// counter.
pub struct Writer {
    ps: FileRotator,
    rfi_files: Option<FileRotator>,
    header: PsHeader,
    rfi_header: RfiHeader,
    nsigma: f32,
    /// Cumulative per-bin bad counts since acquisition start.
    numbad: Vec<i32>,
    rec_num: u32,
    last_bad_fraction: f32,
}

impl Writer {
    pub fn new(set: &Settings) -> Self {
        let rfi_files = set.rfi_on.then(|| {
            FileRotator::new(
                set.outdir.clone(),
                set.fname_rfi.clone(),
                set.new_file_every,
            )
        });
        Self {
            ps: FileRotator::new(set.outdir.clone(), set.fname_ps.clone(), set.new_file_every),
            rfi_files,
            header: PsHeader::from_settings(set),
            rfi_header: RfiHeader {
                nsigma: set.rfi_sigma,
            },
            nsigma: set.rfi_sigma,
            numbad: vec![0; set.len_ps],
            rec_num: 0,
            last_bad_fraction: 0.0,
        }
    }

    pub fn rec_num(&self) -> u32 {
        self.rec_num
    }

    pub fn last_bad_fraction(&self) -> f32 {
        self.last_bad_fraction
    }

    pub const fn ps_record_len(len_ps: usize) -> usize {
        // mjd + tone + 6 temperatures + 4 voltages + diode + spectrum
        8 + 4 + 6 * 4 + 4 * 4 + 4 + 4 * len_ps
    }

    pub const fn rfi_record_len(len_ps: usize) -> usize {
        // mjd + clean mean + outlier mean + bad fraction + per-bin counts
        8 + 4 + 4 + 4 + 4 * len_ps
    }

    /// Screen one completed average for outliers and append it (and, when
    /// enabled, the RFI stream record) to the rotated output files.
    pub fn write_average(&mut self, buf: &AvgBuffer) -> io::Result<()> {
        self.rec_num += 1;
        let now = Utc::now();

        let header = &mut self.header;
        header.rec_num = self.rec_num;
        self.ps.rotate_if_due(now, |f| header.write_to(f))?;

        let mut rec = Vec::with_capacity(Self::ps_record_len(buf.ps.len()));
        rec.extend_from_slice(&mjd(&now).to_le_bytes());
        rec.extend_from_slice(&buf.tone_freq.to_le_bytes());
        rec.extend_from_slice(buf.aux.temp_fpga.as_byte_slice());
        rec.extend_from_slice(buf.aux.temp_adc.as_byte_slice());
        rec.extend_from_slice(buf.aux.temp_frontend.as_byte_slice());
        rec.extend_from_slice(buf.aux.voltage.as_byte_slice());
        rec.extend_from_slice(&buf.aux.diode.to_le_bytes());
        rec.extend_from_slice(buf.ps.as_byte_slice());
        self.ps.append(&rec)?;

        if let Some(rfi_files) = &mut self.rfi_files {
            let result = rfi::detect(&buf.ps, self.nsigma);
            for (count, &flag) in self.numbad.iter_mut().zip(&result.flags) {
                *count += flag as i32;
            }
            self.last_bad_fraction = result.bad_fraction();

            let rfi_header = &self.rfi_header;
            rfi_files.rotate_if_due(now, |f| rfi_header.write_to(f))?;
            let mut rec = Vec::with_capacity(Self::rfi_record_len(buf.ps.len()));
            rec.extend_from_slice(&mjd(&now).to_le_bytes());
            rec.extend_from_slice(&result.clean_mean.to_le_bytes());
            rec.extend_from_slice(&result.outlier_mean.to_le_bytes());
            rec.extend_from_slice(&result.bad_fraction().to_le_bytes());
            rec.extend_from_slice(self.numbad.as_byte_slice());
            rfi_files.append(&rec)?;
        }
        Ok(())
    }

    /// Publish everything written so far under the final names.
    pub fn finish(&mut self) -> io::Result<()> {
        self.ps.finalize()?;
        if let Some(rfi_files) = &mut self.rfi_files {
            rfi_files.finalize()?;
        }
        Ok(())
    }
}

/// Snapshot a chunk of raw waveform bytes, overwriting the previous one.
pub fn write_waveform(path: &Path, data: &[i8]) -> io::Result<()> {
    let mut f = File::create(path)?;
    f.write_all(data.as_byte_slice())
}

/// Dedicated persistence worker. Receives drained averages over a bounded
/// channel (capacity one, so at most one write is in flight), writes them,
/// and recycles each buffer back to the accumulator. I/O failures are
/// logged and the record skipped; acquisition never stalls on disk.
pub fn spawn_writer(
    set: &Settings,
    jobs: Receiver<WriteJob>,
    recycle: Sender<AvgBuffer>,
) -> thread::JoinHandle<()> {
    let mut writer = Writer::new(set);
    thread::Builder::new()
        .name("exfil".to_string())
        .spawn(move || {
            for job in jobs {
                if let Err(e) = writer.write_average(&job.buf) {
                    warn!("skipping output record {}: {e}", writer.rec_num());
                }
                // Hand the slot back; on shutdown the accumulator may
                // already be gone.
                if recycle.send(job.buf).is_err() {
                    break;
                }
            }
            if let Err(e) = writer.finish() {
                error!("finalizing output files failed: {e}");
            }
        })
        .expect("spawning the exfil thread cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Settings;

    fn test_settings(dir: &Path) -> Settings {
        let mut set = Settings::simulated(1 << 10, 3, 4);
        set.outdir = dir.to_path_buf();
        set.rfi_on = true;
        set.new_file_every = 0;
        set
    }

    fn avg(len_ps: usize, value: f32) -> AvgBuffer {
        AvgBuffer {
            ps: vec![value; len_ps],
            aux: Default::default(),
            tone_freq: 0.0,
            count: 4,
            generation: 0,
        }
    }

    #[test]
    fn header_serializes_to_fixed_length_with_magic_prefix() {
        let set = test_settings(Path::new("."));
        let mut header = PsHeader::from_settings(&set);
        header.rec_num = 1;
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), PsHeader::serialized_len());
        assert_eq!(&bytes[..8], PS_MAGIC);
        assert_eq!(bytes[8..12], PS_HEADER_VERSION.to_le_bytes());
        let mut rfi_bytes = Vec::new();
        RfiHeader { nsigma: 3.0 }.write_to(&mut rfi_bytes).unwrap();
        assert_eq!(rfi_bytes.len(), RfiHeader::serialized_len());
        assert_eq!(&rfi_bytes[..8], RFI_MAGIC);
    }

    #[test]
    fn final_name_only_appears_after_a_complete_write() {
        let dir = tempfile::tempdir().unwrap();
        let set = test_settings(dir.path());
        let mut writer = Writer::new(&set);
        writer.write_average(&avg(set.len_ps, 1.0)).unwrap();
        // While the file is in flight only the temporary name exists.
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(!names.is_empty());
        assert!(names.iter().all(|n| n.ends_with(TMP_SUFFIX)));

        writer.finish().unwrap();
        let mut finals = 0;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().into_string().unwrap();
            assert!(!name.ends_with(TMP_SUFFIX), "leftover temp file {name}");
            finals += 1;
            if name.starts_with("ps_") {
                let expect = PsHeader::serialized_len() + Writer::ps_record_len(set.len_ps);
                assert_eq!(entry.metadata().unwrap().len(), expect as u64);
            }
        }
        assert_eq!(finals, 2); // ps + rfi
    }

    #[test]
    fn rec_num_is_monotonic_and_stamped_into_fresh_headers() {
        let dir = tempfile::tempdir().unwrap();
        let set = test_settings(dir.path());
        let mut writer = Writer::new(&set);
        for _ in 0..3 {
            writer.write_average(&avg(set.len_ps, 1.0)).unwrap();
        }
        assert_eq!(writer.rec_num(), 3);
        writer.finish().unwrap();
        let ps_file = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("ps_"))
            })
            .unwrap();
        let bytes = fs::read(ps_file).unwrap();
        // rec_num is the trailing header field: ordinal of the first record.
        let at = PsHeader::serialized_len() - 4;
        assert_eq!(bytes[at..at + 4], 1u32.to_le_bytes());
        assert_eq!(
            bytes.len(),
            PsHeader::serialized_len() + 3 * Writer::ps_record_len(set.len_ps)
        );
    }

    #[test]
    fn rotation_publishes_the_previous_file_and_reheaders_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let mut rotator = FileRotator::new(
            dir.path().to_path_buf(),
            "ps_%y%m%d_%H%M.data".to_string(),
            15,
        );
        let t0 = Utc::now();
        let mut headers = 0u32;
        let mut stamp = |f: &mut File| {
            headers += 1;
            f.write_all(&headers.to_le_bytes())
        };
        assert!(rotator.rotate_if_due(t0, &mut stamp).unwrap());
        rotator.append(&[0u8; 16]).unwrap();
        // Within the interval nothing rotates.
        assert!(!rotator
            .rotate_if_due(t0 + chrono::Duration::minutes(14), &mut stamp)
            .unwrap());
        // Past the boundary the old file is published and a new one opens.
        assert!(rotator
            .rotate_if_due(t0 + chrono::Duration::minutes(16), &mut stamp)
            .unwrap());
        assert_eq!(headers, 2);
        let published: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| !e.file_name().to_str().unwrap().ends_with(TMP_SUFFIX))
            .collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].metadata().unwrap().len(), 4 + 16);
        rotator.finalize().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn cumulative_bad_counts_follow_the_flags() {
        let dir = tempfile::tempdir().unwrap();
        let set = test_settings(dir.path());
        let mut writer = Writer::new(&set);
        let mut buf = avg(set.len_ps, 1.0);
        buf.ps[7] = 1000.0;
        writer.write_average(&buf).unwrap();
        writer.write_average(&buf).unwrap();
        assert!(writer.last_bad_fraction() > 0.0);
        assert_eq!(writer.numbad[7], 2);
        assert_eq!(writer.numbad[0], 0);
    }
}
