//! CSV dumping and comparison of completed operations.
//!
//! One file per device and record stream, named
//! `d_<phy_id>_<NN>.<stream>.csv` under `<results_dir>/<sim_id>/`. In dump
//! mode a header line and one line per record are written. In compare mode
//! the files are read back instead and every produced line is checked
//! against the next line of the file.

use p2g4_common::trace::{CcaRecord, ModemRxRecord, RssiRecord, RxRecord, TxRecord};
use p2g4_common::{TraceError, TraceSink, PROB_ONE};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// A stream stops being checked after this many differences.
pub const MAX_ERRORS: u32 = 15;

/// Record streams, one file each per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stream {
    Tx,
    Rx,
    Rssi,
    Cca,
    ModemRx,
}

impl Stream {
    pub const ALL: [Stream; 5] = [Stream::Tx, Stream::Rx, Stream::Rssi, Stream::Cca, Stream::ModemRx];

    /// File name component.
    pub fn name(&self) -> &'static str {
        match self {
            Stream::Tx => "Tx",
            Stream::Rx => "Rx",
            Stream::Rssi => "RSSI",
            Stream::Cca => "CCA",
            Stream::ModemRx => "ModemRx",
        }
    }

    /// CSV heading line.
    pub fn heading(&self) -> &'static str {
        match self {
            Stream::Tx => {
                "start_tx_time,end_tx_time,start_packet_time,end_packet_time,center_freq,phy_address,\
                 modulation,power_level,abort_time,recheck_time,packet_size,coding_rate,packet"
            }
            Stream::Rx => {
                "start_time,scan_duration,phy_addresses,modulation,center_freq,antenna_gain,\
                 sync_threshold,header_threshold,pream_and_addr_duration,header_duration,\
                 error_calc_rate,acceptable_pre_truncation,forced_packet_duration,abort_time,\
                 recheck_time,tx_nbr,rx_time_stamp,end_time,status,RSSI,phy_address,packet_size,packet"
            }
            Stream::Rssi => "meas_time,modulation,center_freq,antenna_gain,RSSI",
            Stream::Cca => {
                "start_time,scan_duration,scan_period,modulation,center_freq,antenna_gain,\
                 rssi_threshold,mod_threshold,stop_when_found,abort_time,recheck_time,\
                 end_time,RSSI_ave,RSSI_max,mod_rx_power,mod_found,rssi_overthreshold"
            }
            Stream::ModemRx => "time,rx_nbr,tx_nbr,ctr,BER,syncprob,SNR,anaSNR,ISISNR,rx_power",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Dump or compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Write fresh files.
    Write,
    /// Check against existing files.
    Compare {
        /// Turn the first difference into an error.
        stop_on_diff: bool,
    },
}

enum Target {
    Writer(BufWriter<File>),
    Reader(Lines<BufReader<File>>),
}

struct StreamFile {
    target: Option<Target>,
    path: PathBuf,
    lines: u32,
    differences: u32,
}

/// Per device and stream comparison outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompareStats {
    pub device: usize,
    pub stream: Stream,
    pub lines: u32,
    pub differences: u32,
    /// Whether checking went on until the end of the run.
    pub complete: bool,
}

/// [`TraceSink`] writing or checking CSV files.
pub struct DumpSink {
    mode: DumpMode,
    files: Vec<[StreamFile; 5]>,
    closed: bool,
}

/// Path of a device's file for `stream`.
pub fn dump_file_path(results_dir: &Path, sim_id: &str, phy_id: &str, device: usize, stream: Stream) -> PathBuf {
    results_dir
        .join(sim_id)
        .join(format!("d_{}_{:02}.{}.csv", phy_id, device, stream.name()))
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}

fn open_stream(path: PathBuf, mode: DumpMode, stream: Stream, device: usize) -> Result<StreamFile, TraceError> {
    let target = match mode {
        DumpMode::Write => {
            let mut w = BufWriter::new(File::create(&path)?);
            writeln!(w, "{}", stream.heading())?;
            Some(Target::Writer(w))
        }
        DumpMode::Compare { .. } => {
            let mut lines = BufReader::new(File::open(&path)?).lines();
            // Heading
            let _ = lines.next().transpose()?;
            Some(Target::Reader(lines))
        }
    };
    debug!("Device {} {} stream: {}", device, stream.name(), path.display());
    Ok(StreamFile {
        target,
        path,
        lines: 0,
        differences: 0,
    })
}

impl DumpSink {
    /// Open every device's files under `<results_dir>/<sim_id>/`.
    pub fn open(
        results_dir: &Path,
        sim_id: &str,
        phy_id: &str,
        n_devs: usize,
        mode: DumpMode,
    ) -> Result<Self, TraceError> {
        let dir = results_dir.join(sim_id);
        if mode == DumpMode::Write {
            std::fs::create_dir_all(&dir)?;
        }
        let mut files = Vec::with_capacity(n_devs);
        for d in 0..n_devs {
            let [tx, rx, rssi, cca, modem_rx] =
                Stream::ALL.map(|s| dump_file_path(results_dir, sim_id, phy_id, d, s));
            files.push([
                open_stream(tx, mode, Stream::Tx, d)?,
                open_stream(rx, mode, Stream::Rx, d)?,
                open_stream(rssi, mode, Stream::Rssi, d)?,
                open_stream(cca, mode, Stream::Cca, d)?,
                open_stream(modem_rx, mode, Stream::ModemRx, d)?,
            ]);
        }
        info!(
            "{} traces of {} devices in {}",
            if mode == DumpMode::Write { "Dumping" } else { "Comparing" },
            n_devs,
            dir.display()
        );
        Ok(Self {
            mode,
            files,
            closed: false,
        })
    }

    /// Comparison outcome of every device and stream.
    pub fn compare_stats(&self) -> Vec<CompareStats> {
        let mut out = Vec::new();
        for (device, streams) in self.files.iter().enumerate() {
            for (stream, f) in Stream::ALL.iter().zip(streams.iter()) {
                out.push(CompareStats {
                    device,
                    stream: *stream,
                    lines: f.lines,
                    differences: f.differences,
                    complete: f.target.is_some(),
                });
            }
        }
        out
    }

    fn emit(&mut self, device: usize, stream: Stream, line: &str) -> Result<(), TraceError> {
        let stop_on_diff = matches!(self.mode, DumpMode::Compare { stop_on_diff: true });
        let Some(f) = self.files.get_mut(device).map(|s| &mut s[stream.index()]) else {
            return Ok(());
        };
        let Some(target) = f.target.as_mut() else {
            return Ok(());
        };
        f.lines += 1;

        let lines = match target {
            Target::Writer(w) => {
                writeln!(w, "{}", line)?;
                return Ok(());
            }
            Target::Reader(lines) => lines,
        };

        let expected = lines.next().transpose()?;
        if expected.as_deref() == Some(line) {
            return Ok(());
        }
        let eof = expected.is_none();
        let expected = expected.unwrap_or_else(|| "<eof>".to_string());
        f.differences += 1;
        warn!("Comp: device {}, {} line {} differs", device, stream.name(), f.lines);
        debug!("Comp: read:     \"{}\"", expected);
        debug!("Comp: produced: \"{}\"", line);

        if stop_on_diff {
            return Err(TraceError::Mismatch {
                device,
                stream: stream.name(),
                line: f.lines as usize,
                expected,
                actual: line.to_string(),
            });
        }
        if eof {
            f.target = None;
        } else if f.differences > MAX_ERRORS {
            warn!(
                "Too many differences in {} for device {}; it won't be checked anymore",
                stream.name(),
                device
            );
            f.target = None;
        }
        Ok(())
    }
}

impl TraceSink for DumpSink {
    fn tx(&mut self, rec: &TxRecord<'_>) -> Result<(), TraceError> {
        let tx = rec.tx;
        let line = format!(
            "{},{},{},{},{:.6},0x{:08X},{},{:.6},{},{},{},{},{}",
            tx.start_tx_time.as_micros(),
            tx.end_tx_time.as_micros(),
            tx.start_packet_time.as_micros(),
            tx.end_packet_time.as_micros(),
            tx.radio_params.center_freq.mhz_offset(),
            tx.phy_address,
            tx.radio_params.modulation.0,
            tx.power_level.to_dbm(),
            tx.abort.abort_time.as_micros(),
            tx.abort.recheck_time.as_micros(),
            tx.packet_size,
            tx.coding_rate,
            hex_dump(rec.packet),
        );
        self.emit(rec.device, Stream::Tx, &line)
    }

    fn rx(&mut self, rec: &RxRecord<'_>) -> Result<(), TraceError> {
        let rx = rec.rx;
        let done = rec.done;
        let addresses = rx
            .addresses
            .iter()
            .map(|a| format!("0x{:08X}", a))
            .collect::<Vec<_>>()
            .join(" ");
        let line = format!(
            "{},{},{},{},{:.6},{:.6},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.6},0x{:08X},{},{}",
            rx.start_time.as_micros(),
            rx.scan_duration,
            addresses,
            rx.radio_params.modulation.0,
            rx.radio_params.center_freq.mhz_offset(),
            rx.antenna_gain.to_dbm(),
            rx.sync_threshold,
            rx.header_threshold,
            rx.pream_and_addr_duration,
            rx.header_duration,
            rx.error_calc_rate,
            rx.acceptable_pre_truncation,
            rx.forced_packet_duration,
            rx.abort.abort_time.as_micros(),
            rx.abort.recheck_time.as_micros(),
            rec.tx_nbr.map(|t| t.to_string()).unwrap_or_default(),
            done.rx_time_stamp.as_micros(),
            done.end_time.as_micros(),
            done.status as u8,
            done.rssi.to_dbm(),
            done.phy_address,
            done.packet_size,
            hex_dump(rec.packet),
        );
        self.emit(rec.device, Stream::Rx, &line)
    }

    fn rssi(&mut self, rec: &RssiRecord<'_>) -> Result<(), TraceError> {
        let req = rec.request;
        let line = format!(
            "{},{},{:.6},{:.6},{:.6}",
            req.meas_time.as_micros(),
            req.radio_params.modulation.0,
            req.radio_params.center_freq.mhz_offset(),
            req.antenna_gain.to_dbm(),
            rec.done.rssi.to_dbm(),
        );
        self.emit(rec.device, Stream::Rssi, &line)
    }

    fn cca(&mut self, rec: &CcaRecord<'_>) -> Result<(), TraceError> {
        let req = rec.request;
        let done = rec.done;
        let line = format!(
            "{},{},{},{},{:.6},{:.6},{:.6},{:.6},{},{},{},{},{:.6},{:.6},{:.6},{},{}",
            req.start_time.as_micros(),
            req.scan_duration,
            req.scan_period,
            req.radio_params.modulation.0,
            req.radio_params.center_freq.mhz_offset(),
            req.antenna_gain.to_dbm(),
            req.rssi_threshold.to_dbm(),
            req.mod_threshold.to_dbm(),
            req.stop_when_found,
            req.abort.abort_time.as_micros(),
            req.abort.recheck_time.as_micros(),
            done.end_time.as_micros(),
            done.rssi_ave.to_dbm(),
            done.rssi_max.to_dbm(),
            done.mod_rx_power.to_dbm(),
            done.mod_found as u8,
            done.rssi_overthreshold as u8,
        );
        self.emit(rec.device, Stream::Cca, &line)
    }

    fn modem_rx(&mut self, rec: &ModemRxRecord) -> Result<(), TraceError> {
        let line = format!(
            "{},{},{},{},{:e},{:e},{:.6},{:.6},{:.6},{:.6}",
            rec.time.as_micros(),
            rec.rx_nbr,
            rec.tx_nbr.map(|t| t.to_string()).unwrap_or_default(),
            rec.ctr,
            rec.ber as f64 / PROB_ONE as f64,
            rec.sync_prob as f64 / PROB_ONE as f64,
            rec.snr_total,
            rec.snr_analog,
            rec.snr_isi,
            rec.rx_power,
        );
        self.emit(rec.rx_nbr, Stream::ModemRx, &line)
    }

    fn close(&mut self) -> Result<u64, TraceError> {
        if self.closed {
            return Ok(0);
        }
        self.closed = true;

        for streams in &mut self.files {
            for f in streams.iter_mut() {
                if let Some(Target::Writer(w)) = f.target.as_mut() {
                    w.flush()?;
                }
            }
        }
        if self.mode == DumpMode::Write {
            return Ok(0);
        }

        let mut total = 0u64;
        for st in self.compare_stats() {
            total += st.differences as u64;
            if st.lines > 0 {
                let pct = st.differences as f64 * 100.0 / st.lines as f64;
                if st.differences == 0 {
                    info!(
                        "Check: device {:2}, {}: found 0/{} differences",
                        st.device,
                        st.stream.name(),
                        st.lines
                    );
                } else {
                    error!(
                        "Check: device {:2}, {}: found {}/{} differences ({:.1}%)",
                        st.device,
                        st.stream.name(),
                        st.differences,
                        st.lines,
                        pct
                    );
                }
            }
            if !st.complete {
                warn!(
                    "Check: device {:2}, {}: comparison stopped before the end of the simulation",
                    st.device,
                    st.stream.name()
                );
            }
        }
        Ok(total)
    }
}

impl Drop for DumpSink {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for streams in &mut self.files {
            for f in streams.iter_mut() {
                if let Some(Target::Writer(w)) = f.target.as_mut() {
                    if let Err(e) = w.flush() {
                        warn!("Flushing {}: {}", f.path.display(), e);
                    }
                }
            }
        }
    }
}
