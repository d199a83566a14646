//! Packet capture in classic pcap format.
//!
//! One capture stream per device. Transmitted packets are recorded when
//! their transmission starts, received packets when they arrive. Timestamps
//! are simulated time, so captures from the same seed are byte-identical.

use crate::error::TraceError;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcpsim_types::{DeviceId, Packet, PPP_HEADER_LEN};
use tracing::{debug, warn};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
/// Largest PPP frame, so records are never truncated.
const PCAP_SNAPLEN: u32 = PPP_HEADER_LEN as u32 + u16::MAX as u32;
/// LINKTYPE_PPP
pub const LINKTYPE_PPP: u32 = 9;

/// Direction of a traced packet relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Sink for packet traces.
pub trait PacketTracer {
    /// A device exists and should get a capture, even if it never sees a
    /// packet.
    fn attach(&mut self, device: DeviceId);

    fn record(&mut self, now: Duration, device: DeviceId, direction: Direction, packet: &Packet);

    /// Flush everything and report the first error seen, if any.
    fn finish(&mut self) -> Result<(), TraceError>;
}

/// Writes pcap records to one output.
#[derive(Debug)]
pub struct PcapWriter<W: Write> {
    out: W,
}

impl<W: Write> PcapWriter<W> {
    /// Write the global header.
    pub fn new(mut out: W, linktype: u32) -> io::Result<Self> {
        out.write_all(&PCAP_MAGIC.to_le_bytes())?;
        out.write_all(&PCAP_VERSION_MAJOR.to_le_bytes())?;
        out.write_all(&PCAP_VERSION_MINOR.to_le_bytes())?;
        out.write_all(&0i32.to_le_bytes())?; // thiszone
        out.write_all(&0u32.to_le_bytes())?; // sigfigs
        out.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
        out.write_all(&linktype.to_le_bytes())?;
        Ok(Self { out })
    }

    /// Append one record with a microsecond timestamp.
    pub fn write_record(&mut self, at: Duration, frame: &[u8]) -> io::Result<()> {
        let captured = frame.len().min(PCAP_SNAPLEN as usize);
        let ts_sec = u32::try_from(at.as_secs()).unwrap_or(u32::MAX);
        self.out.write_all(&ts_sec.to_le_bytes())?;
        self.out.write_all(&at.subsec_micros().to_le_bytes())?;
        self.out.write_all(&(captured as u32).to_le_bytes())?;
        self.out.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.out.write_all(&frame[..captured])
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

type WriterFactory<W> = Box<dyn FnMut(DeviceId) -> io::Result<W>>;

/// Tracer with one [`PcapWriter`] per device, opened through a factory.
///
/// I/O errors don't interrupt the run: the first one is kept and returned
/// by [`finish`](PacketTracer::finish), and the failing device stops being
/// traced.
pub struct PcapTracer<W: Write> {
    factory: WriterFactory<W>,
    writers: BTreeMap<DeviceId, PcapWriter<W>>,
    error: Option<TraceError>,
}

impl<W: Write> std::fmt::Debug for PcapTracer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapTracer")
            .field("devices", &self.writers.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

impl<W: Write> PcapTracer<W> {
    pub fn new(factory: impl FnMut(DeviceId) -> io::Result<W> + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            writers: BTreeMap::new(),
            error: None,
        }
    }

    fn fail(&mut self, device: DeviceId, source: io::Error) {
        warn!(%device, error = %source, "Packet capture failed");
        self.writers.remove(&device);
        if self.error.is_none() {
            self.error = Some(TraceError::Io { device, source });
        }
    }
}

impl PcapTracer<BufWriter<File>> {
    /// Capture to `<dir>/<prefix>-<node>-<device>.pcap`.
    pub fn files(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        let dir = dir.into();
        let prefix = prefix.into();
        Self::new(move |device| {
            let path = pcap_path(&dir, &prefix, device);
            debug!(path = %path.display(), "Opening capture file");
            File::create(path).map(BufWriter::new)
        })
    }
}

/// Capture file path for `device`.
pub fn pcap_path(dir: &Path, prefix: &str, device: DeviceId) -> PathBuf {
    dir.join(format!("{}-{}-{}.pcap", prefix, device.node.0, device.index))
}

impl<W: Write> PacketTracer for PcapTracer<W> {
    fn attach(&mut self, device: DeviceId) {
        if self.writers.contains_key(&device) {
            return;
        }
        match (self.factory)(device).and_then(|out| PcapWriter::new(out, LINKTYPE_PPP)) {
            Ok(writer) => {
                self.writers.insert(device, writer);
            }
            Err(e) => self.fail(device, e),
        }
    }

    fn record(&mut self, now: Duration, device: DeviceId, _direction: Direction, packet: &Packet) {
        let Some(writer) = self.writers.get_mut(&device) else {
            return;
        };
        if let Err(e) = writer.write_record(now, &packet.encode()) {
            self.fail(device, e);
        }
    }

    fn finish(&mut self) -> Result<(), TraceError> {
        let mut failed = Vec::new();
        for (&device, writer) in &mut self.writers {
            if let Err(e) = writer.flush() {
                failed.push((device, e));
            }
        }
        for (device, e) in failed {
            self.fail(device, e);
        }
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// In-memory capture target that can be read back after the run.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::other("capture buffer lock poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
