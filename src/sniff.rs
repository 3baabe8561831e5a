// src/sniff.rs
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use pcap::{Activated, Active, Capture, Device, Offline};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::error::CaptureError;
use crate::flow::FlowAggregator;
use crate::parser::{decode_frame, LinkLayer};

/// Bounds how long the capture thread can go without checking for shutdown.
const READ_TIMEOUT_MS: i32 = 500;
const DECODER_POLL: Duration = Duration::from_millis(100);

/// One frame as delivered by the capture facility.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub link: LinkLayer,
    pub data: Vec<u8>,
}

/// An already-open source of raw frames.
pub trait PacketSource: Send {
    /// `Ok(None)` means nothing arrived within the read timeout.
    /// `Err(CaptureError::Exhausted)` means nothing ever will again.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;
}

pub struct PcapSource<T: Activated + ?Sized> {
    cap: Capture<T>,
    link: LinkLayer,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interface: Option<String>,
    pub snaplen: i32,
    pub promisc: bool,
    pub filter: Option<String>,
}

impl PcapSource<Active> {
    /// Opens a live device; the system default when no interface is named.
    pub fn open_device(settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let device = match settings.interface.as_deref() {
            Some(name) => Device::from(name),
            None => Device::lookup()?.ok_or(CaptureError::NoDevice)?,
        };
        let target = device.name.clone();

        let mut cap = Capture::from_device(device)
            .and_then(|cap| {
                cap.promisc(settings.promisc)
                    .snaplen(settings.snaplen)
                    .timeout(READ_TIMEOUT_MS)
                    .immediate_mode(true)
                    .open()
            })
            .map_err(|source| CaptureError::Open {
                target: target.clone(),
                source,
            })?;

        configure_capture(&mut cap, settings.filter.as_deref())?;
        info!(interface = %target, "capturing on live device");
        Ok(Self::wrap(cap))
    }
}

impl PcapSource<Offline> {
    /// Replays a saved capture file.
    pub fn open_file(path: &Path, filter: Option<&str>) -> Result<Self, CaptureError> {
        let mut cap = Capture::from_file(path).map_err(|source| CaptureError::Open {
            target: path.display().to_string(),
            source,
        })?;
        configure_capture(&mut cap, filter)?;
        info!(file = %path.display(), "replaying capture file");
        Ok(Self::wrap(cap))
    }
}

impl<T: Activated + ?Sized> PcapSource<T> {
    fn wrap(cap: Capture<T>) -> Self {
        let link = LinkLayer::from_dlt(cap.get_datalink().0);
        if let LinkLayer::Unsupported(code) = link {
            warn!(dlt = code, "unsupported link type, frames will be discarded");
        }
        Self { cap, link }
    }
}

fn configure_capture<T: Activated + ?Sized>(
    cap: &mut Capture<T>,
    filter: Option<&str>,
) -> Result<(), CaptureError> {
    if let Some(filter) = filter {
        cap.filter(filter, true).map_err(|source| CaptureError::Filter {
            filter: filter.to_string(),
            source,
        })?;
    }
    Ok(())
}

impl<T: Activated + ?Sized> PacketSource for PcapSource<T>
where
    Capture<T>: Send,
{
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(Some(RawFrame {
                link: self.link,
                data: packet.data.to_vec(),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::Exhausted),
            Err(e) => Err(e.into()),
        }
    }
}

/// Counters shared by the capture and decoder threads.
#[derive(Debug, Default)]
pub struct IngestStats {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    frames_undecodable: AtomicU64,
    frames_accounted: AtomicU64,
    bytes_accounted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounts {
    pub frames_received: u64,
    /// Discarded because the hand-off queue was full.
    pub frames_dropped: u64,
    pub frames_undecodable: u64,
    pub frames_accounted: u64,
    pub bytes_accounted: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounts {
        IngestCounts {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_undecodable: self.frames_undecodable.load(Ordering::Relaxed),
            frames_accounted: self.frames_accounted.load(Ordering::Relaxed),
            bytes_accounted: self.bytes_accounted.load(Ordering::Relaxed),
        }
    }
}

/// Handles to the two ingest threads.
pub struct Ingestor {
    capture: JoinHandle<()>,
    decoder: JoinHandle<()>,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    /// Starts the capture thread feeding a bounded queue of `queue_capacity`
    /// frames, and the decoder thread draining it into `aggregator`.
    ///
    /// Overflow policy: when the queue is full the newest frame is dropped
    /// and counted in `frames_dropped`.
    pub fn spawn<S>(
        source: S,
        aggregator: Arc<FlowAggregator>,
        queue_capacity: usize,
        running: Arc<AtomicBool>,
    ) -> io::Result<Self>
    where
        S: PacketSource + 'static,
    {
        let (tx, rx) = bounded(queue_capacity);
        let stats = Arc::new(IngestStats::default());

        let capture = {
            let stats = Arc::clone(&stats);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("flowmon-capture".into())
                .spawn(move || process_packets(source, tx, &stats, &running))?
        };

        let decoder = {
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("flowmon-decode".into())
                .spawn(move || decode_frames(rx, &aggregator, &stats))?
        };

        Ok(Self {
            capture,
            decoder,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Waits for both threads. Returns once the capture source has been
    /// released and every queued frame has been accounted.
    pub fn join(self) -> IngestCounts {
        if self.capture.join().is_err() {
            error!("capture thread panicked");
        }
        if self.decoder.join().is_err() {
            error!("decoder thread panicked");
        }
        self.stats.snapshot()
    }
}

fn process_packets<S: PacketSource>(
    mut source: S,
    sender: Sender<RawFrame>,
    stats: &IngestStats,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                match sender.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        warn!("decoder gone, stopping capture");
                        break;
                    }
                }
            }
            Ok(None) => continue,
            Err(CaptureError::Exhausted) => {
                info!("capture source exhausted");
                break;
            }
            Err(e) => {
                error!("Packet capture error: {}", e);
                break;
            }
        }
    }
    debug!("capture thread stopped");
}

// Runs until the capture side hangs up, so frames still queued at shutdown
// reach the final window.
fn decode_frames(rx: Receiver<RawFrame>, aggregator: &FlowAggregator, stats: &IngestStats) {
    loop {
        match rx.recv_timeout(DECODER_POLL) {
            Ok(frame) => analyze_frame(&frame, aggregator, stats),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("decoder thread stopped");
}

fn analyze_frame(frame: &RawFrame, aggregator: &FlowAggregator, stats: &IngestStats) {
    match decode_frame(frame.link, &frame.data) {
        Some(packet) => {
            let length = u64::from(packet.total_length);
            aggregator.add(
                &packet.source.to_string(),
                &packet.destination.to_string(),
                length,
            );
            stats.frames_accounted.fetch_add(1, Ordering::Relaxed);
            stats.bytes_accounted.fetch_add(length, Ordering::Relaxed);
        }
        None => {
            trace!(len = frame.data.len(), "discarding undecodable frame");
            stats.frames_undecodable.fetch_add(1, Ordering::Relaxed);
        }
    }
}
