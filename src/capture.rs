//! This module contains all the capture logic

// The capture thread does one thing, as fast as it can: pull a datagram off the
// socket, decode it, track its sequence number, scale it and hand the block to
// the sink. The sink is expected to copy and move on (we ship blocks through an
// rtrb ring buffer to be written out on another thread).
//
// Buffers and per-session state are owned by the thread for the whole session and
// handed back when it exits, so nothing here needs a lock.

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    buffers::{BufferError, BufferSet},
    control::Commit,
    convert::{SampleBlock, SampleConverter},
    packet::{decode, DecodeError},
    sequence::{Arrival, SequenceTracker},
    telemetry::LinkCounters,
};

/// Bound on each blocking read, and so on how long a stop request can go unseen
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// How long `stop` waits for the capture thread before giving up on it
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Buffers(#[from] BufferError),
    #[error("could not spawn capture thread: {0}")]
    Spawn(io::Error),
}

/// Where datagrams come from
pub trait DatagramSource: Send {
    /// Blocking read of one datagram, bounded by the source's own timeout
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSource for UdpSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }
}

/// Bind the stream port on all interfaces with a bounded read timeout
pub fn bind_udp(port: u16, timeout: Duration) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_read_timeout(Some(timeout))?;
    info!("Socket bound to port {}", port);
    Ok(socket)
}

/// Where converted blocks go
pub trait SampleSink: Send {
    fn push(&mut self, block: &SampleBlock<'_>);
}

/// A block that owns its data, for sending across threads
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedBlock {
    pub channels: usize,
    pub samples: usize,
    pub data: Vec<f32>,
    pub sample_numbers: Vec<i64>,
    pub timestamps: Vec<f64>,
    pub event_words: Vec<u64>,
    pub aux_slots: Vec<u16>,
}

impl OwnedBlock {
    pub fn row(&self, channel: usize) -> &[f32] {
        &self.data[channel * self.samples..(channel + 1) * self.samples]
    }
}

impl From<&SampleBlock<'_>> for OwnedBlock {
    fn from(block: &SampleBlock<'_>) -> Self {
        Self {
            channels: block.channels,
            samples: block.samples,
            data: block.data.to_vec(),
            sample_numbers: block.sample_numbers.to_vec(),
            timestamps: block.timestamps.to_vec(),
            event_words: block.event_words.to_vec(),
            aux_slots: block.aux_slots.to_vec(),
        }
    }
}

impl SampleSink for Vec<OwnedBlock> {
    fn push(&mut self, block: &SampleBlock<'_>) {
        Vec::push(self, block.into());
    }
}

/// Sink that pushes blocks into an rtrb ring for a consumer thread
pub struct RingSink {
    producer: rtrb::Producer<OwnedBlock>,
    dropped: u64,
}

impl RingSink {
    pub fn new(producer: rtrb::Producer<OwnedBlock>) -> Self {
        Self {
            producer,
            dropped: 0,
        }
    }
}

impl SampleSink for RingSink {
    fn push(&mut self, block: &SampleBlock<'_>) {
        if self.producer.push(block.into()).is_err() {
            self.dropped += 1;
            // Don't flood the log if the consumer has stalled
            if self.dropped.is_power_of_two() {
                warn!(dropped = self.dropped, "Ring buffer full, try increasing capacity");
            }
        }
    }
}

/// Decode, track and convert, for one committed configuration
pub struct Pipeline {
    buffers: BufferSet,
    tracker: SequenceTracker,
    converter: SampleConverter,
    counters: Arc<LinkCounters>,
}

impl Pipeline {
    pub fn new(commit: &Commit) -> Result<Self, BufferError> {
        let layout = commit.layout;
        Ok(Self {
            buffers: BufferSet::new(layout)?,
            tracker: SequenceTracker::new(layout.samples_per_packet),
            converter: SampleConverter::new(layout, commit.config.achieved_sample_rate_hz),
            counters: Arc::new(LinkCounters::default()),
        })
    }

    /// Switch to a new commit. Only possible while no session owns the pipeline.
    pub fn reconfigure(&mut self, commit: &Commit) -> Result<(), BufferError> {
        let layout = commit.layout;
        self.buffers.resize(layout)?;
        self.tracker = SequenceTracker::new(layout.samples_per_packet);
        self.converter = SampleConverter::new(layout, commit.config.achieved_sample_rate_hz);
        Ok(())
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        self.counters.clone()
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    fn reset(&mut self) {
        self.tracker.reset();
        self.converter.reset();
        self.counters.reset();
    }

    /// Buffer the next datagram should be read into
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buffers.receive
    }

    /// Process the `len` bytes last read into the receive buffer
    pub fn process(&mut self, len: usize, sink: &mut impl SampleSink) -> Result<(), DecodeError> {
        let layout = self.buffers.layout();
        let packet = decode(&self.buffers.receive[..len], layout)?;
        let header = packet.header;
        let (arrival, first_sample) = self.tracker.observe(header.sequence_number);
        if arrival == Arrival::Hit && header.sequence_number == 1 {
            info!("First packet of the stream received");
        }
        let block = self.converter.convert(&packet, first_sample, &mut self.buffers.block);
        sink.push(&block);
        self.counters.publish(self.tracker.state(), header.battery_raw);
        Ok(())
    }

    /// One iteration of the capture loop
    fn step(&mut self, source: &mut impl DatagramSource, sink: &mut impl SampleSink) {
        let n = match source.recv(self.receive_buffer()) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return,
            Err(e) => {
                // Keep truckin, a bad read only costs us this packet
                debug!("Socket read failed: {}", e);
                self.counters.record_short_read();
                return;
            }
        };
        match self.process(n, sink) {
            Ok(()) => {}
            Err(e @ DecodeError::ShortRead { .. }) => {
                debug!("{}", e);
                self.counters.record_short_read();
            }
            Err(e @ DecodeError::BadFrameMarker(_)) => {
                warn!("{}", e);
                self.counters.record_bad_frame();
            }
        }
    }
}

/// A running capture thread
pub struct Session {
    stop: Arc<AtomicBool>,
    exited: Receiver<()>,
    handle: Option<JoinHandle<Pipeline>>,
    counters: Arc<LinkCounters>,
}

impl Session {
    /// Reset per-session state and hand the pipeline to a new capture thread
    pub fn start<S, K>(mut source: S, mut sink: K, mut pipeline: Pipeline) -> Result<Self, SessionError>
    where
        S: DatagramSource + 'static,
        K: SampleSink + 'static,
    {
        pipeline.reset();
        let counters = pipeline.counters();
        let stop = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited) = bounded(1);
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("capture".to_owned())
            .spawn(move || {
                debug!("Capture thread started");
                while !thread_stop.load(Ordering::Relaxed) {
                    pipeline.step(&mut source, &mut sink);
                }
                debug!("Capture thread exiting");
                let _ = exited_tx.send(());
                pipeline
            })
            .map_err(SessionError::Spawn)?;
        Ok(Self {
            stop,
            exited,
            handle: Some(handle),
            counters,
        })
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    /// Signal the thread and wait up to `timeout` for it. Gives the pipeline back
    /// if the thread exited, otherwise leaves the thread to finish on its own.
    pub fn stop(mut self, timeout: Duration) -> Option<Pipeline> {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self.handle.take()?;
        match self.exited.recv_timeout(timeout) {
            Ok(()) => match handle.join() {
                Ok(pipeline) => {
                    debug!("Capture thread exited");
                    Some(pipeline)
                }
                Err(_) => {
                    error!("Capture thread panicked");
                    None
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!("Capture thread failed to exit, continuing anyway");
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Capture thread died");
                let _ = handle.join();
                None
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
