//! Per-socket state machine: buffered non-blocking reads and writes,
//! outbound frame queues, resumable frame decoding. One task per socket;
//! only that task touches the stream. The reactor talks to it through a
//! bounded channel and hears back through the shared event channel.

use std::collections::VecDeque;
use std::io;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use trellis_core::node::ConnId;
use trellis_core::protocol::{AddressFrame, Frame, WorkFrame};
use trellis_core::wire::{encode_address, encode_work, FrameReader, ReadStatus};

/// Input buffer capacity; reads stall until decoding frees space.
const INPUT_CAP: usize = 1024;
/// Output buffer capacity. Any single encoded frame fits: a work frame
/// with three maximal strings encodes to 3,112 bytes.
const OUTPUT_CAP: usize = 4096;
/// Outbound hand-off queue depth per connection.
const OUT_QUEUE: usize = 64;

/// Outbound instructions from the reactor to one connection task.
#[derive(Debug)]
pub enum OutMsg {
    Work(WorkFrame),
    Reparent(AddressFrame),
    /// Flush everything pending, then close the socket.
    Shutdown,
}

/// Events a connection task reports back to the reactor.
#[derive(Debug)]
pub enum ConnEvent {
    Frame(ConnId, Frame),
    Closed(ConnId),
}

/// Reactor-side handle to one connection task.
pub struct ConnHandle {
    pub id: ConnId,
    pub tx: mpsc::Sender<OutMsg>,
    pub task: JoinHandle<()>,
}

/// Spawn the task owning `stream`. Decoded frames and closures flow to
/// `events`; outbound frames arrive through the returned handle.
pub fn spawn(id: ConnId, stream: TcpStream, events: mpsc::Sender<ConnEvent>) -> ConnHandle {
    let (tx, rx) = mpsc::channel(OUT_QUEUE);
    let task = tokio::spawn(Connection::new(id, stream).run(rx, events));
    ConnHandle { id, tx, task }
}

struct Connection {
    id: ConnId,
    stream: TcpStream,
    input: Vec<u8>,
    output: Vec<u8>,
    pending_work: VecDeque<WorkFrame>,
    pending_reparent: VecDeque<AddressFrame>,
    reader: FrameReader,
}

impl Connection {
    fn new(id: ConnId, stream: TcpStream) -> Self {
        Self {
            id,
            stream,
            input: Vec::with_capacity(INPUT_CAP),
            output: Vec::with_capacity(OUTPUT_CAP),
            pending_work: VecDeque::new(),
            pending_reparent: VecDeque::new(),
            reader: FrameReader::new(),
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<OutMsg>,
        events: mpsc::Sender<ConnEvent>,
    ) {
        let mut shutdown = false;
        loop {
            if self.output.is_empty() {
                self.fill_output();
            }
            if shutdown
                && self.output.is_empty()
                && self.pending_reparent.is_empty()
                && self.pending_work.is_empty()
            {
                break;
            }
            tokio::select! {
                biased;
                msg = rx.recv(), if !shutdown => match msg {
                    Some(OutMsg::Reparent(frame)) => {
                        self.pending_reparent.push_back(frame);
                        self.fill_output();
                    }
                    Some(OutMsg::Work(frame)) => {
                        self.pending_work.push_back(frame);
                        self.fill_output();
                    }
                    Some(OutMsg::Shutdown) | None => {
                        shutdown = true;
                        self.fill_output();
                    }
                },
                ready = self.stream.writable(), if !self.output.is_empty() => {
                    let flushed = match ready {
                        Ok(()) => self.flush(),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = flushed {
                        tracing::warn!(conn = self.id.0, error = %e, "write failed");
                        if !shutdown {
                            let _ = events.send(ConnEvent::Closed(self.id)).await;
                        }
                        return;
                    }
                }
                ready = self.stream.readable(), if !shutdown && self.input.len() < INPUT_CAP => {
                    let keep_going = match ready {
                        Ok(()) => self.read_frames(&events).await,
                        Err(e) => {
                            tracing::warn!(conn = self.id.0, error = %e, "socket error");
                            false
                        }
                    };
                    if !keep_going {
                        let _ = events.send(ConnEvent::Closed(self.id)).await;
                        return;
                    }
                }
            }
        }
        tracing::debug!(conn = self.id.0, "connection shut down");
    }

    /// Read available bytes and decode as many complete frames as they
    /// yield, reporting each as it completes. Returns false when the
    /// connection must close (peer EOF, transport error, malformed frame,
    /// reactor gone).
    async fn read_frames(&mut self, events: &mpsc::Sender<ConnEvent>) -> bool {
        let room = INPUT_CAP - self.input.len();
        let mut chunk = [0u8; INPUT_CAP];
        let n = match self.stream.try_read(&mut chunk[..room]) {
            Ok(0) => {
                tracing::info!(conn = self.id.0, "peer closed connection");
                return false;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                tracing::warn!(conn = self.id.0, error = %e, "read failed");
                return false;
            }
        };
        self.input.extend_from_slice(&chunk[..n]);
        let (frames, ok) = self.decode_input();
        for frame in frames {
            if events.send(ConnEvent::Frame(self.id, frame)).await.is_err() {
                return false;
            }
        }
        if !ok {
            tracing::warn!(conn = self.id.0, "malformed frame; closing connection");
        }
        ok
    }

    /// Drain complete frames out of the input buffer. The partially decoded
    /// remainder stays in the reader until more bytes arrive.
    fn decode_input(&mut self) -> (Vec<Frame>, bool) {
        let mut frames = Vec::new();
        let mut rest = &self.input[..];
        let ok = loop {
            match self.reader.feed(&mut rest) {
                ReadStatus::Done => {
                    if let Some(frame) = self.reader.take() {
                        frames.push(frame);
                    }
                }
                ReadStatus::NeedMore => break true,
                ReadStatus::Malformed => break false,
            }
        };
        let consumed = self.input.len() - rest.len();
        self.input.drain(..consumed);
        (frames, ok)
    }

    /// Flush as much of the output buffer as the socket accepts, then top
    /// it back up from the pending queues.
    fn flush(&mut self) -> io::Result<()> {
        match self.stream.try_write(&self.output) {
            Ok(n) => {
                self.output.drain(..n);
                self.fill_output();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Serialize pending frames into the output buffer while they fit.
    /// Reparent notices drain before work frames.
    fn fill_output(&mut self) {
        while let Some(frame) = self.pending_reparent.front() {
            let bytes = encode_address(frame);
            if self.output.len() + bytes.len() > OUTPUT_CAP {
                return;
            }
            self.output.extend_from_slice(&bytes);
            self.pending_reparent.pop_front();
        }
        while let Some(frame) = self.pending_work.front() {
            match encode_work(frame) {
                Ok(bytes) => {
                    if self.output.len() + bytes.len() > OUTPUT_CAP {
                        return;
                    }
                    self.output.extend_from_slice(&bytes);
                    self.pending_work.pop_front();
                }
                Err(e) => {
                    tracing::warn!(conn = self.id.0, error = %e, "dropping unencodable frame");
                    self.pending_work.pop_front();
                }
            }
        }
    }
}
