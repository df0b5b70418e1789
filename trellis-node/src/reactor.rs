//! Reactor: one task owning the listener, the upstream link, the child set
//! and the node decision core. Connection tasks shovel bytes; every
//! topology change, frame dispatch and job starts here, so no state needs
//! locking. Local computation runs on the blocking pool and is awaited, so
//! commands and frames are handled strictly in arrival order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use trellis_core::node::{ConnId, NodeCore, StartArgs};
use trellis_core::protocol::{Frame, WorkFrame};

use crate::checker;
use crate::config::Config;
use crate::connection::{self, ConnEvent, ConnHandle, OutMsg};
use crate::console::Command;
use crate::results;

/// How long a leaving node waits for its connections to finish flushing.
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Reactor {
    core: NodeCore,
    listener: TcpListener,
    listen_port: u16,
    results_dir: PathBuf,
    parent_host: Option<String>,
    parent: Option<ConnHandle>,
    children: HashMap<ConnId, ConnHandle>,
    next_conn: u64,
    events_tx: mpsc::Sender<ConnEvent>,
    events_rx: mpsc::Receiver<ConnEvent>,
    commands: mpsc::Receiver<Command>,
}

impl Reactor {
    /// Bind the listening socket and, when a parent address is given,
    /// connect the upstream link.
    pub async fn bind(
        port: u16,
        results_dir: PathBuf,
        parent: Option<(String, u16)>,
        commands: mpsc::Receiver<Command>,
        cfg: &Config,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let listen_port = listener.local_addr()?.port();
        let (events_tx, events_rx) = mpsc::channel(cfg.event_queue.max(1));

        let mut reactor = Self {
            core: NodeCore::new(listen_port, None),
            listener,
            listen_port,
            results_dir,
            parent_host: None,
            parent: None,
            children: HashMap::new(),
            next_conn: 0,
            events_tx,
            events_rx,
            commands,
        };
        if let Some((host, parent_port)) = parent {
            let stream = TcpStream::connect((host.as_str(), parent_port)).await?;
            let id = reactor.alloc_conn_id();
            let handle = connection::spawn(id, stream, reactor.events_tx.clone());
            tracing::info!(%host, parent_port, "connected to parent");
            reactor.parent_host = Some(host);
            reactor.parent = Some(handle);
            reactor.core.set_parent_port(Some(parent_port));
        }
        Ok(reactor)
    }

    /// Port the listener actually bound (useful when asked for port 0).
    pub fn local_port(&self) -> u16 {
        self.listen_port
    }

    /// Serve until interrupted or until a graceful leave completes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(port = self.listen_port, "node ready");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = self.alloc_conn_id();
                        let handle = connection::spawn(id, stream, self.events_tx.clone());
                        self.children.insert(id, handle);
                        self.core.register_child(id);
                        tracing::info!(%addr, conn = id.0, "child connected");
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(cmd) = self.commands.recv() => {
                    // Drain every queued command before blocking again.
                    if self.handle_command(cmd).await {
                        return Ok(());
                    }
                    while let Ok(cmd) = self.commands.try_recv() {
                        if self.handle_command(cmd).await {
                            return Ok(());
                        }
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted; shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn alloc_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    /// True when the node should stop serving.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start(args) => {
                self.start_job(args).await;
                false
            }
            Command::Disconnect => self.leave().await,
        }
    }

    async fn start_job(&mut self, args: StartArgs) {
        if let Err(e) = results::create_results_file(
            &self.results_dir,
            &args.filename,
            &args.checker,
            args.start,
            args.end,
        ) {
            tracing::error!(error = %e, "cannot start job");
            eprintln!("{e}");
            return;
        }
        let plan = self.core.start_job(&args);
        tracing::info!(
            job = plan.job_id,
            start = args.start,
            end = args.end,
            shares = plan.forwards.len() + 1,
            "job started"
        );
        for (conn, frame) in plan.forwards {
            self.send_work(conn, frame).await;
        }
        if let Some(share) = plan.local {
            self.run_local(&args.locator, &args.checker, &args.filename, share.start, share.end)
                .await;
        }
    }

    async fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame(_, Frame::Work(frame)) => {
                let plan = self.core.handle_work(frame);
                for (conn, forward) in plan.forwards {
                    self.send_work(conn, forward).await;
                }
                if let Some(share) = plan.local {
                    self.run_local(
                        &plan.frame.locator,
                        &plan.frame.checker,
                        &plan.frame.filename,
                        share.start,
                        share.end,
                    )
                    .await;
                }
            }
            ConnEvent::Frame(id, Frame::Address(frame)) => {
                tracing::info!(conn = id.0, port = frame.port, "reparent requested");
                self.reconnect(frame.port).await;
            }
            ConnEvent::Closed(id) => self.drop_conn(id),
        }
    }

    async fn send_work(&mut self, conn: ConnId, frame: WorkFrame) {
        if let Some(handle) = self.children.get(&conn) {
            if handle.tx.send(OutMsg::Work(frame)).await.is_err() {
                tracing::warn!(conn = conn.0, "child queue gone; dropping share");
            }
        }
    }

    /// Run one share on the blocking pool and wait for it. Checker or file
    /// failures fail the job only; the node keeps serving.
    async fn run_local(&self, locator: &str, name: &str, filename: &str, start: u32, end: u32) {
        let dir = self.results_dir.clone();
        let locator = locator.to_owned();
        let name = name.to_owned();
        let file = filename.to_owned();
        let outcome = tokio::task::spawn_blocking(move || -> Result<(), results::ResultsError> {
            let checker = checker::load(&locator, &name)?;
            results::run_range(&checker, &dir, &file, start, end)
        })
        .await;
        match outcome {
            Ok(Ok(())) => tracing::info!(filename, start, end, "range checked"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, filename, "job share failed");
                eprintln!("{e}");
            }
            Err(e) => tracing::error!(error = %e, "checker worker panicked"),
        }
    }

    /// Hand the upstream link over to a new port on the same host, keeping
    /// the children untouched.
    async fn reconnect(&mut self, port: u16) {
        let Some(host) = self.parent_host.clone() else {
            tracing::warn!("reparent frame at the root; ignoring");
            return;
        };
        if let Some(old) = self.parent.take() {
            let _ = old.tx.send(OutMsg::Shutdown).await;
        }
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                let id = self.alloc_conn_id();
                let handle = connection::spawn(id, stream, self.events_tx.clone());
                self.parent = Some(handle);
                self.core.set_parent_port(Some(port));
                tracing::info!(%host, port, "reconnected to new parent");
            }
            Err(e) => {
                tracing::error!(%host, port, error = %e, "reconnect failed; running detached");
                self.core.set_parent_port(None);
            }
        }
    }

    fn drop_conn(&mut self, id: ConnId) {
        if self.parent.as_ref().map(|h| h.id) == Some(id) {
            self.parent = None;
            self.core.set_parent_port(None);
            tracing::warn!(conn = id.0, "upstream closed");
            return;
        }
        if self.children.remove(&id).is_some() {
            self.core.remove_conn(id);
            tracing::info!(conn = id.0, "child removed");
        }
    }

    /// Graceful leave: every child hears where to reattach before any child
    /// closes, then everything tears down. Returns true when the node
    /// should stop; a root node rejects the command and keeps running.
    async fn leave(&mut self) -> bool {
        let plan = match self.core.leave() {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("{e}");
                eprintln!("{e}");
                return false;
            }
        };
        for (conn, frame) in &plan.notices {
            if let Some(handle) = self.children.get(conn) {
                let _ = handle.tx.send(OutMsg::Reparent(*frame)).await;
            }
        }
        for (conn, _) in &plan.notices {
            if let Some(handle) = self.children.get(conn) {
                let _ = handle.tx.send(OutMsg::Shutdown).await;
            }
        }
        if let Some(handle) = &self.parent {
            let _ = handle.tx.send(OutMsg::Shutdown).await;
        }
        for (_, handle) in self.children.drain() {
            if tokio::time::timeout(LEAVE_FLUSH_TIMEOUT, handle.task)
                .await
                .is_err()
            {
                tracing::warn!(conn = handle.id.0, "child flush timed out");
            }
        }
        if let Some(handle) = self.parent.take() {
            let _ = tokio::time::timeout(LEAVE_FLUSH_TIMEOUT, handle.task).await;
        }
        tracing::info!("left the overlay; children handed to parent");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use trellis_core::wire::{encode_work, FrameReader, ReadStatus};
    use trellis_core::{AddressFrame, WorkFrame};

    async fn bind_reactor(
        parent: Option<(String, u16)>,
    ) -> (Reactor, mpsc::Sender<Command>, tempfile::TempDir) {
        let cfg = Config::default();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let dir = tempfile::tempdir().unwrap();
        let reactor = Reactor::bind(0, dir.path().to_path_buf(), parent, cmd_rx, &cfg)
            .await
            .unwrap();
        (reactor, cmd_tx, dir)
    }

    /// Read frames off a raw socket until `want` arrived or EOF.
    async fn read_frames(stream: &mut TcpStream, want: usize) -> Vec<Frame> {
        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 4096];
        while frames.len() < want {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            let mut rest = &buf[..n];
            loop {
                match reader.feed(&mut rest) {
                    ReadStatus::Done => frames.push(reader.take().unwrap()),
                    ReadStatus::NeedMore => break,
                    ReadStatus::Malformed => panic!("malformed stream"),
                }
            }
        }
        frames
    }

    fn start_args(start: u32, end: u32) -> StartArgs {
        StartArgs {
            locator: "missing-artifact.so".into(),
            checker: "demo::Check".into(),
            start,
            end,
            filename: "out.txt".into(),
        }
    }

    #[tokio::test]
    async fn start_command_forwards_child_share() {
        let (reactor, cmd_tx, dir) = bind_reactor(None).await;
        let port = reactor.local_port();
        tokio::spawn(reactor.run());

        let mut child = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cmd_tx
            .send(Command::Start(start_args(0, 100)))
            .await
            .unwrap();

        let frames = tokio::time::timeout(Duration::from_secs(5), read_frames(&mut child, 1))
            .await
            .unwrap();
        let Frame::Work(frame) = &frames[0] else {
            panic!("expected a work frame");
        };
        // Span 101 over self + one child: the child takes [50, 100].
        assert_eq!((frame.start, frame.end), (50, 100));
        assert_eq!(frame.job_id, 1);
        assert_eq!(frame.src_port, port);
        assert_eq!(frame.checker, "demo::Check");

        // The header was written even though the local share failed to load
        // its checker.
        let text = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert!(text.starts_with("Conjecture results: demo::Check"));
    }

    #[tokio::test]
    async fn received_work_chunks_and_forwards_tail() {
        // Fake parent listener; the reactor attaches under it.
        let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_port = parent_listener.local_addr().unwrap().port();
        let (reactor, _cmd_tx, _dir) =
            bind_reactor(Some(("127.0.0.1".into(), parent_port))).await;
        let port = reactor.local_port();
        tokio::spawn(reactor.run());
        let (mut parent_sock, _) = parent_listener.accept().await.unwrap();

        let mut child = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = WorkFrame {
            src_port: 9999,
            dst_port: 9999,
            job_id: 7,
            start: 0,
            end: 39,
            locator: "missing-artifact.so".into(),
            checker: "demo::Check".into(),
            filename: "out.txt".into(),
        };
        parent_sock
            .write_all(&encode_work(&frame).unwrap())
            .await
            .unwrap();
        parent_sock.flush().await.unwrap();

        let frames = tokio::time::timeout(Duration::from_secs(5), read_frames(&mut child, 1))
            .await
            .unwrap();
        let Frame::Work(forward) = &frames[0] else {
            panic!("expected a work frame");
        };
        // 25 values stay local; the 15-value tail moves down whole.
        assert_eq!((forward.start, forward.end), (25, 39));
        assert_eq!(forward.src_port, 9999);
        assert_eq!(forward.job_id, 7);
    }

    #[tokio::test]
    async fn disconnect_reparents_children_then_stops() {
        let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_port = parent_listener.local_addr().unwrap().port();
        let (reactor, cmd_tx, _dir) =
            bind_reactor(Some(("127.0.0.1".into(), parent_port))).await;
        let port = reactor.local_port();
        let running = tokio::spawn(reactor.run());
        let (_parent_sock, _) = parent_listener.accept().await.unwrap();

        let mut child = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cmd_tx.send(Command::Disconnect).await.unwrap();

        // Exactly one address frame carrying the parent port, then EOF.
        let frames = tokio::time::timeout(Duration::from_secs(5), read_frames(&mut child, 1))
            .await
            .unwrap();
        assert_eq!(
            frames,
            vec![Frame::Address(AddressFrame { port: parent_port })]
        );
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), child.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_at_root_is_rejected() {
        let (reactor, cmd_tx, _dir) = bind_reactor(None).await;
        let running = tokio::spawn(reactor.run());

        cmd_tx.send(Command::Disconnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.is_finished(), "root must keep serving");
        running.abort();
    }

    #[tokio::test]
    async fn commands_run_in_order() {
        let (reactor, cmd_tx, dir) = bind_reactor(None).await;
        tokio::spawn(reactor.run());

        cmd_tx
            .send(Command::Start(StartArgs {
                filename: "a.txt".into(),
                ..start_args(0, 10)
            }))
            .await
            .unwrap();
        cmd_tx
            .send(Command::Start(StartArgs {
                filename: "b.txt".into(),
                ..start_args(0, 10)
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Both headers exist; job A's file was complete (header written,
        // share failed on the missing artifact) before job B started.
        let a = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        let b = std::fs::read_to_string(dir.path().join("b.txt")).unwrap();
        assert!(a.starts_with("Conjecture results:"));
        assert!(b.starts_with("Conjecture results:"));
    }
}
