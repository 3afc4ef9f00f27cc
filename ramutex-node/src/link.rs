//! Peer link: one TCP connection to one remote node, with its own reader and writer tasks.
//!
//! The writer task owns the write half, so frames queued from any task go out one
//! at a time and in queue order. The reader task hands every decoded message to the
//! link's handler and reports the first read failure exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use ramutex_core::wire::{self, FrameDecodeError, LEN_SIZE, MAX_FRAME_LEN};
use ramutex_core::{Message, NodeId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives what a link's reader task decodes.
pub trait LinkHandler: Send + Sync + 'static {
    fn on_message(&self, link: &Arc<PeerLink>, msg: Message);
    /// Called once when the reader stops for any reason other than `PeerLink::close`.
    fn on_closed(&self, link: &Arc<PeerLink>, reason: LinkError);
}

/// Why a reader task stopped.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("peer connection closed")]
    Closed,
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameDecodeError),
}

/// Local handle for a link, unique within one coordinator.
pub type LinkId = u64;

pub struct PeerLink {
    id: LinkId,
    remote: SocketAddr,
    peer: OnceLock<NodeId>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerLink {
    /// Split `stream` and start the reader and writer tasks. `peer` is known for dialed links
    /// and bound later by CONNECT for accepted ones.
    pub fn spawn<H: LinkHandler>(
        id: LinkId,
        stream: TcpStream,
        remote: SocketAddr,
        peer: Option<NodeId>,
        handler: Weak<H>,
    ) -> Arc<PeerLink> {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let link = Arc::new(PeerLink {
            id,
            remote,
            peer: OnceLock::new(),
            tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });
        if let Some(p) = peer {
            let _ = link.peer.set(p);
        }

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(%remote, "send failed: {e}");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!(%remote, "send failed: {e}");
                    break;
                }
            }
        });

        let reader_link = link.clone();
        let reader_task = tokio::spawn(async move {
            let reason = read_loop(reader, &reader_link, &handler).await;
            if reader_link.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(h) = handler.upgrade() {
                h.on_closed(&reader_link, reason);
            }
        });

        link.lock_tasks().extend([writer_task, reader_task]);
        link
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Remote node id, once known.
    pub fn peer(&self) -> Option<NodeId> {
        self.peer.get().copied()
    }

    /// Bind the remote id announced by CONNECT. Returns false if a different id was bound already.
    pub fn bind_peer(&self, peer: NodeId) -> bool {
        match self.peer.set(peer) {
            Ok(()) => true,
            Err(_) => self.peer() == Some(peer),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a message. Fire-and-forget: failures are logged, never retried.
    pub fn send(&self, msg: &Message) -> bool {
        match wire::encode_frame(msg) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!(remote = %self.remote, "dropping unencodable {:?}: {e}", msg.kind());
                false
            }
        }
    }

    /// Queue an already encoded frame.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            debug!(remote = %self.remote, "send on closed link dropped");
            return false;
        }
        if self.tx.send(frame).is_err() {
            warn!(remote = %self.remote, "send failed: writer stopped");
            return false;
        }
        true
    }

    /// Stop both tasks and drop the socket. The handler is not notified.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<H: LinkHandler>(
    mut reader: OwnedReadHalf,
    link: &Arc<PeerLink>,
    handler: &Weak<H>,
) -> LinkError {
    let mut body = Vec::new();
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            return eof_or_io(e);
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return FrameDecodeError::TooLarge.into();
        }
        body.resize(len as usize, 0);
        if let Err(e) = reader.read_exact(&mut body).await {
            return eof_or_io(e);
        }
        let msg = match wire::decode_body(&body) {
            Ok(m) => m,
            Err(e) => return e.into(),
        };
        match handler.upgrade() {
            Some(h) => h.on_message(link, msg),
            None => return LinkError::Closed,
        }
    }
}

fn eof_or_io(e: std::io::Error) -> LinkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        LinkError::Closed
    } else {
        LinkError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramutex_core::wire::encode_frame;
    use tokio::net::TcpListener;

    enum Event {
        Message(Message),
        Closed(LinkError),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl LinkHandler for Recorder {
        fn on_message(&self, _link: &Arc<PeerLink>, msg: Message) {
            let _ = self.tx.send(Event::Message(msg));
        }

        fn on_closed(&self, _link: &Arc<PeerLink>, reason: LinkError) {
            let _ = self.tx.send(Event::Closed(reason));
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialed = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, dialed)
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    #[tokio::test]
    async fn delivers_in_order_then_reports_close() {
        let (local, mut remote) = pair().await;
        let (handler, mut events) = recorder();
        let addr = local.peer_addr().unwrap();
        let link = PeerLink::spawn(0, local, addr, None, Arc::downgrade(&handler));

        for ts in 1..=3 {
            let frame = encode_frame(&Message::request(NodeId(2), ts)).unwrap();
            remote.write_all(&frame).await.unwrap();
        }
        drop(remote);

        for ts in 1..=3 {
            match events.recv().await.unwrap() {
                Event::Message(m) => assert_eq!(m.timestamp, ts),
                Event::Closed(e) => panic!("closed early: {e}"),
            }
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Closed(LinkError::Closed)
        ));
        assert!(link.is_closed());
        assert!(!link.send(&Message::release(NodeId(1), 4)));
    }

    #[tokio::test]
    async fn queued_sends_keep_order() {
        let (local, mut remote) = pair().await;
        let (handler, _events) = recorder();
        let addr = local.peer_addr().unwrap();
        let link = PeerLink::spawn(1, local, addr, Some(NodeId(9)), Arc::downgrade(&handler));
        assert_eq!(link.peer(), Some(NodeId(9)));

        for ts in 1..=5 {
            assert!(link.send(&Message::state(NodeId(1), ts, format!("s{ts}"))));
        }
        for ts in 1..=5 {
            let mut len = [0u8; LEN_SIZE];
            remote.read_exact(&mut len).await.unwrap();
            let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
            remote.read_exact(&mut body).await.unwrap();
            let msg = wire::decode_body(&body).unwrap();
            assert_eq!(msg.timestamp, ts);
            assert_eq!(msg.payload(), Some(format!("s{ts}").as_str()));
        }
        link.close();
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn oversized_header_reports_frame_error() {
        let (local, mut remote) = pair().await;
        let (handler, mut events) = recorder();
        let addr = local.peer_addr().unwrap();
        let link = PeerLink::spawn(3, local, addr, None, Arc::downgrade(&handler));

        remote.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        match events.recv().await.unwrap() {
            Event::Closed(LinkError::Frame(FrameDecodeError::TooLarge)) => {}
            Event::Closed(e) => panic!("unexpected close reason: {e}"),
            Event::Message(m) => panic!("unexpected message {:?}", m.kind()),
        }
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn connect_binds_once() {
        let (local, _remote) = pair().await;
        let (handler, _events) = recorder();
        let addr = local.peer_addr().unwrap();
        let link = PeerLink::spawn(2, local, addr, None, Arc::downgrade(&handler));
        assert_eq!(link.peer(), None);
        assert!(link.bind_peer(NodeId(4)));
        assert!(link.bind_peer(NodeId(4)));
        assert!(!link.bind_peer(NodeId(5)));
        assert_eq!(link.peer(), Some(NodeId(4)));
        link.close();
    }
}
