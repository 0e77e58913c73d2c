//! Per-stream connection handles and the registry used by `terminate`.
//!
//! Lock order: the registry mutex guards membership only and the handle mutex
//! guards the sink and closed flag. Neither is held while the other is taken,
//! and neither is held across an `.await`.

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{ConsumerError, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsReader = SplitStream<WsStream>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct HandleState {
    sink: Option<WsSink>,
    closed: bool,
}

/// Tracks the live transport of one logical stream.
///
/// A handle outlives every reconnect of its stream. Once closed it stays
/// closed; a closed handle refuses newly dialed transports.
pub(crate) struct ConnectionHandle {
    id: u64,
    state: Mutex<HandleState>,
    closed_tx: watch::Sender<bool>,
    /// Set under the registry lock once the owning task has deregistered.
    retired: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HandleState::default()),
            closed_tx,
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Receiver that flips to `true` when the handle is closed.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Installs a freshly upgraded stream, returning its read half.
    ///
    /// Returns `None` when the handle was closed while the stream was being
    /// dialed; the stream is dropped in that case.
    pub(crate) fn install(&self, stream: WsStream) -> Option<WsReader> {
        let (sink, reader) = stream.split();
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.sink = Some(sink);
        Some(reader)
    }

    /// Marks the handle closed and closes the current transport, if any.
    ///
    /// The transport close is issued at most once per handle; a later call
    /// finds no transport and reports [`ConsumerError::NoActiveConnection`].
    pub(crate) async fn close(&self) -> Result<()> {
        let sink = {
            let mut state = self.state.lock();
            state.closed = true;
            state.sink.take()
        };
        self.closed_tx.send_replace(true);

        let Some(mut sink) = sink else {
            return Err(ConsumerError::NoActiveConnection);
        };
        debug!(target = "firehose.stream", handle = self.id, "closing websocket");
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(err) if already_gone(&err) => Ok(()),
            Err(err) => Err(ConsumerError::Close(err)),
        }
    }
}

/// Errors meaning the peer or the network already tore the connection down.
fn already_gone(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::SendAfterClosing) => true,
        WsError::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
        ),
        _ => false,
    }
}

/// Every handle created by one consumer that has not yet been torn down.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    handles: Mutex<Vec<Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub(crate) fn register(&self) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new());
        self.handles.lock().push(handle.clone());
        handle
    }

    /// Removes `handle` for good; a failing `close_all` will not put it back.
    pub(crate) fn deregister(&self, handle: &ConnectionHandle) {
        let mut handles = self.handles.lock();
        handle.retired.store(true, Ordering::SeqCst);
        handles.retain(|registered| registered.id() != handle.id());
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Closes every registered handle in registration order.
    ///
    /// On the first failing close, that handle and every handle not yet
    /// visited go back into the registry and the error is returned.
    pub(crate) async fn close_all(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.handles.lock());
        if pending.is_empty() {
            return Err(ConsumerError::NoActiveConnection);
        }

        let mut remaining = pending.into_iter();
        while let Some(handle) = remaining.next() {
            if let Err(err) = handle.close().await {
                self.requeue(handle, remaining);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Puts the failed handle and the unvisited ones back ahead of any newer
    /// registrations, skipping handles whose task already deregistered.
    fn requeue<I>(&self, failed: Arc<ConnectionHandle>, remaining: I)
    where
        I: IntoIterator<Item = Arc<ConnectionHandle>>,
    {
        let mut handles = self.handles.lock();
        let newer = std::mem::take(&mut *handles);
        handles.extend(
            std::iter::once(failed)
                .chain(remaining)
                .filter(|handle| !handle.retired.load(Ordering::SeqCst)),
        );
        handles.extend(newer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closing_without_transport_reports_missing_connection() {
        let handle = ConnectionHandle::new();
        let mut signal = handle.closed_signal();
        assert!(!handle.is_closed());

        let err = handle.close().await.expect_err("no transport installed");
        assert!(matches!(err, ConsumerError::NoActiveConnection));
        assert!(handle.is_closed());
        assert!(*signal.borrow_and_update());

        // Still closed, still nothing to close.
        assert!(matches!(
            handle.close().await,
            Err(ConsumerError::NoActiveConnection)
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn registry_close_all_requires_members() {
        let registry = ConnectionRegistry::default();
        assert!(matches!(
            registry.close_all().await,
            Err(ConsumerError::NoActiveConnection)
        ));
    }

    #[tokio::test]
    async fn failed_close_keeps_unvisited_handles_registered() {
        let registry = ConnectionRegistry::default();
        let first = registry.register();
        let second = registry.register();
        assert_eq!(registry.len(), 2);

        // Neither handle has a transport, so the first close fails.
        assert!(matches!(
            registry.close_all().await,
            Err(ConsumerError::NoActiveConnection)
        ));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 2);

        registry.deregister(&first);
        registry.deregister(&second);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn handles_deregistered_mid_close_are_not_requeued() {
        let registry = ConnectionRegistry::default();
        let first = registry.register();
        let second = registry.register();
        let third = registry.register();

        // close_all has taken every handle when the first close fails; the
        // first task exits and deregisters before the failure is handled.
        let pending = std::mem::take(&mut *registry.handles.lock());
        let newer = registry.register();
        registry.deregister(&first);
        let mut remaining = pending.into_iter();
        let failed = remaining.next().expect("first handle");
        registry.requeue(failed, remaining);

        let ids: Vec<u64> = registry.handles.lock().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![second.id(), third.id(), newer.id()]);

        // A later terminate reaches the live handles instead of stalling on
        // the dead one.
        registry.deregister(&second);
        registry.deregister(&third);
        registry.deregister(&newer);
        assert!(matches!(
            registry.close_all().await,
            Err(ConsumerError::NoActiveConnection)
        ));
        assert_eq!(registry.len(), 0);
    }
}
