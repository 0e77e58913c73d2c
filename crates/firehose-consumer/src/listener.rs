use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use crate::connection::{ConnectionHandle, WsReader};
use crate::envelope::Envelope;
use crate::error::{ConsumerError, ReadFailure};

#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// Closed locally, or nobody is receiving any more.
    Closed,
    Failed(ConsumerError),
}

/// Reads frames until the handle closes or the connection fails.
///
/// Frames that do not decode are dropped; every decoded envelope goes through
/// `select` and whatever it keeps is handed to `events` in wire order.
pub(crate) async fn listen<T, S>(
    handle: &ConnectionHandle,
    mut reader: WsReader,
    idle_timeout: Option<Duration>,
    select: &S,
    events: &mpsc::Sender<T>,
) -> ReadOutcome
where
    S: Fn(Envelope) -> Option<T> + ?Sized,
{
    let mut closed = handle.closed_signal();
    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return ReadOutcome::Closed,
            frame = next_frame(&mut reader, idle_timeout) => frame,
        };

        // A terminate racing the read surfaces as a read error; it is not one.
        if handle.is_closed() {
            return ReadOutcome::Closed;
        }

        let data = match frame {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(failure) => return ReadOutcome::Failed(failure.into()),
        };

        let envelope = match Envelope::decode(&data) {
            Ok(envelope) => envelope,
            Err(err) => {
                trace!(
                    target = "firehose.stream",
                    error = %err,
                    len = data.len(),
                    "skipping undecodable frame"
                );
                continue;
            }
        };

        let Some(item) = select(envelope) else {
            continue;
        };

        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return ReadOutcome::Closed,
            sent = events.send(item) => {
                if sent.is_err() {
                    return ReadOutcome::Closed;
                }
            }
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // The sender lives in the handle, which outlives this loop.
    let _ = closed.wait_for(|closed| *closed).await;
}

/// `Ok(None)` for control frames that carry no payload.
async fn next_frame(
    reader: &mut WsReader,
    idle_timeout: Option<Duration>,
) -> Result<Option<Vec<u8>>, ReadFailure> {
    let next = match idle_timeout.filter(|timeout| !timeout.is_zero()) {
        Some(timeout) => tokio::time::timeout(timeout, reader.next())
            .await
            .map_err(|_| ReadFailure::IdleTimeout(timeout))?,
        None => reader.next().await,
    };

    match next {
        None => Err(ReadFailure::StreamEnded),
        Some(Err(err)) => Err(ReadFailure::WebSocket(err)),
        Some(Ok(Message::Binary(data))) => Ok(Some(data)),
        Some(Ok(Message::Text(text))) => Ok(Some(text.into_bytes())),
        Some(Ok(Message::Close(frame))) => Err(ReadFailure::ClosedByPeer(
            frame.map(|frame| format!("{} {}", u16::from(frame.code), frame.reason)),
        )),
        Some(Ok(_)) => Ok(None),
    }
}
