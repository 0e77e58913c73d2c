//! The public consumer session.
//!
//! A [`Consumer`] is cheap to clone and may be shared between tasks. Every
//! streaming call spawns one background task on the current tokio runtime and
//! hands back two receivers: decoded events and errors. Both close together
//! once the stream ends for good, which is the only reliable "no more data"
//! signal. The error receiver must be drained; while an error sits unread the
//! stream does not reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::Connector;
use tracing::debug;

use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::debug::{DebugPrinter, null_printer};
use crate::dialer::{DialContext, StreamDialer};
use crate::envelope::{Envelope, LogMessage};
use crate::error::{ConsumerError, Result};
use crate::hook::{ConnectHook, OnConnect};
use crate::listener::{ReadOutcome, listen};
use crate::proxy::ProxyResolver;
use crate::retry::{
    Attempt, AttemptOutcome, DEFAULT_RECONNECT_DELAY, DEFAULT_RETRIES, RetryPolicy, retry_action,
};

/// Decoded events and errors of one stream.
pub type StreamReceivers<T> = (mpsc::Receiver<T>, mpsc::Receiver<ConsumerError>);

struct Inner {
    base_url: String,
    proxy: Option<ProxyResolver>,
    tls: Option<Connector>,
    printer: RwLock<Arc<dyn DebugPrinter>>,
    idle_timeout: RwLock<Option<Duration>>,
    reconnect_delay: Duration,
    hook: ConnectHook,
    registry: ConnectionRegistry,
}

impl Inner {
    fn dial_context(&self) -> DialContext<'_> {
        DialContext {
            base_url: &self.base_url,
            proxy: self.proxy.as_ref(),
            tls: self.tls.as_ref(),
            printer: self.printer.read().clone(),
            hook: &self.hook,
        }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        *self.idle_timeout.read()
    }

    fn policy(&self, retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, self.reconnect_delay)
    }
}

#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    /// Consumer for the traffic controller at `base_url` (`ws://` or `wss://`).
    pub fn new(base_url: impl Into<String>) -> Self {
        ConsumerBuilder::new(base_url).build()
    }

    pub fn builder(base_url: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Log messages of one app; other event types are dropped. Reconnects up
    /// to five times after consecutive failures.
    pub fn tailing_logs(&self, app_id: &str, token: &str) -> StreamReceivers<LogMessage> {
        self.tail(app_id, token, DEFAULT_RETRIES)
    }

    pub fn tailing_logs_without_reconnect(
        &self,
        app_id: &str,
        token: &str,
    ) -> StreamReceivers<LogMessage> {
        self.tail(app_id, token, 0)
    }

    /// Every envelope of one app, in the order the server sent them.
    pub fn stream(&self, app_id: &str, token: &str) -> StreamReceivers<Envelope> {
        self.spawn(app_path(app_id), token, DEFAULT_RETRIES, Some)
    }

    pub fn stream_without_reconnect(&self, app_id: &str, token: &str) -> StreamReceivers<Envelope> {
        self.spawn(app_path(app_id), token, 0, Some)
    }

    /// Every envelope of the platform. Consumers sharing `subscription_id`
    /// split the stream between them; each distinct id gets all of it.
    pub fn firehose(&self, subscription_id: &str, token: &str) -> StreamReceivers<Envelope> {
        self.spawn(firehose_path(subscription_id), token, DEFAULT_RETRIES, Some)
    }

    pub fn firehose_without_reconnect(
        &self,
        subscription_id: &str,
        token: &str,
    ) -> StreamReceivers<Envelope> {
        self.spawn(firehose_path(subscription_id), token, 0, Some)
    }

    /// Closes every stream opened by this consumer.
    ///
    /// Fails with [`ConsumerError::NoActiveConnection`] when nothing is open.
    /// If one close fails, that handle and the ones after it stay registered
    /// and the error is returned. The consumer stays usable afterwards.
    pub async fn terminate(&self) -> Result<()> {
        self.inner.registry.close_all().await
    }

    /// Called synchronously every time a stream upgrade succeeds.
    pub fn set_on_connect_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hook.set(Some(Arc::new(callback)));
    }

    pub fn clear_on_connect_callback(&self) {
        self.inner.hook.set(None);
    }

    /// Fail a read when no frame arrives within `timeout`. Zero disables it.
    /// Applies from the next connection of every stream.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        *self.inner.idle_timeout.write() = Some(timeout).filter(|timeout| !timeout.is_zero());
    }

    /// Replaces the printer used for upgrade traces from the next dial on.
    pub fn set_debug_printer<P>(&self, printer: P)
    where
        P: DebugPrinter + 'static,
    {
        *self.inner.printer.write() = Arc::new(printer);
    }

    /// Streams started by this consumer that have not finished yet.
    pub fn active_connections(&self) -> usize {
        self.inner.registry.len()
    }

    fn tail(&self, app_id: &str, token: &str, retries: u32) -> StreamReceivers<LogMessage> {
        self.spawn(app_path(app_id), token, retries, Envelope::into_log_message)
    }

    fn spawn<T, S>(&self, path: String, token: &str, retries: u32, select: S) -> StreamReceivers<T>
    where
        T: Send + 'static,
        S: Fn(Envelope) -> Option<T> + Send + Sync + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        let handle = inner.registry.register();
        let dialer = StreamDialer::new(path, token);

        tokio::spawn(async move {
            let policy = inner.policy(retries);
            let mut attempt = StreamAttempt {
                inner: &inner,
                handle: &handle,
                dialer,
                select,
                events: events_tx,
            };
            retry_action(&mut attempt, &errors_tx, &inner.hook, policy).await;
            debug!(
                target = "firehose.stream",
                path = %attempt.dialer.path(),
                handle = handle.id(),
                "stream finished"
            );

            match handle.close().await {
                Ok(()) | Err(ConsumerError::NoActiveConnection) => {}
                Err(err) => debug!(
                    target = "firehose.stream",
                    handle = handle.id(),
                    error = %err,
                    "closing finished stream failed"
                ),
            }
            inner.registry.deregister(&handle);
        });

        (events_rx, errors_rx)
    }
}

/// One dial plus the read loop on the resulting connection.
struct StreamAttempt<'a, T, S> {
    inner: &'a Inner,
    handle: &'a ConnectionHandle,
    dialer: StreamDialer,
    select: S,
    events: mpsc::Sender<T>,
}

#[async_trait]
impl<T, S> Attempt for StreamAttempt<'_, T, S>
where
    T: Send + 'static,
    S: Fn(Envelope) -> Option<T> + Send + Sync,
{
    async fn attempt(&mut self) -> AttemptOutcome {
        if self.handle.is_closed() {
            return AttemptOutcome::Done;
        }

        let ws = match self.dialer.dial(&self.inner.dial_context()).await {
            Ok(ws) => ws,
            Err(err) => return AttemptOutcome::Failed(err),
        };
        let Some(reader) = self.handle.install(ws) else {
            return AttemptOutcome::Done;
        };

        match listen(
            self.handle,
            reader,
            self.inner.idle_timeout(),
            &self.select,
            &self.events,
        )
        .await
        {
            ReadOutcome::Closed => AttemptOutcome::Done,
            ReadOutcome::Failed(err) => AttemptOutcome::Failed(err),
        }
    }
}

fn app_path(app_id: &str) -> String {
    format!("/apps/{app_id}/stream")
}

fn firehose_path(subscription_id: &str) -> String {
    format!("/firehose/{subscription_id}")
}

pub struct ConsumerBuilder {
    base_url: String,
    proxy: Option<ProxyResolver>,
    tls: Option<Connector>,
    printer: Option<Arc<dyn DebugPrinter>>,
    idle_timeout: Option<Duration>,
    reconnect_delay: Duration,
    on_connect: Option<OnConnect>,
}

impl ConsumerBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            proxy: None,
            tls: None,
            printer: None,
            idle_timeout: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            on_connect: None,
        }
    }

    /// Overrides the environment-derived proxy selection.
    pub fn proxy(mut self, resolver: ProxyResolver) -> Self {
        self.proxy = Some(resolver);
        self
    }

    /// TLS connector used for `wss://` upgrades.
    pub fn tls_connector(mut self, connector: Connector) -> Self {
        self.tls = Some(connector);
        self
    }

    pub fn debug_printer<P>(mut self, printer: P) -> Self
    where
        P: DebugPrinter + 'static,
    {
        self.printer = Some(Arc::new(printer));
        self
    }

    /// Fail a read when no frame arrives within `timeout`. Zero disables it.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout).filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Consumer {
        let hook = ConnectHook::default();
        hook.set(self.on_connect);
        Consumer {
            inner: Arc::new(Inner {
                base_url: self.base_url,
                proxy: self.proxy,
                tls: self.tls,
                printer: RwLock::new(self.printer.unwrap_or_else(null_printer)),
                idle_timeout: RwLock::new(self.idle_timeout),
                reconnect_delay: self.reconnect_delay,
                hook,
                registry: ConnectionRegistry::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_stream_paths() {
        assert_eq!(app_path("guid-1"), "/apps/guid-1/stream");
        assert_eq!(firehose_path("group-a"), "/firehose/group-a");
    }

    #[tokio::test]
    async fn terminate_without_streams_reports_missing_connection() {
        let consumer = Consumer::new("ws://127.0.0.1:1");
        assert!(matches!(
            consumer.terminate().await,
            Err(ConsumerError::NoActiveConnection)
        ));
        assert_eq!(consumer.active_connections(), 0);
    }

    #[test]
    fn zero_idle_timeout_is_disabled() {
        let consumer = Consumer::builder("ws://127.0.0.1:1")
            .idle_timeout(Duration::ZERO)
            .build();
        assert!(consumer.inner.idle_timeout().is_none());

        consumer.set_idle_timeout(Duration::from_secs(3));
        assert_eq!(consumer.inner.idle_timeout(), Some(Duration::from_secs(3)));
        consumer.set_idle_timeout(Duration::ZERO);
        assert!(consumer.inner.idle_timeout().is_none());
    }
}
