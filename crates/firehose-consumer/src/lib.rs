//! Client for the traffic controller's WebSocket event streams.
//!
//! A [`Consumer`] opens authenticated WebSocket streams for one app's logs or
//! events, or for a subscription-partitioned firehose of every event on the
//! platform. Each stream runs in its own task, decodes binary [`Envelope`]
//! frames, reconnects after failures within a bounded budget, and reports
//! every failure on a dedicated error receiver.
//!
//! ```no_run
//! # async fn run() {
//! use firehose_consumer::Consumer;
//!
//! let consumer = Consumer::new("wss://doppler.example.com:443");
//! let (mut events, mut errors) = consumer.firehose("my-subscription", "bearer TOKEN");
//! tokio::spawn(async move {
//!     while let Some(err) = errors.recv().await {
//!         eprintln!("stream error: {err}");
//!     }
//! });
//! while let Some(envelope) = events.recv().await {
//!     println!("{} from {}", envelope.event_type(), envelope.origin);
//! }
//! # }
//! ```

pub mod config;
mod connection;
pub mod consumer;
pub mod debug;
mod dialer;
pub mod envelope;
pub mod error;
mod hook;
mod listener;
pub mod logging;
pub mod proxy;
mod retry;

pub use config::{ConfigError, ConsumerConfig};
pub use consumer::{Consumer, ConsumerBuilder, StreamReceivers};
pub use debug::{DebugPrinter, NullDebugPrinter, TracingDebugPrinter};
pub use dialer::ORIGIN_HEADER;
pub use envelope::{
    ContainerMetric, CounterEvent, Envelope, ErrorEvent, Event, EventType, LogMessage,
    MessageType, ValueMetric, WireError,
};
pub use error::{ConsumerError, DialFailure, ReadFailure, Result};
pub use hook::OnConnect;
pub use proxy::{ProxyError, ProxyResolver, environment_resolver, proxy_from_environment};
pub use retry::{DEFAULT_RECONNECT_DELAY, DEFAULT_RETRIES};
