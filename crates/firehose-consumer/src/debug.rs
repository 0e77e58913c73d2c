use std::sync::Arc;

use tokio_tungstenite::tungstenite::http::HeaderMap;

/// Sink for human-readable traces of the upgrade request and response.
pub trait DebugPrinter: Send + Sync {
    fn print(&self, title: &str, dump: &str);
}

impl<F> DebugPrinter for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn print(&self, title: &str, dump: &str) {
        (self)(title, dump)
    }
}

/// Discards every trace. Used when no printer is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDebugPrinter;

impl DebugPrinter for NullDebugPrinter {
    fn print(&self, _title: &str, _dump: &str) {}
}

/// Forwards traces to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDebugPrinter;

impl DebugPrinter for TracingDebugPrinter {
    fn print(&self, title: &str, dump: &str) {
        tracing::debug!(target = "firehose.wire", "{title}\n{dump}");
    }
}

pub(crate) fn null_printer() -> Arc<dyn DebugPrinter> {
    Arc::new(NullDebugPrinter)
}

/// One `Name: value` line per header, values of repeated headers joined.
pub(crate) fn headers_string(headers: &HeaderMap) -> String {
    let mut result = String::new();
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .map(|value| value.to_str().unwrap_or("[binary]"))
            .collect();
        result.push_str(name.as_str());
        result.push_str(": ");
        result.push_str(&values.join(", "));
        result.push('\n');
    }
    result
}
