//! Authenticated WebSocket upgrade against the traffic controller.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue, ORIGIN};
use tokio_tungstenite::tungstenite::http::{Response, StatusCode};
use tokio_tungstenite::tungstenite::{self, Error as WsError};
use tokio_tungstenite::{Connector, client_async_tls_with_config};
use tracing::debug;
use url::Url;

use crate::connection::WsStream;
use crate::debug::{DebugPrinter, headers_string};
use crate::error::{ConsumerError, DialFailure, Result};
use crate::hook::ConnectHook;
use crate::proxy::{self, ProxyResolver};

pub const ORIGIN_HEADER: &str = "http://localhost";

/// Everything a dial needs that is shared across the consumer's streams.
pub(crate) struct DialContext<'a> {
    pub base_url: &'a str,
    pub proxy: Option<&'a ProxyResolver>,
    pub tls: Option<&'a Connector>,
    pub printer: Arc<dyn DebugPrinter>,
    pub hook: &'a ConnectHook,
}

/// Dials one stream path with one token. Does not retry.
pub(crate) struct StreamDialer {
    path: String,
    token: String,
}

impl StreamDialer {
    pub(crate) fn new(path: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: token.into(),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) async fn dial(&self, ctx: &DialContext<'_>) -> Result<WsStream> {
        let dial_error = |source: DialFailure| ConsumerError::Dial {
            target: ctx.base_url.to_string(),
            source,
        };

        let raw = format!("{}{}", ctx.base_url.trim_end_matches('/'), self.path);
        let url = Url::parse(&raw).map_err(|err| dial_error(DialFailure::InvalidUrl(format!("{raw}: {err}"))))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| dial_error(DialFailure::Handshake(err)))?;
        let authorization = HeaderValue::from_str(&self.token)
            .map_err(|_| dial_error(DialFailure::InvalidHeader("Authorization")))?;
        let headers = request.headers_mut();
        headers.insert(ORIGIN, HeaderValue::from_static(ORIGIN_HEADER));
        headers.insert(AUTHORIZATION, authorization);

        ctx.printer.print(
            "WEBSOCKET REQUEST:",
            &format!(
                "GET {} HTTP/1.1\nHost: {}\nUpgrade: websocket\nConnection: Upgrade\nSec-WebSocket-Version: 13\nSec-WebSocket-Key: [HIDDEN]\nOrigin: {}\nAuthorization: {}\n",
                self.path, ctx.base_url, ORIGIN_HEADER, self.token
            ),
        );

        let stream = proxy::dial(&url, ctx.proxy)
            .await
            .map_err(|err| dial_error(DialFailure::Proxy(err)))?;

        match client_async_tls_with_config(request, stream, None, ctx.tls.cloned()).await {
            Ok((ws, response)) => {
                print_response(ctx.printer.as_ref(), &response);
                debug!(
                    target = "firehose.dial",
                    path = %self.path,
                    status = %response.status(),
                    "websocket upgraded"
                );
                ctx.hook.fire();
                Ok(ws)
            }
            Err(WsError::Http(response)) => {
                print_response(ctx.printer.as_ref(), &response);
                if response.status() == StatusCode::UNAUTHORIZED {
                    let body = response
                        .body()
                        .as_deref()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .unwrap_or_default();
                    return Err(ConsumerError::Unauthorized { body });
                }
                Err(dial_error(DialFailure::Handshake(tungstenite::Error::Http(
                    response,
                ))))
            }
            Err(err) => Err(dial_error(DialFailure::Handshake(err))),
        }
    }
}

fn print_response<B>(printer: &dyn DebugPrinter, response: &Response<B>) {
    printer.print(
        "WEBSOCKET RESPONSE:",
        &format!(
            "{:?} {}\n{}",
            response.version(),
            response.status(),
            headers_string(response.headers())
        ),
    );
}
