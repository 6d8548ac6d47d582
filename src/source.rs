//! Remote sources of feature payloads.
use std::{
    io::{BufRead, BufReader},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use reqwest::{
    header::{ACCEPT, ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};
use serde_json::Value;

use crate::{Error, Result};

/// Outcome of a [`ConfigSource::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// A new payload.
    Fetched {
        /// Raw features payload.
        payload: Value,
        /// Entity tag to send with the next fetch.
        etag: Option<String>,
    },
    /// The payload matching the supplied entity tag is still current.
    NotModified,
}

/// A stream of full payload updates. Iteration blocks until the next update arrives. An `Err` item
/// or the end of the iterator means the subscription is broken.
pub type Updates = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Tells an update stream that its subscriber is gone.
///
/// Streams returned from [`ConfigSource::subscribe`] must check [`CloseSignal::is_closed`] between
/// reads and end (return `None`) once it is set, releasing their connection.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal(Arc<AtomicBool>);

impl CloseSignal {
    /// Create an open signal.
    pub fn new() -> CloseSignal {
        CloseSignal::default()
    }

    /// Ask the stream to close.
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`CloseSignal::close`] has been called on any clone.
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A source of feature payloads.
pub trait ConfigSource: Send + Sync {
    /// Fetch the current payload. `etag` is the entity tag of the previously fetched payload.
    fn fetch(&self, api_host: &str, client_key: &str, etag: Option<&str>) -> Result<FetchResult>;

    /// Subscribe to payload updates. The returned stream must end soon after `close` is closed.
    ///
    /// The default implementation returns [`Error::StreamingUnsupported`].
    fn subscribe(&self, api_host: &str, client_key: &str, close: CloseSignal) -> Result<Updates> {
        let _ = (api_host, client_key, close);
        Err(Error::StreamingUnsupported)
    }
}

const FEATURES_ENDPOINT: &str = "/api/features/";
const STREAMING_ENDPOINT: &str = "/sub/";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ConfigSource`] over HTTP.
///
/// Payloads are fetched from `GET {api_host}/api/features/{client_key}`. Updates are received as
/// server-sent events from `GET {api_host}/sub/{client_key}`.
pub struct HttpConfigSource {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    /// If we receive a 401 Unauthorized error during a request, the client key is not valid. We
    /// remember this so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpConfigSource {
    /// Create a new source.
    pub fn new() -> HttpConfigSource {
        // Streaming responses are long-lived, so the client itself has no timeout. Plain fetches
        // set one per request.
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .unwrap_or_default();
        HttpConfigSource {
            client,
            unauthorized: AtomicBool::new(false),
        }
    }

    fn check_status(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response> {
        response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "splitkit", "client is not authorized. Check your client key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "splitkit",
                           "received non-200 response while fetching features: {:?}", err);
                Error::from(err)
            }
        })
    }

    fn ensure_authorized(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }
}

impl Default for HttpConfigSource {
    fn default() -> Self {
        HttpConfigSource::new()
    }
}

fn endpoint(api_host: &str, path: &str, client_key: &str) -> Result<Url> {
    Url::parse(&format!(
        "{}{}{}",
        api_host.trim_end_matches('/'),
        path,
        client_key
    ))
    .map_err(Error::InvalidApiHost)
}

impl ConfigSource for HttpConfigSource {
    fn fetch(&self, api_host: &str, client_key: &str, etag: Option<&str>) -> Result<FetchResult> {
        self.ensure_authorized()?;

        let url = endpoint(api_host, FEATURES_ENDPOINT, client_key)?;

        log::debug!(target: "splitkit", "fetching features");
        let mut request = self.client.get(url).timeout(FETCH_TIMEOUT);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send()?;

        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!(target: "splitkit", "features not modified");
            return Ok(FetchResult::NotModified);
        }

        let response = self.check_status(response)?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let payload = response.json()?;

        log::debug!(target: "splitkit", "successfully fetched features");

        Ok(FetchResult::Fetched { payload, etag })
    }

    fn subscribe(&self, api_host: &str, client_key: &str, close: CloseSignal) -> Result<Updates> {
        self.ensure_authorized()?;

        let url = endpoint(api_host, STREAMING_ENDPOINT, client_key)?;

        log::debug!(target: "splitkit", "subscribing to feature updates");
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()?;
        let response = self.check_status(response)?;

        Ok(Box::new(ServerSentEvents::new(BufReader::new(response)).with_close_signal(close)))
    }
}

/// Decodes `event: features` server-sent events into payloads.
///
/// The close signal is checked after every line, so a stream that only carries keepalive comments
/// still ends shortly after it is closed.
pub(crate) struct ServerSentEvents<R> {
    reader: R,
    event: Option<String>,
    data: String,
    done: bool,
    close: CloseSignal,
}

impl<R: BufRead> ServerSentEvents<R> {
    pub fn new(reader: R) -> ServerSentEvents<R> {
        ServerSentEvents {
            reader,
            event: None,
            data: String::new(),
            done: false,
            close: CloseSignal::new(),
        }
    }

    pub fn with_close_signal(mut self, close: CloseSignal) -> ServerSentEvents<R> {
        self.close = close;
        self
    }

    /// Dispatch the buffered event. Returns `None` if it isn't a features event.
    fn dispatch(&mut self) -> Option<Result<Value>> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        if data.is_empty() || event.as_deref().is_some_and(|event| event != "features") {
            return None;
        }
        Some(serde_json::from_str(&data).map_err(Error::from))
    }
}

impl<R: BufRead> Iterator for ServerSentEvents<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        while !self.done {
            if self.close.is_closed() {
                log::debug!(target: "splitkit", "feature update stream closed");
                self.done = true;
                return None;
            }

            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return self.dispatch();
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if let Some(item) = self.dispatch() {
                    return Some(item);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => self.event = Some(value.to_owned()),
                "data" => {
                    if !self.data.is_empty() {
                        self.data.push('\n');
                    }
                    self.data.push_str(value);
                }
                _ => {}
            }
        }
        None
    }
}
