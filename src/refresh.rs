//! A background thread that keeps the configuration store up to date, either by polling the config
//! source or by following its live update stream.
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use rand::{thread_rng, Rng};
use serde_json::Value;

use crate::{
    configuration_store::ConfigurationStore, repository::FeatureRepository, source::CloseSignal,
    Error, Result,
};

/// How long a stopping refresh thread waits for the update stream to close.
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How the refresh thread learns about new features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStrategy {
    /// Re-fetch features every `interval`.
    Polling {
        /// Interval to wait between fetches.
        interval: Duration,
    },
    /// Follow the live update stream of the config source. When the stream breaks, features are
    /// fetched once and the thread resubscribes after a backoff.
    Streaming,
}

impl Default for RefreshStrategy {
    fn default() -> Self {
        RefreshStrategy::Polling {
            interval: RefreshConfig::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Configuration for [`RefreshThread`].
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Defaults to polling every [`RefreshConfig::DEFAULT_POLL_INTERVAL`].
    pub strategy: RefreshStrategy,
    /// Jitter applies a randomized duration to wait between requests for features. This helps to
    /// avoid multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`RefreshConfig::DEFAULT_JITTER`].
    pub jitter: Duration,
    /// Delay after the first failure. Doubles with every consecutive failure.
    pub min_backoff: Duration,
    /// Upper bound of the failure delay.
    pub max_backoff: Duration,
}

impl RefreshConfig {
    /// Default polling interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`RefreshConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`RefreshConfig::min_backoff`].
    pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);
    /// Default value for [`RefreshConfig::max_backoff`].
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

    /// Create a new `RefreshConfig` using default configuration.
    pub fn new() -> RefreshConfig {
        RefreshConfig::default()
    }

    /// Update refresh strategy with `strategy`.
    pub fn with_strategy(mut self, strategy: RefreshStrategy) -> RefreshConfig {
        self.strategy = strategy;
        self
    }

    /// Update jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> RefreshConfig {
        self.jitter = jitter;
        self
    }

    /// Update failure backoff bounds.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> RefreshConfig {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }
}

impl Default for RefreshConfig {
    fn default() -> RefreshConfig {
        RefreshConfig {
            strategy: RefreshStrategy::default(),
            jitter: RefreshConfig::DEFAULT_JITTER,
            min_backoff: RefreshConfig::DEFAULT_MIN_BACKOFF,
            max_backoff: RefreshConfig::DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Messages received by the refresh thread.
enum Signal {
    Stop,
    Update(Result<Value>),
    /// The stream reader exited.
    Disconnected,
}

type LoadResult = Arc<(Mutex<Option<Result<()>>>, Condvar)>;

/// A handle to the background refresh thread.
///
/// Dropping the handle stops the thread without waiting for it. Use [`RefreshThread::shutdown`] to
/// stop and join it.
pub struct RefreshThread {
    join_handle: Option<JoinHandle<()>>,

    /// Used to send a stop command to the refresh thread. Stream readers send updates through
    /// clones of the same channel.
    signals: mpsc::Sender<Signal>,

    /// Holds `None` if features haven't been loaded yet. Holds `Some(Ok(()))` if features have
    /// been loaded successfully. Holds `Some(Err(...))` if loading failed unrecoverably.
    result: LoadResult,
}

impl RefreshThread {
    /// Starts the refresh thread for `client_key` on `api_host`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        repository: Arc<FeatureRepository>,
        store: Arc<ConfigurationStore>,
        api_host: String,
        client_key: String,
        config: RefreshConfig,
    ) -> std::io::Result<RefreshThread> {
        let (signals, receiver) = mpsc::channel::<Signal>();

        let result: LoadResult = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value| {
                if let Ok(mut slot) = result.0.lock() {
                    *slot = Some(value);
                }
                result.1.notify_all();
            };
            let worker = Worker {
                repository,
                store,
                api_host,
                client_key,
                config,
                signals: signals.clone(),
                receiver,
                failures: 0,
                stream_failures: 0,
            };

            std::thread::Builder::new()
                .name("splitkit-refresh".to_owned())
                .spawn(move || {
                    let mut worker = worker;
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        worker.run(&update_result)
                    }));

                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => update_result(Err(err)),
                        Err(_panic_info) => update_result(Err(Error::RefreshThreadPanicked)),
                    }
                })?
        };

        Ok(RefreshThread {
            join_handle: Some(join_handle),
            signals,
            result,
        })
    }

    /// Waits for the first features to be loaded.
    ///
    /// Returns immediately if features have already been loaded or loading failed unrecoverably.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidApiHost`]
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::RefreshThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::RefreshThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the refresh thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the thread has already exited.
        let _ = self.signals.send(Signal::Stop);
    }

    /// Stop the refresh thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefreshThreadPanicked`] if the thread has panicked.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop();

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .join()
                .map_err(|_| Error::RefreshThreadPanicked)?;
        }

        Ok(())
    }
}

impl Drop for RefreshThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the refresh thread.
struct Worker {
    repository: Arc<FeatureRepository>,
    store: Arc<ConfigurationStore>,
    api_host: String,
    client_key: String,
    config: RefreshConfig,
    signals: mpsc::Sender<Signal>,
    receiver: mpsc::Receiver<Signal>,
    /// Consecutive failed fetches.
    failures: u32,
    /// Consecutive broken subscriptions without a single update.
    stream_failures: u32,
}

/// Whether the refresh thread should keep going.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl Worker {
    fn run(&mut self, update_result: &dyn Fn(Result<()>)) -> Result<()> {
        let mut strategy = self.config.strategy;
        let mut first = true;

        loop {
            log::debug!(target: "splitkit", "fetching new features");
            let loaded = if first {
                self.repository.load_features(&self.api_host, &self.client_key)
            } else {
                self.repository.refresh_features(&self.api_host, &self.client_key)
            };
            first = false;

            match loaded {
                Ok(features) => {
                    self.store.set_features(features);
                    self.failures = 0;
                    update_result(Ok(()));
                }
                Err(err @ (Error::Unauthorized | Error::InvalidApiHost(_))) => return Err(err),
                Err(err) => {
                    log::warn!(target: "splitkit", "failed to fetch features: {err}");
                    self.failures += 1;
                }
            }

            if strategy == RefreshStrategy::Streaming && self.failures == 0 {
                match self.follow_stream(update_result) {
                    Ok(Flow::Stop) => return Ok(()),
                    Ok(Flow::Continue) => self.stream_failures += 1,
                    Err(Error::StreamingUnsupported) => {
                        log::warn!(target: "splitkit",
                                   "streaming is not supported, falling back to polling");
                        strategy = RefreshStrategy::default();
                    }
                    Err(err @ (Error::Unauthorized | Error::InvalidApiHost(_))) => return Err(err),
                    Err(err) => {
                        log::warn!(target: "splitkit",
                                   "failed to subscribe to feature updates: {err}");
                        self.stream_failures += 1;
                    }
                }
            }

            let timeout = match strategy {
                _ if self.failures > 0 => {
                    backoff(self.failures, self.config.min_backoff, self.config.max_backoff)
                }
                RefreshStrategy::Polling { interval } => jitter(interval, self.config.jitter),
                RefreshStrategy::Streaming => backoff(
                    self.stream_failures,
                    self.config.min_backoff,
                    self.config.max_backoff,
                ),
            };
            if self.wait(timeout) == Flow::Stop {
                return Ok(());
            }
        }
    }

    /// Follow the update stream until it breaks (`Flow::Continue`) or a stop command arrives.
    fn follow_stream(&mut self, update_result: &dyn Fn(Result<()>)) -> Result<Flow> {
        let close = CloseSignal::new();
        let updates = self
            .repository
            .subscribe(&self.api_host, &self.client_key, close.clone())?;
        log::debug!(target: "splitkit", "subscribed to feature updates");

        let signals = self.signals.clone();
        let reader = std::thread::Builder::new()
            .name("splitkit-stream".to_owned())
            .spawn(move || {
                for update in updates {
                    let broken = update.is_err();
                    if signals.send(Signal::Update(update)).is_err() || broken {
                        break;
                    }
                }
                let _ = signals.send(Signal::Disconnected);
            })?;

        loop {
            match self.receiver.recv() {
                Ok(Signal::Stop) | Err(_) => {
                    log::debug!(target: "splitkit", "refresh thread received stop command");
                    self.close_stream(&close, reader);
                    return Ok(Flow::Stop);
                }
                Ok(Signal::Update(Ok(payload))) => {
                    match self
                        .repository
                        .store_payload(&self.api_host, &self.client_key, payload)
                    {
                        Ok(features) => {
                            log::debug!(target: "splitkit", "received feature update");
                            self.store.set_features(features);
                            self.stream_failures = 0;
                            update_result(Ok(()));
                        }
                        Err(err) => {
                            log::warn!(target: "splitkit", "ignoring feature update: {err}");
                        }
                    }
                }
                Ok(Signal::Update(Err(err))) => {
                    log::warn!(target: "splitkit", "feature update stream failed: {err}");
                }
                Ok(Signal::Disconnected) => {
                    log::debug!(target: "splitkit", "feature update stream disconnected");
                    let _ = reader.join();
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Close the update stream and join its reader, giving up after [`STREAM_CLOSE_TIMEOUT`].
    fn close_stream(&self, close: &CloseSignal, reader: JoinHandle<()>) {
        close.close();

        let deadline = Instant::now() + STREAM_CLOSE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(Signal::Disconnected) => {
                    let _ = reader.join();
                    log::debug!(target: "splitkit", "feature update stream released");
                    return;
                }
                Ok(Signal::Stop | Signal::Update(_)) => {}
                Err(_) => {
                    log::warn!(target: "splitkit",
                               "feature update stream did not close in time, detaching reader");
                    return;
                }
            }
        }
    }

    /// Sleep for `timeout` unless a stop command arrives first.
    fn wait(&self, timeout: Duration) -> Flow {
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Flow::Continue,
            Ok(Signal::Stop) => {
                log::debug!(target: "splitkit", "refresh thread received stop command");
                Flow::Stop
            }
            // Leftovers of a previous stream. Loop back to fetch new features.
            Ok(Signal::Update(_) | Signal::Disconnected) => Flow::Continue,
            Err(RecvTimeoutError::Disconnected) => Flow::Stop,
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// Delay after `failures` consecutive failures: `min` doubled for every failure after the first,
/// capped at `max`.
fn backoff(failures: u32, min: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    min.saturating_mul(1 << exponent).min(max)
}
