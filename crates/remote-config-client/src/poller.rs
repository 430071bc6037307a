//! The configuration poller.
//!
//! A [`ConfigurationPoller`] owns the product registry and drives one poll
//! cycle per tick: read file-backed configurations, build the request, send it
//! through the [`Transport`], verify the response, dispatch changed
//! configurations to listeners and compute the client state reported on the
//! next request.
//!
//! Registration methods can be called from any thread at any time, including
//! from inside a listener. While listeners run, registrations are queued and
//! applied once the dispatch ends, so they never wait on the cycle. The
//! registry lock is never held across an await point.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::client_state::{build_error_message, NextClientState};
use crate::config::{PollerConfig, MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};
use crate::config_key::ConfigKey;
use crate::envelope::ResponseEnvelope;
use crate::listener::{
    typed, ConfigurationChangesListener, ConfigurationDeserializer, ConfigurationEndListener,
    Deserializing, NoopHinter, ProductListener, RateHintAggregator, TypedListener,
};
use crate::product::Product;
use crate::ratelimit::RateLimitedLogger;
use crate::registry::{panic_message, ProductRegistry};
use crate::request::{EndpointProvider, PollRequest, RequestFactory, StaticEndpoint};
use crate::telemetry::{NoopTelemetry, PollerTelemetry};
use crate::transport::{body_preview, HttpTransport, Transport, TransportError};
use crate::verify::{IntegrityVerifier, PublicKeyError};

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("the remote configuration poller needs a running tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    PublicKey(#[from] PublicKeyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unable to read configuration file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration file {path} is {size} bytes, more than the maximum of {limit} bytes")]
    FileTooLarge { path: String, size: u64, limit: usize },
}

/// What a single call to [`ConfigurationPoller::poll_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No request was sent: nothing is subscribed, the endpoint is unknown or
    /// the poller could not be initialised.
    Skipped,
    /// The endpoint answered 404; remote configuration is off.
    Disabled,
    /// 204, or a response without targets.
    NoChanges,
    /// Transport failure, unexpected status or unparsable body. State is
    /// unchanged.
    Failed,
    /// The response failed verification or carried procedural errors; nothing
    /// was applied.
    Rejected,
    Applied {
        changed: bool,
        errors: usize,
    },
}

/// Handle returned when registering a [`ConfigurationEndListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndListenerId(u64);

struct FileListener {
    path: PathBuf,
    listener: Box<dyn ConfigurationChangesListener>,
}

/// A change to the set of listeners.
enum Registration {
    Listener(Product, Box<dyn ProductListener>),
    KeyedListener(Product, String, Box<dyn ProductListener>),
    RemoveListeners(Product),
    File(FileListener),
    EndListener(EndListenerId, Box<dyn ConfigurationEndListener>),
    RemoveEndListener(EndListenerId),
}

struct PollerState {
    registry: ProductRegistry,
    end_listeners: Vec<(EndListenerId, Box<dyn ConfigurationEndListener>)>,
    file_listeners: Vec<FileListener>,
    request_factory: Option<RequestFactory>,
    fatal_on_initialization: bool,
}

impl PollerState {
    fn register(&mut self, registration: Registration) -> bool {
        match registration {
            Registration::Listener(product, listener) => {
                self.registry.add_listener(product, listener);
                true
            }
            Registration::KeyedListener(product, config_id, listener) => {
                self.registry.add_keyed_listener(product, &config_id, listener);
                true
            }
            Registration::RemoveListeners(product) => self.registry.remove_listeners(product),
            Registration::File(file) => {
                self.file_listeners.retain(|existing| existing.path != file.path);
                self.file_listeners.push(file);
                true
            }
            Registration::EndListener(id, listener) => {
                self.end_listeners.push((id, listener));
                true
            }
            Registration::RemoveEndListener(id) => {
                let before = self.end_listeners.len();
                self.end_listeners.retain(|(existing, _)| *existing != id);
                before != self.end_listeners.len()
            }
        }
    }
}

/// What the last cycle decided for the next one.
struct CycleStatus {
    next_state: NextClientState,
    interval: Duration,
}

#[derive(Default)]
struct Lifecycle {
    start_count: usize,
    shutdown: Option<broadcast::Sender<()>>,
}

struct PollerShared {
    config: PollerConfig,
    verifier: Option<IntegrityVerifier>,
    transport: Arc<dyn Transport>,
    endpoint: Arc<dyn EndpointProvider>,
    telemetry: RwLock<Arc<dyn PollerTelemetry>>,
    state: Mutex<PollerState>,
    status: Mutex<CycleStatus>,
    pending: Mutex<Vec<Registration>>,
    dispatching: AtomicBool,
    capabilities: AtomicU64,
    next_end_listener_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    cycle: tokio::sync::Mutex<()>,
    log: RateLimitedLogger,
}

/// Polls the agent for configurations and dispatches them to listeners.
///
/// Cloning is cheap; clones share the same registry and lifecycle. The
/// polling task does not keep the poller alive: once every handle is dropped
/// it exits on its next tick.
#[derive(Clone)]
pub struct ConfigurationPoller {
    shared: Arc<PollerShared>,
}

impl std::fmt::Debug for ConfigurationPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationPoller")
            .field("endpoint", &self.shared.config.endpoint())
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the span during which listeners run.
struct DispatchGuard<'a>(&'a AtomicBool);

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConfigurationPoller {
    /// Builds a poller sending requests over HTTP to `config.endpoint()`.
    pub fn from_config(config: PollerConfig) -> Result<Self, PollerError> {
        let config = config.sanitise();
        let transport = Arc::new(HttpTransport::new(config.max_payload_size)?);
        let endpoint = Arc::new(StaticEndpoint::new(config.endpoint()));
        Self::new(config, transport, endpoint)
    }

    pub fn new(
        config: PollerConfig,
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn EndpointProvider>,
    ) -> Result<Self, PollerError> {
        let config = config.sanitise();
        let verifier = if config.integrity_check_enabled {
            Some(IntegrityVerifier::from_hex(
                true,
                config.targets_key_id.clone(),
                &config.targets_key,
            )?)
        } else {
            debug!("remote-config: integrity checks are disabled");
            None
        };
        let state = PollerState {
            registry: ProductRegistry::new(),
            end_listeners: Vec::new(),
            file_listeners: Vec::new(),
            request_factory: None,
            fatal_on_initialization: false,
        };
        let status = CycleStatus {
            next_state: NextClientState::default(),
            interval: config.poll_interval,
        };
        Ok(Self {
            shared: Arc::new(PollerShared {
                config,
                verifier,
                transport,
                endpoint,
                telemetry: RwLock::new(Arc::new(NoopTelemetry)),
                state: Mutex::new(state),
                status: Mutex::new(status),
                pending: Mutex::new(Vec::new()),
                dispatching: AtomicBool::new(false),
                capabilities: AtomicU64::new(0),
                next_end_listener_id: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
                cycle: tokio::sync::Mutex::new(()),
                log: RateLimitedLogger::default(),
            }),
        })
    }

    pub fn config(&self) -> &PollerConfig {
        &self.shared.config
    }

    /// Replaces the telemetry sink.
    pub fn set_telemetry(&self, telemetry: Arc<dyn PollerTelemetry>) {
        let mut guard = self
            .shared
            .telemetry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = telemetry;
    }

    /// Applies `registration` now, or queues it when listeners are running.
    /// Queued registrations report success.
    fn register(&self, registration: Registration) -> bool {
        if self.shared.dispatching.load(Ordering::Acquire) {
            debug!("remote-config: deferring registration until listeners return");
            lock(&self.shared.pending).push(registration);
            return true;
        }
        self.shared.state().register(registration)
    }

    pub fn add_listener<L>(&self, product: Product, listener: L)
    where
        L: ProductListener + 'static,
    {
        self.register(Registration::Listener(product, Box::new(listener)));
    }

    /// Registers a listener for a single config id of `product`. It replaces
    /// any earlier listener for the same id.
    pub fn add_keyed_listener<L>(&self, product: Product, config_id: &str, listener: L)
    where
        L: ProductListener + 'static,
    {
        self.register(Registration::KeyedListener(
            product,
            config_id.to_string(),
            Box::new(listener),
        ));
    }

    pub fn add_typed_listener<T, D, L>(&self, product: Product, deserializer: D, listener: L)
    where
        T: 'static,
        D: ConfigurationDeserializer<T> + 'static,
        L: TypedListener<T> + 'static,
    {
        self.add_listener(product, typed(deserializer, listener));
    }

    /// Typed counterpart of [`add_keyed_listener`](Self::add_keyed_listener).
    pub fn add_typed_keyed_listener<T, D, L>(
        &self,
        product: Product,
        config_id: &str,
        deserializer: D,
        listener: L,
    ) where
        T: 'static,
        D: ConfigurationDeserializer<T> + 'static,
        L: TypedListener<T> + 'static,
    {
        self.add_keyed_listener(product, config_id, typed(deserializer, listener));
    }

    /// Unsubscribes `product`, dropping its listeners and cache.
    pub fn remove_listeners(&self, product: Product) -> bool {
        self.register(Registration::RemoveListeners(product))
    }

    /// Feeds the content of `path` to `listener` on every tick.
    pub fn add_file_listener<T, D, L>(&self, path: impl Into<PathBuf>, deserializer: D, listener: L)
    where
        T: 'static,
        D: ConfigurationDeserializer<T> + 'static,
        L: TypedListener<T> + 'static,
    {
        self.register(Registration::File(FileListener {
            path: path.into(),
            listener: Box::new(Deserializing::new(deserializer, listener)),
        }));
    }

    pub fn add_configuration_end_listener<L>(&self, listener: L) -> EndListenerId
    where
        L: ConfigurationEndListener + 'static,
    {
        let id = EndListenerId(
            self.shared
                .next_end_listener_id
                .fetch_add(1, Ordering::Relaxed),
        );
        self.register(Registration::EndListener(id, Box::new(listener)));
        id
    }

    pub fn remove_configuration_end_listener(&self, id: EndListenerId) -> bool {
        self.register(Registration::RemoveEndListener(id))
    }

    pub fn add_capabilities(&self, flags: u64) {
        self.shared.capabilities.fetch_or(flags, Ordering::Relaxed);
    }

    pub fn remove_capabilities(&self, flags: u64) {
        self.shared.capabilities.fetch_and(!flags, Ordering::Relaxed);
    }

    pub fn capabilities(&self) -> u64 {
        self.shared.capabilities.load(Ordering::Relaxed)
    }

    /// Interval currently used between two ticks.
    pub fn current_interval(&self) -> Duration {
        self.shared.current_interval()
    }

    /// Client state that the next request will report.
    pub fn next_client_state(&self) -> NextClientState {
        lock(&self.shared.status).next_state.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.lifecycle).start_count > 0
    }

    /// Requests delivery. The polling task is spawned on the first call;
    /// further calls only increase the reference count. A disabled poller
    /// ignores the call.
    pub fn start(&self) -> Result<(), PollerError> {
        if !self.shared.config.enabled {
            debug!("remote-config: remote configuration is disabled, not starting the poller");
            return Ok(());
        }
        let mut lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.start_count == 0 {
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| PollerError::NoRuntime)?;
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            runtime.spawn(PollerShared::run(Arc::downgrade(&self.shared), shutdown_rx));
            lifecycle.shutdown = Some(shutdown_tx);
            debug!(endpoint = %self.shared.config.endpoint(), "remote-config: poller started");
        }
        lifecycle.start_count += 1;
        Ok(())
    }

    /// Releases one [`start`](Self::start). The task stops when the count
    /// reaches zero; a cycle already in flight runs to completion.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.shared.lifecycle);
        match lifecycle.start_count {
            0 => debug!("remote-config: stop called on a poller that is not running"),
            1 => {
                lifecycle.start_count = 0;
                if let Some(shutdown) = lifecycle.shutdown.take() {
                    let _ = shutdown.send(());
                }
                debug!("remote-config: poller stopped");
            }
            _ => lifecycle.start_count -= 1,
        }
    }

    /// Runs one cycle immediately, independently of the scheduled task.
    pub async fn poll_once(&self) -> PollOutcome {
        self.shared.poll_once().await
    }
}

impl PollerShared {
    /// The scheduled task. It only holds the poller between ticks through a
    /// weak reference; dropping the last handle also drops the shutdown
    /// sender, which ends the loop.
    async fn run(shared: Weak<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut next_delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!("remote-config: poller task shutting down");
                    break;
                }
                _ = sleep(next_delay) => {
                    let Some(shared) = shared.upgrade() else {
                        debug!("remote-config: poller dropped, stopping its task");
                        break;
                    };
                    let outcome = shared.poll_once().await;
                    debug!(?outcome, "remote-config: poll cycle finished");
                    next_delay = shared.current_interval();
                }
            }
        }
    }

    /// Locks the registry state, first applying registrations queued while
    /// listeners were running.
    fn state(&self) -> MutexGuard<'_, PollerState> {
        let mut state = lock(&self.state);
        let pending = std::mem::take(&mut *lock(&self.pending));
        for registration in pending {
            state.register(registration);
        }
        state
    }

    fn current_interval(&self) -> Duration {
        lock(&self.status).interval
    }

    fn telemetry(&self) -> Arc<dyn PollerTelemetry> {
        Arc::clone(
            &self
                .telemetry
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    async fn poll_once(&self) -> PollOutcome {
        let _cycle = self.cycle.lock().await;
        self.load_files().await;

        let Some(request) = self.prepare_request() else {
            return PollOutcome::Skipped;
        };
        let url = request.url.clone();
        let telemetry = self.telemetry();
        telemetry.on_poll();

        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                telemetry.on_transport_error();
                self.log.log(
                    &format!("failed to poll remote configuration from {url}"),
                    &err,
                );
                return PollOutcome::Failed;
            }
        };

        match response.status {
            404 => {
                debug!("remote-config: endpoint is disabled");
                return PollOutcome::Disabled;
            }
            204 => {
                debug!("remote-config: no configuration changes (HTTP 204 No Content)");
                return PollOutcome::NoChanges;
            }
            _ if !response.is_success() => {
                self.log.log(
                    &format!(
                        "failed to retrieve remote configuration: unexpected response code {}",
                        response.status
                    ),
                    &body_preview(&response.body),
                );
                return PollOutcome::Failed;
            }
            _ => {}
        }

        let envelope = match ResponseEnvelope::parse(&response.body, self.config.max_payload_size)
        {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("remote-config: no configuration changes");
                return PollOutcome::NoChanges;
            }
            Err(err) => {
                self.log.log("error parsing remote config response", &err);
                return PollOutcome::Failed;
            }
        };

        let mut state = self.state();
        self.process(&mut state, &envelope, telemetry.as_ref())
    }

    /// Initialises the request factory when needed and builds this cycle's
    /// request. Returns `None` when no request should be sent.
    fn prepare_request(&self) -> Option<PollRequest> {
        let needs_endpoint = {
            let state = self.state();
            if state.registry.is_empty() || state.fatal_on_initialization {
                return None;
            }
            state.request_factory.is_none()
        };
        if needs_endpoint {
            // Stay quiet until the endpoint is known. Discovery runs without
            // the registry lock.
            let url = self.endpoint.endpoint()?;
            if !self.initialize(&url) {
                return None;
            }
        }

        let state = self.state();
        let factory = state.request_factory.as_ref()?;
        let next_state = lock(&self.status).next_state.clone();
        let result = factory.build(
            state.registry.product_names(),
            &next_state,
            state.registry.cached_target_files(),
            self.capabilities.load(Ordering::Relaxed),
        );
        match result {
            Ok(request) => Some(request),
            Err(err) => {
                self.log.log("failed to build poll request", &err);
                None
            }
        }
    }

    /// Builds the request factory for `url`. A construction failure is
    /// permanent; endpoint discovery itself is retried every tick.
    fn initialize(&self, url: &str) -> bool {
        let factory = RequestFactory::new(&self.config, url);
        let mut state = self.state();
        match factory {
            Ok(factory) => {
                debug!(url = %factory.url(), client_id = %factory.client_id(), "remote-config: poller initialised");
                state.request_factory = Some(factory);
                true
            }
            Err(err) => {
                state.fatal_on_initialization = true;
                error!(error = %err, "remote-config: poller initialisation failed");
                false
            }
        }
    }

    fn reject(&self, error: String, telemetry: &dyn PollerTelemetry) -> PollOutcome {
        telemetry.on_procedural_error(&error);
        let mut status = lock(&self.status);
        status.next_state = status.next_state.rejected(error);
        PollOutcome::Rejected
    }

    fn process(
        &self,
        state: &mut PollerState,
        envelope: &ResponseEnvelope,
        telemetry: &dyn PollerTelemetry,
    ) -> PollOutcome {
        debug!(
            targets_version = envelope.targets().version(),
            "remote-config: got configuration"
        );

        if let Some(verifier) = &self.verifier {
            if let Err(err) = verifier.verify(envelope) {
                self.log.log("error doing initial verifications", &err);
                return self.reject(err.to_string(), telemetry);
            }
        }

        let mut errors = Vec::new();
        let mut keys_by_product: HashMap<Product, Vec<ConfigKey>> = HashMap::new();
        for path in envelope.client_configs() {
            match ConfigKey::parse(path) {
                Ok(key) if state.registry.is_subscribed(key.product()) => {
                    keys_by_product.entry(key.product()).or_default().push(key);
                }
                Ok(key) => errors.push(format!(
                    "Told to handle config key {path}, but the product {} is not being handled",
                    key.product_name()
                )),
                Err(err) => errors.push(err.to_string()),
            }
        }
        if let Some(message) = build_error_message(&errors) {
            self.log.log("rejecting remote configuration", &message);
            return self.reject(message, telemetry);
        }

        let mut hints = RateHintAggregator::new();
        let outcome = {
            let _dispatching = DispatchGuard::enter(&self.dispatching);
            let outcome = state.registry.apply(envelope, &keys_by_product, &mut hints);
            if outcome.changed {
                run_end_listeners(&mut state.end_listeners, &mut errors, &self.log);
            }
            outcome
        };

        telemetry.on_configs_applied(outcome.applied);
        telemetry.on_configs_failed(outcome.errors.len());
        telemetry.on_configs_removed(outcome.removed);
        if let Some(message) = build_error_message(&errors) {
            self.log.log("error applying remote configuration", &message);
            telemetry.on_procedural_error(&message);
        }

        let config_states = state.registry.config_states();
        let mut status = lock(&self.status);
        status.next_state = status
            .next_state
            .applied(envelope.targets(), config_states, &errors);

        if let Some(hint) = hints.hint() {
            let hint = hint.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
            if hint != status.interval {
                debug!(
                    previous = ?status.interval,
                    next = ?hint,
                    "remote-config: rescheduling poller"
                );
                status.interval = hint;
            }
        }
        drop(status);

        for registration in std::mem::take(&mut *lock(&self.pending)) {
            state.register(registration);
        }

        PollOutcome::Applied {
            changed: outcome.changed,
            errors: outcome.errors.len() + errors.len(),
        }
    }

    /// Reads every registered file and hands its content to its listener.
    async fn load_files(&self) {
        let paths: Vec<PathBuf> = self
            .state()
            .file_listeners
            .iter()
            .map(|file| file.path.clone())
            .collect();

        for path in paths {
            debug!(path = %path.display(), "remote-config: loading configuration from file");
            let content = match read_capped(&path, self.config.max_payload_size).await {
                Ok(content) => content,
                Err(err) => {
                    self.log.log("unable to load config file", &err);
                    continue;
                }
            };
            let key = tokio::fs::canonicalize(&path)
                .await
                .unwrap_or_else(|_| path.clone())
                .display()
                .to_string();
            self.apply_file(&path, &key, &content);
        }
    }

    fn apply_file(&self, path: &Path, key: &str, content: &[u8]) {
        let mut state = self.state();
        let Some(file) = state.file_listeners.iter_mut().find(|file| file.path == path) else {
            return;
        };
        let result = {
            let _dispatching = DispatchGuard::enter(&self.dispatching);
            catch_unwind(AssertUnwindSafe(|| {
                file.listener.accept(key, Some(content), &mut NoopHinter)
            }))
        };
        match result {
            Ok(Ok(())) => debug!(path = %key, "remote-config: loaded configuration from file"),
            Ok(Err(err)) => self.log.log(
                &format!("failed reading or applying configuration from {key}"),
                &err,
            ),
            Err(payload) => self.log.log(
                &format!("failed reading or applying configuration from {key}"),
                &panic_message(payload.as_ref()),
            ),
        }
    }
}

fn run_end_listeners(
    listeners: &mut [(EndListenerId, Box<dyn ConfigurationEndListener>)],
    errors: &mut Vec<String>,
    log: &RateLimitedLogger,
) {
    for (_, listener) in listeners.iter_mut() {
        match catch_unwind(AssertUnwindSafe(|| listener.on_configuration_end())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errors.push(err.message().to_string()),
            Err(payload) => {
                // Not tied to any config key, so there is nothing to report back.
                log.log(
                    "error running configuration end listener",
                    &panic_message(payload.as_ref()),
                );
            }
        }
    }
}

async fn read_capped(path: &Path, limit: usize) -> Result<Vec<u8>, PollerError> {
    let display = || path.display().to_string();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| PollerError::FileRead {
            path: display(),
            source,
        })?;
    if metadata.len() > limit as u64 {
        return Err(PollerError::FileTooLarge {
            path: display(),
            size: metadata.len(),
            limit,
        });
    }
    let content = tokio::fs::read(path)
        .await
        .map_err(|source| PollerError::FileRead {
            path: display(),
            source,
        })?;
    if content.len() > limit {
        return Err(PollerError::FileTooLarge {
            path: display(),
            size: content.len() as u64,
            limit,
        });
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{from_fn, PollingRateHinter, ReportableError};
    use crate::test_support::{signing_key, ResponseBuilder, TEST_KEY_ID};
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Replays canned responses and records the request bodies.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        requests: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedTransport {
        fn push(&self, response: Result<TransportResponse, TransportError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn requests(&self) -> Vec<serde_json::Value> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, request: PollRequest) -> Result<TransportResponse, TransportError> {
            self.requests
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&request.body).unwrap());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(204, Vec::new())))
        }
    }

    fn test_config() -> PollerConfig {
        PollerConfig {
            targets_key_id: TEST_KEY_ID.to_string(),
            targets_key: hex::encode(signing_key().verifying_key().to_bytes()),
            ..PollerConfig::default()
        }
    }

    fn poller(transport: &Arc<ScriptedTransport>) -> ConfigurationPoller {
        ConfigurationPoller::new(
            test_config(),
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(StaticEndpoint::new("http://agent:8126/v0.7/config")),
        )
        .unwrap()
    }

    fn ok(builder: &ResponseBuilder) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(200, builder.body()))
    }

    const KEY: &str = "employee/ASM_FEATURES/id1/config";

    #[tokio::test]
    async fn nothing_is_sent_without_subscriptions() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_endpoint_skips_the_tick() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = ConfigurationPoller::new(
            PollerConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(StaticEndpoint::unknown()),
        )
        .unwrap();
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn bad_endpoint_is_fatal() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = ConfigurationPoller::new(
            PollerConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(StaticEndpoint::new("::not a url::")),
        )
        .unwrap();
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn procedural_errors_skip_the_apply_phase() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        poller.add_listener(
            Product::AsmFeatures,
            from_fn(move |_, _, _| {
                *counter.lock().unwrap() += 1;
                Ok(())
            }),
        );

        let other = "employee/APM_TRACING/t/config";
        transport.push(ok(&ResponseBuilder::new(3)
            .target(KEY, b"{}", 1)
            .target(other, b"{}", 1)));
        assert_eq!(poller.poll_once().await, PollOutcome::Rejected);
        assert_eq!(*calls.lock().unwrap(), 0);

        let state = poller.next_client_state();
        assert_eq!(state.targets_version(), 0);
        assert_eq!(
            state.error(),
            Some(
                "Told to handle config key employee/APM_TRACING/t/config, but the product APM_TRACING is not being handled"
            )
        );
    }

    #[tokio::test]
    async fn end_listener_errors_are_procedural() {
        struct Failing;
        impl ConfigurationEndListener for Failing {
            fn on_configuration_end(&mut self) -> Result<(), ReportableError> {
                Err(ReportableError::new("cannot merge configurations"))
            }
        }

        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));
        let id = poller.add_configuration_end_listener(Failing);

        transport.push(ok(&ResponseBuilder::new(5).target(KEY, b"{}", 1)));
        assert_eq!(
            poller.poll_once().await,
            PollOutcome::Applied {
                changed: true,
                errors: 1
            }
        );
        let state = poller.next_client_state();
        assert_eq!(state.error(), Some("cannot merge configurations"));
        assert_eq!(state.targets_version(), 0);

        assert!(poller.remove_configuration_end_listener(id));
        assert!(!poller.remove_configuration_end_listener(id));
    }

    #[tokio::test]
    async fn unparsable_bodies_leave_state_untouched() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));

        transport.push(Ok(TransportResponse::new(200, "{not json")));
        assert_eq!(poller.poll_once().await, PollOutcome::Failed);
        transport.push(Ok(TransportResponse::new(200, "{}")));
        assert_eq!(poller.poll_once().await, PollOutcome::NoChanges);
        transport.push(Ok(TransportResponse::new(500, "oops")));
        assert_eq!(poller.poll_once().await, PollOutcome::Failed);
        transport.push(Err(TransportError::Other("connection reset".to_string())));
        assert_eq!(poller.poll_once().await, PollOutcome::Failed);

        assert_eq!(poller.next_client_state(), NextClientState::default());
    }

    #[tokio::test]
    async fn capabilities_are_sent_with_each_request() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));
        poller.add_capabilities(0b1010);
        poller.remove_capabilities(0b0010);
        assert_eq!(poller.capabilities(), 0b1000);

        poller.poll_once().await;
        let requests = transport.requests();
        assert_eq!(requests[0]["client"]["capabilities"], "CA==");
        assert_eq!(requests[0]["client"]["products"], serde_json::json!(["ASM_FEATURES"]));
    }

    #[tokio::test]
    async fn start_requires_a_runtime_only_once() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.start().unwrap();
        poller.start().unwrap();
        assert!(poller.is_running());
        poller.stop();
        assert!(poller.is_running());
        poller.stop();
        assert!(!poller.is_running());
        poller.stop();
        assert!(!poller.is_running());
    }

    #[test]
    fn start_outside_a_runtime_fails() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        assert!(matches!(poller.start(), Err(PollerError::NoRuntime)));
        assert!(!poller.is_running());
    }

    #[test]
    fn disabled_poller_never_starts() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = ConfigurationPoller::new(
            PollerConfig {
                enabled: false,
                ..PollerConfig::default()
            },
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(StaticEndpoint::unknown()),
        )
        .unwrap();
        poller.start().unwrap();
        assert!(!poller.is_running());
    }

    #[test]
    fn invalid_public_key_is_rejected_when_integrity_checks_are_on() {
        let transport = Arc::new(ScriptedTransport::default());
        let config = PollerConfig {
            targets_key: "zz".to_string(),
            ..PollerConfig::default()
        };
        let result = ConfigurationPoller::new(
            config.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(StaticEndpoint::unknown()),
        );
        assert!(matches!(result, Err(PollerError::PublicKey(_))));

        let result = ConfigurationPoller::new(
            PollerConfig {
                integrity_check_enabled: false,
                ..config
            },
            transport,
            Arc::new(StaticEndpoint::unknown()),
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rate_hints_are_clamped_to_the_maximum_interval() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.add_listener(
            Product::AsmFeatures,
            from_fn(|_, _, hinter| {
                hinter.suggest_polling_rate(Duration::from_secs(10 * 60 * 60));
                Ok(())
            }),
        );

        transport.push(ok(&ResponseBuilder::new(1).target(KEY, b"{}", 1)));
        poller.poll_once().await;
        assert_eq!(poller.current_interval(), MAX_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_ends_the_task() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));
        poller.start().unwrap();

        // The first tick fires immediately.
        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.requests().len(), 1);

        drop(poller);
        assert_eq!(Arc::strong_count(&transport), 1);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.requests().len(), 1);
    }

    /// Blocks in `endpoint()` until released.
    struct GatedEndpoint {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl EndpointProvider for GatedEndpoint {
        fn endpoint(&self) -> Option<String> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
            Some("http://agent:8126/v0.7/config".to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_discovery_does_not_block_registration() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let transport = Arc::new(ScriptedTransport::default());
        let poller = ConfigurationPoller::new(
            test_config(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(GatedEndpoint {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
        )
        .unwrap();
        poller.add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));

        let polling = tokio::spawn({
            let poller = poller.clone();
            async move { poller.poll_once().await }
        });
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let registering = poller.clone();
        std::thread::spawn(move || {
            registering.add_listener(Product::ApmTracing, from_fn(|_, _, _| Ok(())));
            let _ = done_tx.send(());
        });
        let registered = done_rx.recv_timeout(Duration::from_secs(2)).is_ok();
        release_tx.send(()).unwrap();
        assert!(registered, "registration waited for endpoint discovery");

        assert_eq!(polling.await.unwrap(), PollOutcome::NoChanges);
        assert_eq!(
            transport.requests()[0]["client"]["products"],
            serde_json::json!(["ASM_FEATURES", "APM_TRACING"])
        );
    }

    /// Subscribes to a product from inside a file listener.
    struct Subscriber(ConfigurationPoller);

    impl TypedListener<Vec<u8>> for Subscriber {
        fn accept(
            &mut self,
            _config_key: &str,
            _config: Option<Vec<u8>>,
            _hinter: &mut dyn PollingRateHinter,
        ) -> Result<(), ReportableError> {
            self.0
                .add_listener(Product::AsmFeatures, from_fn(|_, _, _| Ok(())));
            Ok(())
        }
    }

    fn raw(bytes: &[u8]) -> Result<Option<Vec<u8>>, ReportableError> {
        Ok(Some(bytes.to_vec()))
    }

    #[tokio::test]
    async fn file_listener_can_register_from_its_callback() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "on").unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let poller = poller(&transport);
        poller.add_file_listener(file.path(), raw, Subscriber(poller.clone()));

        assert_eq!(poller.poll_once().await, PollOutcome::NoChanges);
        assert_eq!(transport.requests().len(), 1);
    }
}
