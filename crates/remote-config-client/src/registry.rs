//! Product registry and per-product change detection.
//!
//! Each subscribed [`Product`] owns a [`ProductState`]: its listeners, the
//! cache of file descriptors it successfully applied, and the config states it
//! reported for the last cycle. [`ProductState::apply`] diffs the keys the
//! server declared for the product against that cache and dispatches only new,
//! changed and removed configurations.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use remote_config_wire::{ApplyState, ConfigState, TargetFileHash, TargetFileMeta};
use tracing::{debug, error, warn};

use crate::config_key::ConfigKey;
use crate::envelope::ResponseEnvelope;
use crate::listener::{PollingRateHinter, ProductListener, ReportableError};
use crate::product::Product;
use crate::targets::TargetDescriptor;
use crate::util::compute_sha256;

/// Client-side memory of the last successfully applied descriptor of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub key: ConfigKey,
    pub version: u64,
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

impl CachedFile {
    fn from_descriptor(key: &ConfigKey, target: &TargetDescriptor) -> Self {
        Self {
            key: key.clone(),
            version: target.version(),
            length: target.length,
            hashes: target.hashes.clone(),
        }
    }

    /// Wire form sent in `cached_target_files`.
    pub fn to_meta(&self) -> TargetFileMeta {
        TargetFileMeta {
            path: self.key.path().to_string(),
            length: self.length,
            hashes: self
                .hashes
                .iter()
                .map(|(algorithm, hash)| TargetFileHash {
                    algorithm: algorithm.clone(),
                    hash: hash.clone(),
                })
                .collect(),
        }
    }
}

/// Result of applying one product for one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Whether any key was new, changed or removed.
    pub changed: bool,
    pub applied: usize,
    pub removed: usize,
    /// Per-key error messages in processing order.
    pub errors: Vec<String>,
}

/// Listeners, cache and last reported states of one product.
pub struct ProductState {
    product: Product,
    listeners: Vec<Box<dyn ProductListener>>,
    keyed_listeners: HashMap<String, Box<dyn ProductListener>>,
    cached: BTreeMap<String, CachedFile>,
    config_states: Vec<ConfigState>,
}

impl std::fmt::Debug for ProductState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductState")
            .field("product", &self.product)
            .field("listeners", &self.listeners.len())
            .field("keyed_listeners", &self.keyed_listeners.len())
            .field("cached", &self.cached.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProductState {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            listeners: Vec::new(),
            keyed_listeners: HashMap::new(),
            cached: BTreeMap::new(),
            config_states: Vec::new(),
        }
    }

    pub fn product(&self) -> Product {
        self.product
    }

    pub fn add_listener(&mut self, listener: Box<dyn ProductListener>) {
        self.listeners.push(listener);
    }

    /// Registers a listener receiving only the configuration with `config_id`;
    /// it takes precedence over product-wide listeners for that key.
    pub fn add_keyed_listener(&mut self, config_id: &str, listener: Box<dyn ProductListener>) {
        self.keyed_listeners.insert(config_id.to_string(), listener);
    }

    pub fn cached_files(&self) -> impl Iterator<Item = &CachedFile> {
        self.cached.values()
    }

    /// States reported for the keys inspected during the last applied cycle.
    pub fn config_states(&self) -> &[ConfigState] {
        &self.config_states
    }

    /// Diffs `relevant_keys` against the cache and notifies listeners.
    ///
    /// Keys are processed in the given order. A key whose descriptor is
    /// unchanged is skipped; a failing key is reported and left uncached so the
    /// next cycle retries it; cached keys missing from `relevant_keys` (or from
    /// the signed targets) get exactly one removal notification and are evicted.
    /// A failed removal is reported once as an errored state for that key.
    pub fn apply(
        &mut self,
        envelope: &ResponseEnvelope,
        relevant_keys: &[ConfigKey],
        hinter: &mut dyn PollingRateHinter,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut states = Vec::with_capacity(relevant_keys.len());
        let mut inspected: HashSet<&str> = HashSet::with_capacity(relevant_keys.len());

        for key in relevant_keys {
            let Some(target) = envelope.get_target(key.path()) else {
                let message = format!(
                    "Told to handle config key {}, but it is not declared in targets.signed",
                    key.path()
                );
                states.push(error_state(key, 0, &message));
                outcome.errors.push(message);
                continue;
            };
            inspected.insert(key.path());

            let unchanged = self
                .cached
                .get(key.path())
                .is_some_and(|cached| target.same_content(cached.length, &cached.hashes));
            if unchanged {
                states.push(config_state(key, target.version(), ApplyState::Acknowledged, None));
                continue;
            }

            outcome.changed = true;
            match self.apply_target(envelope, key, target, hinter) {
                Ok(()) => {
                    debug!(key = %key, version = target.version(), "remote-config: applied configuration");
                    self.cached
                        .insert(key.path().to_string(), CachedFile::from_descriptor(key, target));
                    states.push(config_state(key, target.version(), ApplyState::Acknowledged, None));
                    outcome.applied += 1;
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "remote-config: failed to apply configuration");
                    states.push(error_state(key, target.version(), err.message()));
                    outcome.errors.push(err.message().to_string());
                }
            }
        }

        let removed: Vec<CachedFile> = {
            let stale: Vec<String> = self
                .cached
                .keys()
                .filter(|path| !inspected.contains(path.as_str()))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|path| self.cached.remove(&path))
                .collect()
        };
        for cached in removed {
            outcome.changed = true;
            outcome.removed += 1;
            debug!(key = %cached.key, "remote-config: removing configuration");
            if let Err(err) = self.dispatch(&cached.key, None, hinter) {
                warn!(key = %cached.key, error = %err, "remote-config: listener failed to remove configuration");
                states.push(error_state(&cached.key, cached.version, err.message()));
                outcome.errors.push(err.message().to_string());
            }
        }

        if outcome.changed {
            self.commit(hinter);
        }
        self.config_states = states;
        outcome
    }

    fn apply_target(
        &mut self,
        envelope: &ResponseEnvelope,
        key: &ConfigKey,
        target: &TargetDescriptor,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError> {
        let content = envelope
            .file_contents(key.path())
            .ok_or_else(|| ReportableError::new(format!("No content for {}", key.path())))?;
        check_content(key, target, content)?;
        self.dispatch(key, Some(content), hinter)
    }

    /// Sends `content` to the listener scoped to the key's config id, or to
    /// every product-wide listener when none is scoped. A failing listener
    /// does not stop the others; the first error is returned.
    fn dispatch(
        &mut self,
        key: &ConfigKey,
        content: Option<&[u8]>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError> {
        if let Some(listener) = self.keyed_listeners.get_mut(key.config_id()) {
            return invoke(key, || listener.accept(key, content, hinter));
        }
        let mut first_error = None;
        for listener in &mut self.listeners {
            if let Err(err) = invoke(key, || listener.accept(key, content, &mut *hinter)) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn commit(&mut self, hinter: &mut dyn PollingRateHinter) {
        let product = self.product;
        for listener in self
            .listeners
            .iter_mut()
            .chain(self.keyed_listeners.values_mut())
        {
            let result = catch_unwind(AssertUnwindSafe(|| listener.commit(&mut *hinter)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(product = %product, error = %err, "remote-config: listener commit failed");
                }
                Err(payload) => {
                    error!(
                        product = %product,
                        panic = %panic_message(payload.as_ref()),
                        "remote-config: listener panicked during commit"
                    );
                }
            }
        }
    }
}

/// Runs one listener call, turning a panic into a reportable error.
fn invoke<F>(key: &ConfigKey, call: F) -> Result<(), ReportableError>
where
    F: FnOnce() -> Result<(), ReportableError>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = panic_message(payload.as_ref());
            error!(key = %key, panic = %detail, "remote-config: listener panicked while applying configuration");
            Err(ReportableError::new(format!(
                "Unexpected error applying {}: {detail}",
                key.path()
            )))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn check_content(
    key: &ConfigKey,
    target: &TargetDescriptor,
    content: &[u8],
) -> Result<(), ReportableError> {
    if content.len() as u64 != target.length {
        return Err(ReportableError::new(format!(
            "Content of {} has length {}, but {} was declared",
            key.path(),
            content.len(),
            target.length
        )));
    }
    if let Some(expected) = target.hashes.get("sha256") {
        if !compute_sha256(content).eq_ignore_ascii_case(expected) {
            return Err(ReportableError::new(format!(
                "Content of {} does not match its declared sha256 hash",
                key.path()
            )));
        }
    }
    Ok(())
}

fn config_state(
    key: &ConfigKey,
    version: u64,
    apply_state: ApplyState,
    apply_error: Option<String>,
) -> ConfigState {
    ConfigState {
        id: key.config_id().to_string(),
        version,
        product: key.product_name().to_string(),
        apply_state,
        apply_error,
    }
}

fn error_state(key: &ConfigKey, version: u64, message: &str) -> ConfigState {
    config_state(key, version, ApplyState::Error, Some(message.to_string()))
}

/// Every subscribed product, in registration order.
#[derive(Debug, Default)]
pub struct ProductRegistry {
    products: Vec<ProductState>,
}

impl ProductRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_entry(&mut self, product: Product) -> Option<&mut ProductState> {
        if product.is_unknown() {
            warn!("remote-config: ignoring listener registered for an unknown product");
            return None;
        }
        let idx = match self.products.iter().position(|state| state.product == product) {
            Some(idx) => idx,
            None => {
                self.products.push(ProductState::new(product));
                self.products.len() - 1
            }
        };
        self.products.get_mut(idx)
    }

    pub fn add_listener(&mut self, product: Product, listener: Box<dyn ProductListener>) {
        if let Some(state) = self.state_entry(product) {
            state.add_listener(listener);
        }
    }

    pub fn add_keyed_listener(
        &mut self,
        product: Product,
        config_id: &str,
        listener: Box<dyn ProductListener>,
    ) {
        if let Some(state) = self.state_entry(product) {
            state.add_keyed_listener(config_id, listener);
        }
    }

    /// Drops a product with its listeners and cache. Returns whether it existed.
    pub fn remove_listeners(&mut self, product: Product) -> bool {
        let before = self.products.len();
        self.products.retain(|state| state.product != product);
        before != self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn is_subscribed(&self, product: Product) -> bool {
        self.products.iter().any(|state| state.product == product)
    }

    pub fn get(&self, product: Product) -> Option<&ProductState> {
        self.products.iter().find(|state| state.product == product)
    }

    pub fn product_names(&self) -> Vec<String> {
        self.products
            .iter()
            .map(|state| state.product.as_str().to_string())
            .collect()
    }

    pub fn cached_target_files(&self) -> Vec<TargetFileMeta> {
        self.products
            .iter()
            .flat_map(ProductState::cached_files)
            .map(CachedFile::to_meta)
            .collect()
    }

    pub fn config_states(&self) -> Vec<ConfigState> {
        self.products
            .iter()
            .flat_map(|state| state.config_states().iter().cloned())
            .collect()
    }

    /// Applies every subscribed product; products without keys this cycle
    /// still run so their stale cache entries are removed.
    pub fn apply(
        &mut self,
        envelope: &ResponseEnvelope,
        keys_by_product: &HashMap<Product, Vec<ConfigKey>>,
        hinter: &mut dyn PollingRateHinter,
    ) -> ApplyOutcome {
        let mut total = ApplyOutcome::default();
        for state in &mut self.products {
            let keys = keys_by_product
                .get(&state.product)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let outcome = state.apply(envelope, keys, &mut *hinter);
            total.changed |= outcome.changed;
            total.applied += outcome.applied;
            total.removed += outcome.removed;
            total.errors.extend(outcome.errors);
        }
        total
    }
}
