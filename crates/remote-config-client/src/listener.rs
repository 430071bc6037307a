//! Consumer-facing listener interfaces.
//!
//! Consumers register a [`ProductListener`] per product (optionally scoped to
//! one config id). Listeners receive each changed configuration as one
//! complete byte blob, or `None` when the configuration was withdrawn, and may
//! suggest a polling interval through the supplied [`PollingRateHinter`].

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use thiserror::Error;

use crate::config_key::ConfigKey;

/// A failure a listener wants reported back to the control plane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ReportableError {
    message: String,
}

impl ReportableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ReportableError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ReportableError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Sink for polling interval suggestions.
pub trait PollingRateHinter {
    fn suggest_polling_rate(&mut self, interval: Duration);
}

/// Collects hints for one cycle; the smallest suggestion wins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateHintAggregator {
    hint: Option<Duration>,
}

impl RateHintAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hint(&self) -> Option<Duration> {
        self.hint
    }
}

impl PollingRateHinter for RateHintAggregator {
    fn suggest_polling_rate(&mut self, interval: Duration) {
        self.hint = Some(match self.hint {
            Some(current) => current.min(interval),
            None => interval,
        });
    }
}

/// Discards every hint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHinter;

impl PollingRateHinter for NoopHinter {
    fn suggest_polling_rate(&mut self, _interval: Duration) {}
}

/// Receives the configurations of one product.
pub trait ProductListener: Send {
    /// Applies `content` for `key`; `None` means the configuration was removed.
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: Option<&[u8]>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError>;

    /// Called once after a cycle in which this listener's product changed.
    fn commit(&mut self, _hinter: &mut dyn PollingRateHinter) -> Result<(), ReportableError> {
        Ok(())
    }
}

/// Path-keyed listener, used for file sources and as the building block of
/// typed listeners.
pub trait ConfigurationChangesListener: Send {
    fn accept(
        &mut self,
        config_key: &str,
        content: Option<&[u8]>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError>;
}

/// Turns raw configuration bytes into a typed value.
pub trait ConfigurationDeserializer<T>: Send {
    /// Returns `Ok(None)` when the bytes hold no configuration.
    fn deserialize(&self, content: &[u8]) -> Result<Option<T>, ReportableError>;
}

impl<T, F> ConfigurationDeserializer<T> for F
where
    F: Fn(&[u8]) -> Result<Option<T>, ReportableError> + Send,
{
    fn deserialize(&self, content: &[u8]) -> Result<Option<T>, ReportableError> {
        self(content)
    }
}

/// Receives deserialized configurations; `None` means removed.
pub trait TypedListener<T>: Send {
    fn accept(
        &mut self,
        config_key: &str,
        config: Option<T>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError>;
}

/// Called after every cycle that changed at least one product.
pub trait ConfigurationEndListener: Send {
    fn on_configuration_end(&mut self) -> Result<(), ReportableError>;
}

/// Adapts a closure into a [`ProductListener`].
pub fn from_fn<F>(f: F) -> FnListener<F>
where
    F: FnMut(&ConfigKey, Option<&[u8]>, &mut dyn PollingRateHinter) -> Result<(), ReportableError>
        + Send,
{
    FnListener(f)
}

pub struct FnListener<F>(F);

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnListener")
    }
}

impl<F> ProductListener for FnListener<F>
where
    F: FnMut(&ConfigKey, Option<&[u8]>, &mut dyn PollingRateHinter) -> Result<(), ReportableError>
        + Send,
{
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: Option<&[u8]>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError> {
        (self.0)(key, content, hinter)
    }
}

/// Exposes a [`ConfigurationChangesListener`] as a [`ProductListener`], keyed
/// by the full config path.
#[derive(Debug)]
pub struct SimpleProductListener<L> {
    inner: L,
}

impl<L> SimpleProductListener<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

impl<L: ConfigurationChangesListener> ProductListener for SimpleProductListener<L> {
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: Option<&[u8]>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError> {
        self.inner.accept(key.path(), content, hinter)
    }
}

/// Runs a deserializer before handing the typed value to a [`TypedListener`].
pub struct Deserializing<T, D, L> {
    deserializer: D,
    listener: L,
    _config: PhantomData<fn() -> T>,
}

impl<T, D, L> Deserializing<T, D, L>
where
    D: ConfigurationDeserializer<T>,
    L: TypedListener<T>,
{
    pub fn new(deserializer: D, listener: L) -> Self {
        Self {
            deserializer,
            listener,
            _config: PhantomData,
        }
    }
}

impl<T, D, L> fmt::Debug for Deserializing<T, D, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deserializing")
    }
}

impl<T, D, L> ConfigurationChangesListener for Deserializing<T, D, L>
where
    D: ConfigurationDeserializer<T>,
    L: TypedListener<T>,
{
    fn accept(
        &mut self,
        config_key: &str,
        content: Option<&[u8]>,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ReportableError> {
        let config = match content {
            None => None,
            Some(bytes) => {
                let config = self.deserializer.deserialize(bytes)?;
                if config.is_none() && !bytes.is_empty() {
                    return Err(ReportableError::new(format!(
                        "Deserializer returned no configuration for {config_key}"
                    )));
                }
                config
            }
        };
        self.listener.accept(config_key, config, hinter)
    }
}

/// Convenience constructor for a typed product listener.
pub fn typed<T, D, L>(deserializer: D, listener: L) -> SimpleProductListener<Deserializing<T, D, L>>
where
    D: ConfigurationDeserializer<T>,
    L: TypedListener<T>,
{
    SimpleProductListener::new(Deserializing::new(deserializer, listener))
}
