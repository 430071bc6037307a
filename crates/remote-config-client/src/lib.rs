//! Tracer-side Datadog Remote Configuration client.
//!
//! A [`ConfigurationPoller`] periodically asks the agent which configurations
//! apply to the subscribed products, verifies the signed targets metadata and
//! hands each new, changed or withdrawn configuration to the listener
//! registered for its product. The crate root re-exports what an embedder
//! needs without digging into the module layout.

pub mod canonical;
pub mod client_state;
pub mod config;
pub mod config_key;
pub mod envelope;
pub mod listener;
pub mod poller;
pub mod product;
pub mod ratelimit;
pub mod registry;
pub mod request;
pub mod targets;
pub mod telemetry;
pub mod transport;
pub mod verify;

mod util;

#[cfg(test)]
mod test_support;

pub use canonical::{canonicalize, CanonicalError};
pub use client_state::NextClientState;
pub use config::PollerConfig;
pub use config_key::{ConfigKey, ConfigKeyError};
pub use envelope::{EnvelopeError, ResponseEnvelope};
pub use listener::{
    from_fn, typed, ConfigurationChangesListener, ConfigurationDeserializer,
    ConfigurationEndListener, NoopHinter, PollingRateHinter, ProductListener, RateHintAggregator,
    ReportableError, SimpleProductListener, TypedListener,
};
pub use poller::{ConfigurationPoller, EndListenerId, PollOutcome, PollerError};
pub use product::Product;
pub use request::{encode_capabilities, EndpointProvider, PollRequest, RequestFactory, StaticEndpoint};
pub use telemetry::{
    CountingTelemetry, NoopTelemetry, PollerTelemetry, TelemetryCounters, TelemetrySnapshot,
};
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};
pub use verify::{IntegrityError, IntegrityVerifier, PublicKeyError};
