//! Products that may subscribe to remote configuration.

use std::fmt;

/// Closed set of subsystems that can subscribe to configuration keys.
///
/// [`Product::Unknown`] is produced for any product name this client does not
/// recognise; it can never be subscribed to, so keys carrying it are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Product {
    LiveDebugging,
    LiveDebuggingSymbolDb,
    ApmTracing,
    AgentConfig,
    AgentTask,
    Asm,
    AsmDd,
    AsmData,
    AsmFeatures,
    Debug,
    Unknown,
}

impl Product {
    /// Every subscribable product, in declaration order.
    pub const ALL: [Product; 10] = [
        Product::LiveDebugging,
        Product::LiveDebuggingSymbolDb,
        Product::ApmTracing,
        Product::AgentConfig,
        Product::AgentTask,
        Product::Asm,
        Product::AsmDd,
        Product::AsmData,
        Product::AsmFeatures,
        Product::Debug,
    ];

    /// Wire name used in config keys and in the `products` request field.
    pub fn as_str(self) -> &'static str {
        match self {
            Product::LiveDebugging => "LIVE_DEBUGGING",
            Product::LiveDebuggingSymbolDb => "LIVE_DEBUGGING_SYMBOL_DB",
            Product::ApmTracing => "APM_TRACING",
            Product::AgentConfig => "AGENT_CONFIG",
            Product::AgentTask => "AGENT_TASK",
            Product::Asm => "ASM",
            Product::AsmDd => "ASM_DD",
            Product::AsmData => "ASM_DATA",
            Product::AsmFeatures => "ASM_FEATURES",
            Product::Debug => "DEBUG",
            Product::Unknown => "_UNKNOWN",
        }
    }

    /// Resolves a wire name (case-insensitively), yielding [`Product::Unknown`]
    /// for anything unrecognised.
    pub fn from_name(name: &str) -> Product {
        Product::ALL
            .into_iter()
            .find(|product| product.as_str().eq_ignore_ascii_case(name))
            .unwrap_or(Product::Unknown)
    }

    pub fn is_unknown(self) -> bool {
        self == Product::Unknown
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
