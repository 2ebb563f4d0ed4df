//! Process-wide registry of flow classes.
//!
//! The registry maps flow class names to construction, restore, and responder
//! factories, each registration carrying a protocol version. Its lifecycle is
//! init-at-startup, frozen thereafter: the node registers everything before
//! traffic is admitted and then calls [`FlowRegistry::freeze`]. Dynamic
//! additions after the freeze are limited to test harnesses, through the
//! explicitly gated [`FlowRegistry::unfreeze_for_testing`].

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::{Flow, FlowError};
use crate::types::Party;

/// Builds an initiator flow from RPC/shell argument tuples.
pub type ConstructFn = Arc<dyn Fn(Value) -> Result<Box<dyn Flow>, FlowError> + Send + Sync>;
/// Builds a responder flow for a counterparty's `SessionInit`.
pub type ResponderFn = Arc<dyn Fn(Party) -> Box<dyn Flow> + Send + Sync>;
/// Rebuilds a flow from its checkpointed state.
pub type RestoreFn = Arc<dyn Fn(Value) -> Result<Box<dyn Flow>, FlowError> + Send + Sync>;

/// Errors from registry mutation and lookup.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("flow registry is frozen; registrations are only accepted at startup")]
    #[diagnostic(
        code(ledgerflow::registry::frozen),
        help("Register all flows before the node admits traffic; tests may use unfreeze_for_testing().")
    )]
    Frozen,

    #[error("flow class already registered: {class}")]
    #[diagnostic(code(ledgerflow::registry::duplicate_class))]
    DuplicateClass { class: String },

    #[error("a responder is already registered for initiating flow {initiating_class}")]
    #[diagnostic(code(ledgerflow::registry::duplicate_responder))]
    DuplicateResponder { initiating_class: String },

    #[error(
        "flow {responder_class} is marked initiating and cannot be attached as a responder to {initiating_class}"
    )]
    #[diagnostic(
        code(ledgerflow::registry::initiating_responder),
        help("An initiating flow cannot customize another initiating base; register it standalone.")
    )]
    InitiatingResponder {
        responder_class: String,
        initiating_class: String,
    },

    #[error("unknown flow class: {class}")]
    #[diagnostic(code(ledgerflow::registry::unknown_class))]
    UnknownClass { class: String },

    #[error("flow class {class} has no RPC constructor")]
    #[diagnostic(code(ledgerflow::registry::no_constructor))]
    NoConstructor { class: String },

    #[error("constructing flow {class} failed: {detail}")]
    #[diagnostic(code(ledgerflow::registry::construct))]
    ConstructFailed { class: String, detail: String },

    #[error("restoring flow {class} from checkpoint failed: {detail}")]
    #[diagnostic(
        code(ledgerflow::registry::restore),
        help("The checkpointed state no longer matches the registered flow type.")
    )]
    RestoreFailed { class: String, detail: String },
}

/// A flow class registration: restore glue plus lifecycle markers.
#[derive(Clone)]
pub struct FlowRegistration {
    pub class_name: String,
    pub version: u32,
    /// Whether this class opens sessions towards peers (and therefore may not
    /// be attached as a responder customization of another initiating class).
    pub initiating: bool,
    /// Machine-readable marker required for `startFlow` over RPC.
    pub startable_by_rpc: bool,
    pub construct: Option<ConstructFn>,
    pub restore: RestoreFn,
}

impl FlowRegistration {
    /// Register a flow type, deriving the restore function from its serde
    /// implementation.
    #[must_use]
    pub fn of<F>(class_name: impl Into<String>, version: u32) -> Self
    where
        F: Flow + Serialize + DeserializeOwned,
    {
        Self {
            class_name: class_name.into(),
            version,
            initiating: false,
            startable_by_rpc: false,
            construct: None,
            restore: Arc::new(|state| {
                let flow: F = serde_json::from_value(state).map_err(|e| FlowError::State {
                    detail: e.to_string(),
                })?;
                Ok(Box::new(flow) as Box<dyn Flow>)
            }),
        }
    }

    #[must_use]
    pub fn initiating(mut self) -> Self {
        self.initiating = true;
        self
    }

    #[must_use]
    pub fn startable_by_rpc(mut self) -> Self {
        self.startable_by_rpc = true;
        self
    }

    /// Attach an RPC/shell constructor taking the start-argument tuple.
    #[must_use]
    pub fn with_constructor(
        mut self,
        construct: impl Fn(Value) -> Result<Box<dyn Flow>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        self.construct = Some(Arc::new(construct));
        self
    }
}

struct ResponderRegistration {
    responder_class: String,
    version: u32,
    factory: ResponderFn,
}

/// Resolved responder lookup for an inbound `SessionInit`.
#[derive(Clone)]
pub struct ResponderEntry {
    pub responder_class: String,
    /// The version this node speaks for the initiating protocol.
    pub version: u32,
    pub factory: ResponderFn,
}

#[derive(Default)]
struct RegistryInner {
    flows: FxHashMap<String, FlowRegistration>,
    responders: FxHashMap<String, ResponderRegistration>,
    frozen: bool,
}

/// The process-wide flow class registry.
#[derive(Default)]
pub struct FlowRegistry {
    inner: RwLock<RegistryInner>,
}

impl FlowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow class. Fails once the registry is frozen.
    pub fn register(&self, registration: FlowRegistration) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.frozen {
            return Err(RegistryError::Frozen);
        }
        let class = registration.class_name.clone();
        if inner.flows.contains_key(&class) {
            return Err(RegistryError::DuplicateClass { class });
        }
        inner.flows.insert(class, registration);
        Ok(())
    }

    /// Attach a responder factory to an initiating flow class.
    ///
    /// The responder class must itself be registered (its restore function is
    /// needed for resurrection) and must not be marked initiating.
    pub fn register_responder(
        &self,
        initiating_class: impl Into<String>,
        responder_class: impl Into<String>,
        version: u32,
        factory: impl Fn(Party) -> Box<dyn Flow> + Send + Sync + 'static,
    ) -> Result<(), RegistryError> {
        let initiating_class = initiating_class.into();
        let responder_class = responder_class.into();
        let mut inner = self.inner.write();
        if inner.frozen {
            return Err(RegistryError::Frozen);
        }
        let responder_reg =
            inner
                .flows
                .get(&responder_class)
                .ok_or_else(|| RegistryError::UnknownClass {
                    class: responder_class.clone(),
                })?;
        if responder_reg.initiating {
            return Err(RegistryError::InitiatingResponder {
                responder_class,
                initiating_class,
            });
        }
        if inner.responders.contains_key(&initiating_class) {
            return Err(RegistryError::DuplicateResponder { initiating_class });
        }
        inner.responders.insert(
            initiating_class,
            ResponderRegistration {
                responder_class,
                version,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// Seal the registry. Called once at node startup, after which lookups are
    /// lock-cheap and registrations fail.
    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    /// Reopen a frozen registry. Test harnesses only.
    pub fn unfreeze_for_testing(&self) {
        self.inner.write().frozen = false;
    }

    /// Build an initiator flow from its start arguments.
    pub fn construct(&self, class: &str, args: Value) -> Result<Box<dyn Flow>, RegistryError> {
        let inner = self.inner.read();
        let reg = inner
            .flows
            .get(class)
            .ok_or_else(|| RegistryError::UnknownClass {
                class: class.to_string(),
            })?;
        let construct = reg.construct.as_ref().ok_or_else(|| {
            RegistryError::NoConstructor {
                class: class.to_string(),
            }
        })?;
        construct(args).map_err(|e| RegistryError::ConstructFailed {
            class: class.to_string(),
            detail: e.to_string(),
        })
    }

    /// Rebuild a flow from checkpointed state.
    pub fn restore(&self, class: &str, state: Value) -> Result<Box<dyn Flow>, RegistryError> {
        let restore = {
            let inner = self.inner.read();
            let reg = inner
                .flows
                .get(class)
                .ok_or_else(|| RegistryError::UnknownClass {
                    class: class.to_string(),
                })?;
            Arc::clone(&reg.restore)
        };
        restore(state).map_err(|e| RegistryError::RestoreFailed {
            class: class.to_string(),
            detail: e.to_string(),
        })
    }

    /// Resolve the responder for an inbound `SessionInit` naming `class`.
    #[must_use]
    pub fn responder(&self, initiating_class: &str) -> Option<ResponderEntry> {
        let inner = self.inner.read();
        inner
            .responders
            .get(initiating_class)
            .map(|r| ResponderEntry {
                responder_class: r.responder_class.clone(),
                version: r.version,
                factory: Arc::clone(&r.factory),
            })
    }

    /// Registration metadata for a class, if known.
    #[must_use]
    pub fn lookup(&self, class: &str) -> Option<(u32, bool, bool)> {
        let inner = self.inner.read();
        inner
            .flows
            .get(class)
            .map(|r| (r.version, r.initiating, r.startable_by_rpc))
    }

    /// The version this node would offer when initiating `class`.
    #[must_use]
    pub fn version_of(&self, class: &str) -> Option<u32> {
        self.lookup(class).map(|(v, _, _)| v)
    }

    /// Sorted class names of every registered flow.
    #[must_use]
    pub fn registered_flow_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.flows.keys().cloned().collect();
        names.sort();
        names
    }
}
