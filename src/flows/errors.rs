//! Flow error model.
//!
//! Three kinds of failure cross this module, mirroring how they travel:
//!
//! 1. **Business exceptions** ([`BusinessError`]) are declared wire-safe.
//!    Thrown inside a flow they serialize into `ErrorSessionEnd` for every
//!    open session; the receiving flow re-raises a peer-typed copy
//!    ([`FlowError::Peer`]) with no stack trace attached.
//! 2. **Protocol errors** surface at the offended flow as
//!    [`FlowError::UnexpectedFlowEnd`]; the other side only ever sees a bare
//!    `ErrorSessionEnd` or a `SessionReject`. Never fatal to the node.
//! 3. **Fatal runtime errors** terminate the flow with the error as its
//!    terminal result; peers receive a bare `ErrorSessionEnd`.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An exception kind explicitly marked as safe to transmit across a session.
///
/// Only the class name and message travel; stack traces are stripped before
/// transmission and the receiver re-raises its own copy, so nothing about the
/// thrower's internals leaks onto the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{class}: {message}")]
pub struct BusinessError {
    /// Fully-qualified class name of the declared exception.
    pub class: String,
    /// Human-readable message, as thrown.
    pub message: String,
}

impl BusinessError {
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

/// Terminal and in-flight errors raised by flows and the runtime around them.
#[derive(Clone, Debug, PartialEq, Error, Diagnostic)]
pub enum FlowError {
    /// A declared business exception thrown by this flow.
    #[error(transparent)]
    #[diagnostic(code(ledgerflow::flow::business))]
    Business(#[from] BusinessError),

    /// A declared business exception received from the counterparty, re-raised
    /// locally as a peer-typed copy.
    #[error("counterparty raised {0}")]
    #[diagnostic(code(ledgerflow::flow::peer))]
    Peer(BusinessError),

    /// The counterparty's flow ended, rejected the session, or failed with an
    /// undeclared exception while this flow was still expecting data.
    #[error("counterparty flow ended unexpectedly while expecting {expected}: {reason}")]
    #[diagnostic(
        code(ledgerflow::flow::unexpected_end),
        help("The peer finished, errored, or rejected the session before sending the expected value.")
    )]
    UnexpectedFlowEnd { expected: String, reason: String },

    /// A received payload did not deserialize into the expected type.
    #[error("payload did not decode as {expected}: {detail}")]
    #[diagnostic(code(ledgerflow::flow::payload))]
    Payload { expected: String, detail: String },

    /// The flow was externally terminated at a suspension point.
    #[error("flow aborted: {reason}")]
    #[diagnostic(code(ledgerflow::flow::aborted))]
    Aborted { reason: String },

    /// The flow's state could not be serialized for checkpointing.
    #[error("flow state could not be serialized: {detail}")]
    #[diagnostic(
        code(ledgerflow::flow::state),
        help("Flow locals must remain serde-serializable at every suspension point.")
    )]
    State { detail: String },

    /// An undeclared error from flow logic. Terminal for the flow; masked to a
    /// bare `ErrorSessionEnd` on the wire.
    #[error("{message}")]
    #[diagnostic(code(ledgerflow::flow::fatal))]
    Fatal { message: String },
}

impl FlowError {
    /// Convenience constructor for undeclared flow failures.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// The business payload to put on the wire, if this error is declared.
    ///
    /// Everything else answers `None`, which the protocol engine turns into a
    /// bare `ErrorSessionEnd`.
    #[must_use]
    pub fn business(&self) -> Option<&BusinessError> {
        match self {
            Self::Business(b) | Self::Peer(b) => Some(b),
            _ => None,
        }
    }
}
