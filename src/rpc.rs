//! RPC lifecycle surface for flows.
//!
//! Exposes, to authenticated RPC callers, the operations to start flows and
//! observe the node's state machines. Every start is permission-gated: the
//! caller must hold `StartFlow.<fully-qualified-class-name>` or the global
//! override, and the flow class must carry the startable-by-RPC marker in its
//! registration. Peer-initiated flows never pass through here and are not
//! permission-checked.
//!
//! All streams follow the `Feed { snapshot, updates }` shape; closing a stream
//! is the client's responsibility and never blocks flow execution.

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde_json::Value;
use thiserror::Error;

use crate::flows::{ProgressSnapshot, ProgressUpdate};
use crate::ledger::RecordedTransaction;
use crate::runtime::{
    Feed, FlowDescriptor, FlowHandle, FlowManager, ManagerError, StateMachineUpdate,
};
use crate::types::{InitiatorKind, RunId};

/// Permission string granting every RPC operation.
pub const PERMISSION_ALL: &str = "ALL";

/// The permission required to start `class` over RPC.
#[must_use]
pub fn start_flow_permission(class: &str) -> String {
    format!("StartFlow.{class}")
}

/// An authenticated RPC caller and the permissions attached to its account.
#[derive(Clone, Debug)]
pub struct RpcCaller {
    pub user: String,
    pub permissions: FxHashSet<String>,
}

impl RpcCaller {
    #[must_use]
    pub fn new<S: Into<String>>(user: impl Into<String>, permissions: impl IntoIterator<Item = S>) -> Self {
        Self {
            user: user.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn can_start(&self, class: &str) -> bool {
        self.permissions.contains(PERMISSION_ALL)
            || self.permissions.contains(&start_flow_permission(class))
    }
}

/// Errors surfaced to RPC clients.
#[derive(Debug, Error, Diagnostic)]
pub enum RpcError {
    #[error("user {user} lacks permission {permission}")]
    #[diagnostic(
        code(ledgerflow::rpc::permission),
        help("Grant the user `{permission}` or the global override.")
    )]
    PermissionDenied { user: String, permission: String },

    #[error("flow class {class} is not registered")]
    #[diagnostic(code(ledgerflow::rpc::unknown_flow))]
    UnknownFlow { class: String },

    #[error("flow class {class} is not startable by RPC")]
    #[diagnostic(
        code(ledgerflow::rpc::not_startable),
        help("Mark the registration startable_by_rpc to expose it to clients.")
    )]
    NotStartableByRpc { class: String },

    #[error(transparent)]
    #[diagnostic(code(ledgerflow::rpc::manager))]
    Manager(#[from] ManagerError),
}

/// Handle for a tracked start: the plain handle plus the progress feed.
#[derive(Debug)]
pub struct FlowProgressHandle {
    pub run_id: RunId,
    pub result: crate::runtime::ResultFuture,
    /// Declared steps and the step the flow is currently on.
    pub progress_snapshot: ProgressSnapshot,
    /// One update per step transition, starting from the current step.
    pub progress: flume::Receiver<ProgressUpdate>,
}

/// The flow-lifecycle operations exposed to RPC clients.
#[derive(Clone)]
pub struct FlowRpcOps {
    manager: FlowManager,
}

impl FlowRpcOps {
    #[must_use]
    pub fn new(manager: FlowManager) -> Self {
        Self { manager }
    }

    fn authorize(&self, caller: &RpcCaller, class: &str) -> Result<(), RpcError> {
        let Some((_, _, startable)) = self.manager.registry().lookup(class) else {
            return Err(RpcError::UnknownFlow {
                class: class.to_string(),
            });
        };
        if !startable {
            return Err(RpcError::NotStartableByRpc {
                class: class.to_string(),
            });
        }
        if !caller.can_start(class) {
            return Err(RpcError::PermissionDenied {
                user: caller.user.clone(),
                permission: start_flow_permission(class),
            });
        }
        Ok(())
    }

    /// Start a flow by class name, returning the run-id and result future.
    pub async fn start_flow(
        &self,
        caller: &RpcCaller,
        class: &str,
        args: Value,
    ) -> Result<FlowHandle, RpcError> {
        self.authorize(caller, class)?;
        let handle = self
            .manager
            .start_flow_by_name(
                class,
                args,
                InitiatorKind::Rpc {
                    user: caller.user.clone(),
                },
            )
            .await?;
        Ok(handle)
    }

    /// Start a flow with progress tracking: additionally returns the step
    /// snapshot and a live stream of progress-tracker steps.
    pub async fn start_tracked_flow(
        &self,
        caller: &RpcCaller,
        class: &str,
        args: Value,
    ) -> Result<FlowProgressHandle, RpcError> {
        self.authorize(caller, class)?;
        let flow = self.manager.registry().construct(class, args).map_err(ManagerError::from)?;
        let (handle, progress_snapshot, progress) = self
            .manager
            .start_tracked_flow(
                flow,
                InitiatorKind::Rpc {
                    user: caller.user.clone(),
                },
            )
            .await?;
        Ok(FlowProgressHandle {
            run_id: handle.run_id,
            result: handle.result,
            progress_snapshot,
            progress,
        })
    }

    /// Current state machines on the node.
    pub async fn state_machines(&self) -> Vec<FlowDescriptor> {
        self.manager.state_machines().await
    }

    /// Snapshot of live state machines plus the `Added`/`Removed` stream.
    pub async fn state_machines_feed(&self) -> Feed<Vec<FlowDescriptor>, StateMachineUpdate> {
        self.manager.state_machines_feed().await
    }

    /// Recorded flow → transaction associations plus their live stream.
    pub async fn state_machine_recorded_transaction_mapping_feed(
        &self,
    ) -> Feed<Vec<RecordedTransaction>, RecordedTransaction> {
        self.manager.transaction_mappings_feed().await
    }

    /// Class names of every flow registered on this node.
    pub fn registered_flows(&self) -> Vec<String> {
        self.manager.registered_flows()
    }
}
