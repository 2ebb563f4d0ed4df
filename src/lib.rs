//! # ledgerflow: a checkpointed flow framework for ledger nodes
//!
//! ledgerflow runs multi-party business protocols ("flows") as long-lived
//! suspending computations: ordinary sequential programs that may send,
//! receive, and send-and-receive with counterparties, spawn sub-flows, throw
//! declared business exceptions across the wire, and survive process restarts
//! by round-tripping their in-flight call stack through durable storage.
//!
//! ## Core pieces
//!
//! - **Flow runtime** ([`runtime::FlowManager`]): starts, suspends, resumes,
//!   checkpoints, and terminates flows. Every suspension point commits a host
//!   transaction - checkpoint mutation, outbound messages, and inbound
//!   acknowledgement as one unit - before the flow slot is released.
//! - **Session protocol** ([`wire`], [`sessions`], [`runtime::protocol`]):
//!   the init/confirm/data/end handshake between two flows on two nodes, with
//!   version negotiation, per-session sequence deduplication, and error
//!   propagation that never leaks undeclared failures onto the wire.
//! - **Checkpoint store** ([`checkpoints`]): a durable keyed map of
//!   run-id → serialized continuation. Presence of a checkpoint is
//!   authoritative; deletion is the sole marker of flow completion.
//! - **RPC surface** ([`rpc::FlowRpcOps`]): permission-checked starts with
//!   result futures, progress feeds, and state-machine update feeds.
//!
//! ## Writing a flow
//!
//! A flow is a serde-serializable struct whose fields are its locals, driven
//! through an explicit resume step:
//!
//! ```
//! use ledgerflow::flows::{
//!     Flow, FlowContext, FlowError, FlowResume, FlowYield, save_state,
//! };
//! use ledgerflow::types::Party;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct GreetingFlow {
//!     counterparty: Party,
//!     state: GreetingState,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! enum GreetingState {
//!     Fresh,
//!     AwaitingReply,
//! }
//!
//! impl Flow for GreetingFlow {
//!     fn class_name(&self) -> &'static str {
//!         "com.example.GreetingFlow"
//!     }
//!
//!     fn resume(
//!         &mut self,
//!         _ctx: &mut FlowContext<'_>,
//!         input: FlowResume,
//!     ) -> Result<FlowYield, FlowError> {
//!         match self.state {
//!             GreetingState::Fresh => {
//!                 self.state = GreetingState::AwaitingReply;
//!                 Ok(FlowYield::send_and_receive(
//!                     self.counterparty.clone(),
//!                     "hello",
//!                     "String",
//!                 ))
//!             }
//!             GreetingState::AwaitingReply => {
//!                 let reply: String = input.payload("String")?;
//!                 Ok(FlowYield::finished(reply))
//!             }
//!         }
//!     }
//!
//!     fn save(&self) -> Result<serde_json::Value, FlowError> {
//!         save_state(self)
//!     }
//! }
//! ```
//!
//! The struct is the continuation: at every suspension the runtime serializes
//! it (plus the session table and unacknowledged outbox) into the checkpoint
//! store, and a restarted node resurrects it byte-for-byte before accepting
//! inbound traffic.
//!
//! ## Module guide
//!
//! - [`flows`] - the `Flow` trait, suspension vocabulary, registry, progress
//! - [`runtime`] - manager, machine, protocol engine, lifecycle feeds
//! - [`sessions`] - session records and per-flow session tables
//! - [`checkpoints`] - store trait, persistence models, backends
//! - [`wire`] - session message union and envelope codec
//! - [`transport`] - message bus contract and the in-memory network
//! - [`rpc`] - permission-gated client surface
//! - [`config`] - node configuration
//! - [`telemetry`] - tracing subscriber installation

pub mod checkpoints;
pub mod config;
pub mod flows;
pub mod ledger;
pub mod rpc;
pub mod runtime;
pub mod sessions;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod utils;
pub mod wire;
