//! Fixture flows exercised by the integration suites.
//!
//! Each flow is a serde struct with an explicit state enum; `save` delegates
//! to `save_state` and restore goes through `FlowRegistration::of`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use ledgerflow::flows::{
    BusinessError, Flow, FlowContext, FlowError, FlowResume, FlowYield, save_state,
};
use ledgerflow::types::{Party, TxId};

/// Initiator for the ping-pong scenario: sends 10 expecting 20, then 11
/// expecting 21, and finishes with both received values.
#[derive(Serialize, Deserialize)]
pub struct PingPongFlow {
    pub counterparty: Party,
    pub first: Option<i64>,
    pub state: PingPongState,
}

#[derive(Serialize, Deserialize)]
pub enum PingPongState {
    New,
    AwaitFirst,
    AwaitSecond,
}

impl PingPongFlow {
    pub const CLASS: &'static str = "test.PingPongFlow";

    pub fn new(counterparty: Party) -> Self {
        Self {
            counterparty,
            first: None,
            state: PingPongState::New,
        }
    }
}

impl Flow for PingPongFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            PingPongState::New => {
                self.state = PingPongState::AwaitFirst;
                Ok(FlowYield::send_and_receive(
                    self.counterparty.clone(),
                    10,
                    "i64",
                ))
            }
            PingPongState::AwaitFirst => {
                self.first = Some(input.payload("i64")?);
                self.state = PingPongState::AwaitSecond;
                Ok(FlowYield::send_and_receive(
                    self.counterparty.clone(),
                    11,
                    "i64",
                ))
            }
            PingPongState::AwaitSecond => {
                let second: i64 = input.payload("i64")?;
                Ok(FlowYield::finished(json!({
                    "received": self.first,
                    "received2": second,
                })))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Responder for the ping-pong scenario: receives 10, sends 20, receives 11,
/// sends 21.
#[derive(Serialize, Deserialize)]
pub struct PongFlow {
    pub peer: Party,
    pub state: PongState,
}

#[derive(Serialize, Deserialize)]
pub enum PongState {
    New,
    AwaitTen,
    SendingTwenty,
    AwaitEleven,
    SendingTwentyOne,
}

impl PongFlow {
    pub const CLASS: &'static str = "test.PongFlow";

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self {
            peer,
            state: PongState::New,
        })
    }
}

impl Flow for PongFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            PongState::New => {
                self.state = PongState::AwaitTen;
                Ok(FlowYield::receive(self.peer.clone(), "i64"))
            }
            PongState::AwaitTen => {
                let ten: i64 = input.payload("i64")?;
                if ten != 10 {
                    return Err(FlowError::fatal(format!("expected 10, got {ten}")));
                }
                self.state = PongState::SendingTwenty;
                Ok(FlowYield::send(self.peer.clone(), 20))
            }
            PongState::SendingTwenty => {
                input.sent()?;
                self.state = PongState::AwaitEleven;
                Ok(FlowYield::receive(self.peer.clone(), "i64"))
            }
            PongState::AwaitEleven => {
                let eleven: i64 = input.payload("i64")?;
                if eleven != 11 {
                    return Err(FlowError::fatal(format!("expected 11, got {eleven}")));
                }
                self.state = PongState::SendingTwentyOne;
                Ok(FlowYield::send(self.peer.clone(), 21))
            }
            PongState::SendingTwentyOne => {
                input.sent()?;
                Ok(FlowYield::finished(()))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Sends one string and waits for the echoed acknowledgement.
#[derive(Serialize, Deserialize)]
pub struct SendAndAwaitAckFlow {
    pub counterparty: Party,
    pub message: String,
    pub state: SendAckState,
}

#[derive(Serialize, Deserialize)]
pub enum SendAckState {
    New,
    AwaitAck,
}

impl SendAndAwaitAckFlow {
    pub const CLASS: &'static str = "test.SendAndAwaitAckFlow";

    pub fn new(counterparty: Party, message: impl Into<String>) -> Self {
        Self {
            counterparty,
            message: message.into(),
            state: SendAckState::New,
        }
    }
}

impl Flow for SendAndAwaitAckFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            SendAckState::New => {
                self.state = SendAckState::AwaitAck;
                Ok(FlowYield::send_and_receive(
                    self.counterparty.clone(),
                    self.message.clone(),
                    "String",
                ))
            }
            SendAckState::AwaitAck => {
                let ack: String = input.payload("String")?;
                Ok(FlowYield::finished(ack))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Responder that acknowledges one received string with `ack:<value>`.
#[derive(Serialize, Deserialize)]
pub struct AckResponder {
    pub peer: Party,
    pub state: AckState,
}

#[derive(Serialize, Deserialize)]
pub enum AckState {
    New,
    AwaitValue,
    Replying,
}

impl AckResponder {
    pub const CLASS: &'static str = "test.AckResponder";

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self {
            peer,
            state: AckState::New,
        })
    }
}

impl Flow for AckResponder {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            AckState::New => {
                self.state = AckState::AwaitValue;
                Ok(FlowYield::receive(self.peer.clone(), "String"))
            }
            AckState::AwaitValue => {
                let value: String = input.payload("String")?;
                self.state = AckState::Replying;
                Ok(FlowYield::send(self.peer.clone(), format!("ack:{value}")))
            }
            AckState::Replying => {
                input.sent()?;
                Ok(FlowYield::finished(()))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Responder that keeps the received greeting across a nap (and a possible
/// crash) before echoing it back.
#[derive(Serialize, Deserialize)]
pub struct KeepGreetingResponder {
    pub peer: Party,
    pub greeting: Option<String>,
    pub state: KeepGreetingState,
}

#[derive(Serialize, Deserialize)]
pub enum KeepGreetingState {
    New,
    AwaitGreeting,
    Napping,
    Replying,
}

impl KeepGreetingResponder {
    pub const CLASS: &'static str = "test.KeepGreetingResponder";
    pub const NAP: Duration = Duration::from_millis(250);

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self {
            peer,
            greeting: None,
            state: KeepGreetingState::New,
        })
    }
}

impl Flow for KeepGreetingResponder {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            KeepGreetingState::New => {
                self.state = KeepGreetingState::AwaitGreeting;
                Ok(FlowYield::receive(self.peer.clone(), "String"))
            }
            KeepGreetingState::AwaitGreeting => {
                self.greeting = Some(input.payload("String")?);
                self.state = KeepGreetingState::Napping;
                Ok(FlowYield::sleep(Self::NAP))
            }
            KeepGreetingState::Napping => {
                let greeting = self
                    .greeting
                    .clone()
                    .ok_or_else(|| FlowError::fatal("greeting lost across the nap"))?;
                self.state = KeepGreetingState::Replying;
                Ok(FlowYield::send(self.peer.clone(), greeting))
            }
            KeepGreetingState::Replying => {
                input.sent()?;
                Ok(FlowYield::finished(()))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Responder that throws a declared business exception on arrival.
#[derive(Serialize, Deserialize)]
pub struct BusinessFailResponder {
    pub peer: Party,
}

impl BusinessFailResponder {
    pub const CLASS: &'static str = "test.BusinessFailResponder";
    pub const EXCEPTION_CLASS: &'static str = "com.example.MyFlowException";

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self { peer })
    }
}

impl Flow for BusinessFailResponder {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        _input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        Err(FlowError::Business(BusinessError::new(
            Self::EXCEPTION_CLASS,
            "Nothing useful",
        )))
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Responder that fails with an undeclared error; the message must never
/// reach the counterparty.
#[derive(Serialize, Deserialize)]
pub struct EvilBugResponder {
    pub peer: Party,
}

impl EvilBugResponder {
    pub const CLASS: &'static str = "test.EvilBugResponder";

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self { peer })
    }
}

impl Flow for EvilBugResponder {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        _input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        Err(FlowError::fatal("evil bug!"))
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Streams the integers 1..=5 on one session, then receives the collected
/// list back.
#[derive(Serialize, Deserialize)]
pub struct StreamSenderFlow {
    pub counterparty: Party,
    pub state: StreamSenderState,
}

#[derive(Serialize, Deserialize)]
pub enum StreamSenderState {
    New,
    Sending(i64),
    AwaitSummary,
}

impl StreamSenderFlow {
    pub const CLASS: &'static str = "test.StreamSenderFlow";
    pub const COUNT: i64 = 5;

    pub fn new(counterparty: Party) -> Self {
        Self {
            counterparty,
            state: StreamSenderState::New,
        }
    }
}

impl Flow for StreamSenderFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            StreamSenderState::New => {
                self.state = StreamSenderState::Sending(1);
                Ok(FlowYield::send(self.counterparty.clone(), 1))
            }
            StreamSenderState::Sending(current) => {
                input.sent()?;
                if current < Self::COUNT {
                    self.state = StreamSenderState::Sending(current + 1);
                    Ok(FlowYield::send(self.counterparty.clone(), current + 1))
                } else {
                    self.state = StreamSenderState::AwaitSummary;
                    Ok(FlowYield::receive(self.counterparty.clone(), "Vec<i64>"))
                }
            }
            StreamSenderState::AwaitSummary => {
                let summary: Vec<i64> = input.payload("Vec<i64>")?;
                Ok(FlowYield::finished(summary))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Collects five integers in arrival order and sends the list back.
#[derive(Serialize, Deserialize)]
pub struct CollectorResponder {
    pub peer: Party,
    pub items: Vec<i64>,
    pub state: CollectorState,
}

#[derive(Serialize, Deserialize)]
pub enum CollectorState {
    New,
    Collecting,
    SendingSummary,
}

impl CollectorResponder {
    pub const CLASS: &'static str = "test.CollectorResponder";

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self {
            peer,
            items: Vec::new(),
            state: CollectorState::New,
        })
    }
}

impl Flow for CollectorResponder {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            CollectorState::New => {
                self.state = CollectorState::Collecting;
                Ok(FlowYield::receive(self.peer.clone(), "i64"))
            }
            CollectorState::Collecting => {
                self.items.push(input.payload("i64")?);
                if (self.items.len() as i64) < StreamSenderFlow::COUNT {
                    Ok(FlowYield::receive(self.peer.clone(), "i64"))
                } else {
                    self.state = CollectorState::SendingSummary;
                    Ok(FlowYield::send(self.peer.clone(), self.items.clone()))
                }
            }
            CollectorState::SendingSummary => {
                input.sent()?;
                Ok(FlowYield::finished(()))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Version-negotiation probe: asks the responder what version it sees, and
/// reports both views.
#[derive(Serialize, Deserialize)]
pub struct VersionedPingFlow {
    pub counterparty: Party,
    pub state: VersionedPingState,
}

#[derive(Serialize, Deserialize)]
pub enum VersionedPingState {
    New,
    AwaitReply,
}

impl VersionedPingFlow {
    pub const CLASS: &'static str = "test.VersionedPingFlow";

    pub fn new(counterparty: Party) -> Self {
        Self {
            counterparty,
            state: VersionedPingState::New,
        }
    }
}

impl Flow for VersionedPingFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            VersionedPingState::New => {
                self.state = VersionedPingState::AwaitReply;
                Ok(FlowYield::send_and_receive(
                    self.counterparty.clone(),
                    "which version am I?",
                    "u32",
                ))
            }
            VersionedPingState::AwaitReply => {
                let peer_reports: u32 = input.payload("u32")?;
                let we_see = ctx.peer_version(&self.counterparty);
                Ok(FlowYield::finished(json!({
                    "peer_reports": peer_reports,
                    "we_see": we_see,
                })))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Responder half of the version probe: replies with the version it observes
/// for the initiator.
#[derive(Serialize, Deserialize)]
pub struct VersionedPongResponder {
    pub peer: Party,
    pub state: VersionedPongState,
}

#[derive(Serialize, Deserialize)]
pub enum VersionedPongState {
    New,
    AwaitQuestion,
    Replying,
}

impl VersionedPongResponder {
    pub const CLASS: &'static str = "test.VersionedPongResponder";

    pub fn responder(peer: Party) -> Box<dyn Flow> {
        Box::new(Self {
            peer,
            state: VersionedPongState::New,
        })
    }
}

impl Flow for VersionedPongResponder {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            VersionedPongState::New => {
                self.state = VersionedPongState::AwaitQuestion;
                Ok(FlowYield::receive(self.peer.clone(), "String"))
            }
            VersionedPongState::AwaitQuestion => {
                let _question: String = input.payload("String")?;
                let seen = ctx
                    .peer_version(&self.peer)
                    .ok_or_else(|| FlowError::fatal("peer version not negotiated"))?;
                self.state = VersionedPongState::Replying;
                Ok(FlowYield::send(self.peer.clone(), seen))
            }
            VersionedPongState::Replying => {
                input.sent()?;
                Ok(FlowYield::finished(()))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Parent that runs a napping child as a sub-flow and adds one to its result.
#[derive(Serialize, Deserialize)]
pub struct ParentFlow {
    pub state: ParentState,
}

#[derive(Serialize, Deserialize)]
pub enum ParentState {
    New,
    AwaitChild,
}

impl ParentFlow {
    pub const CLASS: &'static str = "test.ParentFlow";

    pub fn new() -> Self {
        Self {
            state: ParentState::New,
        }
    }
}

impl Flow for ParentFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            ParentState::New => {
                self.state = ParentState::AwaitChild;
                Ok(FlowYield::subflow(NappingChildFlow::new()))
            }
            ParentState::AwaitChild => {
                let from_child: i64 = input.subflow_result("i64")?;
                Ok(FlowYield::finished(from_child + 1))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Child flow that naps once (forcing a two-frame checkpoint) and returns 41.
#[derive(Serialize, Deserialize)]
pub struct NappingChildFlow {
    pub state: NappingChildState,
}

#[derive(Serialize, Deserialize)]
pub enum NappingChildState {
    New,
    Napping,
}

impl NappingChildFlow {
    pub const CLASS: &'static str = "test.NappingChildFlow";

    pub fn new() -> Self {
        Self {
            state: NappingChildState::New,
        }
    }
}

impl Flow for NappingChildFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        _input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            NappingChildState::New => {
                self.state = NappingChildState::Napping;
                Ok(FlowYield::sleep(Duration::from_millis(20)))
            }
            NappingChildState::Napping => Ok(FlowYield::finished(41)),
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Waits for a ledger transaction, then finishes.
#[derive(Serialize, Deserialize)]
pub struct LedgerWaitFlow {
    pub tx_id: TxId,
    pub state: LedgerWaitState,
}

#[derive(Serialize, Deserialize)]
pub enum LedgerWaitState {
    New,
    Waiting,
}

impl LedgerWaitFlow {
    pub const CLASS: &'static str = "test.LedgerWaitFlow";

    pub fn new(tx_id: TxId) -> Self {
        Self {
            tx_id,
            state: LedgerWaitState::New,
        }
    }
}

impl Flow for LedgerWaitFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        _input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            LedgerWaitState::New => {
                self.state = LedgerWaitState::Waiting;
                Ok(FlowYield::wait_for_ledger_commit(self.tx_id.clone()))
            }
            LedgerWaitState::Waiting => Ok(FlowYield::finished("recorded")),
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Sleeps far longer than any test runs; exists to be killed.
#[derive(Serialize, Deserialize)]
pub struct DozingFlow {
    pub state: DozingState,
}

#[derive(Serialize, Deserialize)]
pub enum DozingState {
    New,
    Dozing,
}

impl DozingFlow {
    pub const CLASS: &'static str = "test.DozingFlow";

    pub fn new() -> Self {
        Self {
            state: DozingState::New,
        }
    }
}

impl Flow for DozingFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn resume(
        &mut self,
        _ctx: &mut FlowContext<'_>,
        _input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            DozingState::New => {
                self.state = DozingState::Dozing;
                Ok(FlowYield::sleep(Duration::from_secs(600)))
            }
            DozingState::Dozing => Ok(FlowYield::finished("woke")),
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}

/// Tracked flow with declared progress steps; naps between them so observers
/// see the transitions.
#[derive(Serialize, Deserialize)]
pub struct TrackedFlow {
    pub state: TrackedState,
}

#[derive(Serialize, Deserialize)]
pub enum TrackedState {
    New,
    Working,
}

impl TrackedFlow {
    pub const CLASS: &'static str = "test.TrackedFlow";

    pub fn new() -> Self {
        Self {
            state: TrackedState::New,
        }
    }
}

impl Flow for TrackedFlow {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn progress_steps(&self) -> Vec<String> {
        vec!["Preparing".to_string(), "Finishing".to_string()]
    }

    fn resume(
        &mut self,
        ctx: &mut FlowContext<'_>,
        _input: FlowResume,
    ) -> Result<FlowYield, FlowError> {
        match self.state {
            TrackedState::New => {
                ctx.progress("Preparing");
                self.state = TrackedState::Working;
                Ok(FlowYield::sleep(Duration::from_millis(10)))
            }
            TrackedState::Working => {
                ctx.progress("Finishing");
                Ok(FlowYield::finished("done"))
            }
        }
    }

    fn save(&self) -> Result<Value, FlowError> {
        save_state(self)
    }
}
