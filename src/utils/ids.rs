//! Run and session id generation.

use rand::RngExt;

use crate::types::{RunId, SessionId};

/// Generates the two id kinds the framework allocates: v4-UUID run-ids and
/// 63-bit random session-ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn generate_run_id(&self) -> RunId {
        RunId::fresh()
    }

    /// A fresh initiator-side session id. The sign bit is cleared so the id
    /// survives transports that treat it as a signed 64-bit integer.
    #[must_use]
    pub fn generate_session_id(&self) -> SessionId {
        SessionId::from_raw(rand::rng().random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_fit_in_63_bits() {
        let ids = IdGenerator::new();
        for _ in 0..64 {
            assert_eq!(ids.generate_session_id().raw() >> 63, 0);
        }
    }
}
