//! EMM State Machine
//!
//! Per-UE EPS Mobility Management state, driven by the attach procedure and
//! the EMM-SAP dispatcher. Transitions are logged at debug level.

use std::fmt;

/// EMM state of a UE context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmmState {
    /// No EMM context or registration rejected/aborted
    #[default]
    Deregistered,
    /// Attach procedure started, common procedures may run
    CommonProcedureInitiated,
    /// ATTACH ACCEPT sent, waiting for ATTACH COMPLETE
    RegisteredInitiated,
    /// Attach complete, UE registered
    Registered,
    /// Network-initiated detach in progress
    DeregisteredInitiated,
}

impl fmt::Display for EmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmState::Deregistered => write!(f, "EMM-DEREGISTERED"),
            EmmState::CommonProcedureInitiated => write!(f, "EMM-COMMON-PROCEDURE-INITIATED"),
            EmmState::RegisteredInitiated => write!(f, "EMM-REGISTERED-INITIATED"),
            EmmState::Registered => write!(f, "EMM-REGISTERED"),
            EmmState::DeregisteredInitiated => write!(f, "EMM-DEREGISTERED-INITIATED"),
        }
    }
}

/// EMM finite state machine for one UE context
#[derive(Debug, Clone, Default)]
pub struct EmmFsm {
    state: EmmState,
    ue_id: u32,
}

impl EmmFsm {
    /// Create a new FSM in EMM-DEREGISTERED
    pub fn new(ue_id: u32) -> Self {
        Self {
            state: EmmState::Deregistered,
            ue_id,
        }
    }

    /// Current state
    pub fn state(&self) -> EmmState {
        self.state
    }

    /// Update the lower-layer identifier used in transition logs
    pub fn set_ue_id(&mut self, ue_id: u32) {
        self.ue_id = ue_id;
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: EmmState) {
        if self.state != new_state {
            log::debug!("EMM FSM [{}]: {} -> {}", self.ue_id, self.state, new_state);
        }
        self.state = new_state;
    }

    /// Restore a previously recorded state (common procedure abort path)
    pub fn restore(&mut self, state: EmmState) {
        log::debug!("EMM FSM [{}]: restore {} -> {}", self.ue_id, self.state, state);
        self.state = state;
    }
}
