//! EMM Procedure Tree
//!
//! Nested-procedure runtime for one UE context: a specific procedure
//! (attach, and the kinds it collides with) owns at most one common
//! procedure of each kind. Continuations are enum values resolved by the
//! attach module, so a common procedure completing "yields back" to its
//! parent without function pointers. Each node records the EMM FSM state
//! at creation so an abort can restore it.

use crate::attach::AttachRequestIes;
use crate::context::EpsGuti;
use crate::emm_sap::EmmCause;
use crate::sm::EmmState;
use crate::timer::TimerToken;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Kinds of EMM common procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonProcKind {
    Identification,
    Authentication,
    SecurityModeControl,
    GutiReallocation,
}

impl fmt::Display for CommonProcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonProcKind::Identification => write!(f, "IDENTIFICATION"),
            CommonProcKind::Authentication => write!(f, "AUTHENTICATION"),
            CommonProcKind::SecurityModeControl => write!(f, "SECURITY_MODE_CONTROL"),
            CommonProcKind::GutiReallocation => write!(f, "GUTI_REALLOCATION"),
        }
    }
}

/// Kinds of EMM specific procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecificProcKind {
    Attach,
    Detach,
    TrackingAreaUpdate,
    ServiceRequest,
}

impl fmt::Display for SpecificProcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecificProcKind::Attach => write!(f, "ATTACH"),
            SpecificProcKind::Detach => write!(f, "DETACH"),
            SpecificProcKind::TrackingAreaUpdate => write!(f, "TAU"),
            SpecificProcKind::ServiceRequest => write!(f, "SERVICE_REQUEST"),
        }
    }
}

/// Continuation invoked on the attach procedure when a common procedure
/// completes or fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStep {
    /// Run the authentication common procedure
    StartAuthentication,
    /// Run the security mode control common procedure
    StartSecurityMode,
    /// Dispatch the embedded ESM message, then send the accept
    Attach,
    /// Reject the attach with the given cause
    Reject(EmmCause),
    /// Release the context data
    Release,
    /// Nothing further
    Stop,
}

/// Identity types requested by the identification procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityType {
    Imsi,
    Imei,
    Imeisv,
    Tmsi,
}

/// Bookkeeping shared by every common procedure node
#[derive(Debug, Clone)]
pub struct CommonProcData {
    /// EMM FSM state to restore on abort
    pub previous_fsm_state: EmmState,
    /// Retransmission timer handle, when armed
    pub timer: Option<TimerToken>,
    /// Number of request transmissions so far
    pub retransmission_count: u32,
    pub on_success: AttachStep,
    pub on_failure: AttachStep,
}

impl CommonProcData {
    pub fn new(previous_fsm_state: EmmState, on_success: AttachStep, on_failure: AttachStep) -> Self {
        Self {
            previous_fsm_state,
            timer: None,
            retransmission_count: 0,
            on_success,
            on_failure,
        }
    }
}

/// Identification common procedure
#[derive(Debug, Clone)]
pub struct IdentificationProc {
    pub data: CommonProcData,
    pub identity_type: IdentityType,
    /// Whether this identification was initiated for an attach
    pub requested_for_attach: bool,
}

/// Authentication common procedure
#[derive(Debug, Clone)]
pub struct AuthenticationProc {
    pub data: CommonProcData,
    pub ksi: u8,
}

/// Security mode control common procedure
#[derive(Debug, Clone)]
pub struct SecurityModeProc {
    pub data: CommonProcData,
    pub ksi: u8,
}

/// GUTI reallocation common procedure
#[derive(Debug, Clone)]
pub struct GutiReallocProc {
    pub data: CommonProcData,
}

/// A common procedure node
#[derive(Debug, Clone)]
pub enum CommonProc {
    Identification(IdentificationProc),
    Authentication(AuthenticationProc),
    SecurityModeControl(SecurityModeProc),
    GutiReallocation(GutiReallocProc),
}

impl CommonProc {
    pub fn kind(&self) -> CommonProcKind {
        match self {
            CommonProc::Identification(_) => CommonProcKind::Identification,
            CommonProc::Authentication(_) => CommonProcKind::Authentication,
            CommonProc::SecurityModeControl(_) => CommonProcKind::SecurityModeControl,
            CommonProc::GutiReallocation(_) => CommonProcKind::GutiReallocation,
        }
    }

    pub fn data(&self) -> &CommonProcData {
        match self {
            CommonProc::Identification(p) => &p.data,
            CommonProc::Authentication(p) => &p.data,
            CommonProc::SecurityModeControl(p) => &p.data,
            CommonProc::GutiReallocation(p) => &p.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut CommonProcData {
        match self {
            CommonProc::Identification(p) => &mut p.data,
            CommonProc::Authentication(p) => &mut p.data,
            CommonProc::SecurityModeControl(p) => &mut p.data,
            CommonProc::GutiReallocation(p) => &mut p.data,
        }
    }
}

/// Attach specific procedure node
#[derive(Debug)]
pub struct AttachProcedure {
    /// The request IEs frozen at procedure creation
    pub ies: AttachRequestIes,
    pub ksi: u8,
    pub emm_cause: Option<EmmCause>,
    /// Outgoing ESM message: default-bearer activation for the accept, or
    /// the PDN connectivity reject for an ESM-failure reject
    pub esm_msg_out: Option<Bytes>,
    /// Number of ATTACH ACCEPTs sent on this procedure
    pub attach_accept_sent: u32,
    pub attach_reject_sent: bool,
    pub attach_complete_received: bool,
    /// Candidate GUTI carried in the accept, validated on complete
    pub guti: Option<EpsGuti>,
    pub t3450: Option<TimerToken>,
    pub previous_fsm_state: EmmState,
}

impl AttachProcedure {
    pub fn new(ies: AttachRequestIes, previous_fsm_state: EmmState) -> Self {
        let ksi = ies.ksi;
        Self {
            ies,
            ksi,
            emm_cause: None,
            esm_msg_out: None,
            attach_accept_sent: 0,
            attach_reject_sent: false,
            attach_complete_received: false,
            guti: None,
            t3450: None,
            previous_fsm_state,
        }
    }

    pub fn is_accept_sent(&self) -> bool {
        self.attach_accept_sent > 0
    }

    pub fn is_reject_sent(&self) -> bool {
        self.attach_reject_sent
    }

    pub fn is_complete_received(&self) -> bool {
        self.attach_complete_received
    }
}

/// A specific procedure node. Only attach carries a payload here; the
/// other kinds exist so collisions with them stay representable.
#[derive(Debug)]
pub enum SpecificProc {
    Attach(AttachProcedure),
}

impl SpecificProc {
    pub fn kind(&self) -> SpecificProcKind {
        match self {
            SpecificProc::Attach(_) => SpecificProcKind::Attach,
        }
    }
}

/// Procedure tree errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcError {
    #[error("specific procedure {0} already running")]
    SpecificAlreadyRunning(SpecificProcKind),
    #[error("common procedure {0} already running")]
    CommonAlreadyRunning(CommonProcKind),
}

/// Procedure tree root for one UE context
#[derive(Debug, Default)]
pub struct EmmProcedures {
    specific: Option<SpecificProc>,
    common: Vec<CommonProc>,
}

impl EmmProcedures {
    /// The running attach procedure, if any
    pub fn attach(&self) -> Option<&AttachProcedure> {
        match &self.specific {
            Some(SpecificProc::Attach(p)) => Some(p),
            None => None,
        }
    }

    pub fn attach_mut(&mut self) -> Option<&mut AttachProcedure> {
        match &mut self.specific {
            Some(SpecificProc::Attach(p)) => Some(p),
            None => None,
        }
    }

    pub fn is_specific_running(&self) -> bool {
        self.specific.is_some()
    }

    pub fn specific_kind(&self) -> Option<SpecificProcKind> {
        self.specific.as_ref().map(|p| p.kind())
    }

    /// Create the attach specific procedure. At most one specific
    /// procedure may run per context.
    pub fn new_attach(
        &mut self,
        ies: AttachRequestIes,
        previous_fsm_state: EmmState,
    ) -> Result<&mut AttachProcedure, ProcError> {
        if let Some(existing) = &self.specific {
            return Err(ProcError::SpecificAlreadyRunning(existing.kind()));
        }
        self.specific = Some(SpecificProc::Attach(AttachProcedure::new(
            ies,
            previous_fsm_state,
        )));
        Ok(self.attach_mut().expect("just inserted"))
    }

    /// Detach the specific procedure from the tree, dropping any remaining
    /// common children with it.
    pub fn remove_specific(&mut self) -> Option<SpecificProc> {
        self.common.clear();
        self.specific.take()
    }

    /// Attach a common procedure under the running specific procedure. At
    /// most one common procedure of each kind may run per context.
    pub fn start_common(&mut self, proc: CommonProc) -> Result<(), ProcError> {
        if self.is_common_running(proc.kind()) {
            return Err(ProcError::CommonAlreadyRunning(proc.kind()));
        }
        self.common.push(proc);
        Ok(())
    }

    pub fn is_common_running(&self, kind: CommonProcKind) -> bool {
        self.common.iter().any(|p| p.kind() == kind)
    }

    pub fn common(&self, kind: CommonProcKind) -> Option<&CommonProc> {
        self.common.iter().find(|p| p.kind() == kind)
    }

    pub fn common_mut(&mut self, kind: CommonProcKind) -> Option<&mut CommonProc> {
        self.common.iter_mut().find(|p| p.kind() == kind)
    }

    /// Delete a common procedure node
    pub fn remove_common(&mut self, kind: CommonProcKind) -> Option<CommonProc> {
        let pos = self.common.iter().position(|p| p.kind() == kind)?;
        Some(self.common.remove(pos))
    }

    /// Tear-down support: collect and clear every timer handle in the
    /// subtree, children before the specific root, so the caller can stop
    /// them all before the nodes are dropped.
    pub fn take_all_timers(&mut self) -> Vec<TimerToken> {
        let mut tokens = Vec::new();
        for proc in &mut self.common {
            if let Some(token) = proc.data_mut().timer.take() {
                tokens.push(token);
            }
        }
        if let Some(SpecificProc::Attach(attach)) = &mut self.specific {
            if let Some(token) = attach.t3450.take() {
                tokens.push(token);
            }
        }
        tokens
    }
}
