//! EMM Service Access Points
//!
//! Primitive definitions and the dispatcher coupling the attach state
//! machine to its collaborators: EMMREG primitives drive the specific and
//! common procedure handlers, EMMAS primitives are delivered to the access
//! stratum sink, ESM primitives are forwarded to the session management
//! collaborator and their result returned to the caller.
//!
//! The dispatcher is the only place a context is mutated on behalf of
//! registration outcomes; the caller holds the per-context lock for the
//! whole exchange.

use crate::context::{EmmContext, EpsTai, EpsGuti, MmeUeS1apId};
use crate::esm_sap::{EsmSapPrimitive, EsmSapResponse};
use crate::mme_api::MmeRuntime;
use crate::nas_security::{SecurityContext, SelectedAlgorithms, UeSecurityCapability};
use crate::procedures::{CommonProcKind, IdentityType};
use crate::sm::EmmState;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// EMM Cause Codes (TS 24.301 annex A)
// ============================================================================

/// EMM cause values surfaced to the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmmCause {
    IllegalUe = 3,
    ImeiNotAccepted = 5,
    IllegalMe = 6,
    EpsServicesNotAllowed = 7,
    PlmnNotAllowed = 11,
    TrackingAreaNotAllowed = 12,
    NoSuitableCellsInTa = 15,
    NetworkFailure = 17,
    EsmFailure = 19,
    MacFailure = 20,
    SynchFailure = 21,
    Congestion = 22,
    SecurityModeRejectedUnspecified = 24,
    ProtocolErrorUnspecified = 111,
}

// ============================================================================
// Decode Status
// ============================================================================

/// Outcome of the lower-layer NAS decode for an uplink message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NasDecodeStatus {
    pub integrity_protected: bool,
    pub ciphered: bool,
    /// NAS MAC verified against the current security context
    pub mac_matched: bool,
}

// ============================================================================
// EMM-AS Primitives (downlink to the access stratum)
// ============================================================================

/// Security parameters handed to the NAS encoder below
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmAsSecurityData {
    pub eksi: u8,
    pub selected_algorithms: SelectedAlgorithms,
    pub dl_count: u32,
    /// True when protection uses a new (not yet taken into use) context
    pub is_new: bool,
}

impl EmmAsSecurityData {
    /// Snapshot from a security context, if one exists
    pub fn from_context(security: Option<&SecurityContext>, is_new: bool) -> Option<Self> {
        security.map(|sc| Self {
            eksi: sc.eksi,
            selected_algorithms: sc.selected_algorithms,
            dl_count: sc.dl_count.value(),
            is_new,
        })
    }
}

/// NAS request messages emitted by common procedures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasDownlinkRequest {
    IdentityRequest {
        identity_type: IdentityType,
    },
    AuthenticationRequest {
        ksi: u8,
        rand: [u8; 16],
        autn: [u8; 16],
    },
    SecurityModeCommand {
        ksi: u8,
        selected_algorithms: SelectedAlgorithms,
        replayed_capability: UeSecurityCapability,
    },
}

/// EMMAS_SECURITY_REQ: a common-procedure request towards the UE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityReq {
    pub ue_id: MmeUeS1apId,
    pub request: NasDownlinkRequest,
    pub security: Option<EmmAsSecurityData>,
}

/// EMMAS_ESTABLISH_CNF: everything needed to encode the ATTACH ACCEPT
#[derive(Debug, Clone, PartialEq)]
pub struct EstablishCnf {
    pub ue_id: MmeUeS1apId,
    /// GUTI identity of the UE
    pub guti: EpsGuti,
    /// Newly assigned GUTI to include in the accept, when not yet valid
    pub new_guti: Option<EpsGuti>,
    pub tai_list: Vec<EpsTai>,
    pub eps_network_feature_support: u8,
    pub security: Option<EmmAsSecurityData>,
    pub encryption: u8,
    pub integrity: u8,
    /// Embedded ESM message (Activate Default EPS Bearer Context Request)
    pub nas_msg: Option<Bytes>,
    pub t3402: Duration,
}

/// EMMAS_ESTABLISH_REJ: everything needed to encode the ATTACH REJECT
#[derive(Debug, Clone, PartialEq)]
pub struct EstablishRej {
    pub ue_id: MmeUeS1apId,
    pub cause: EmmCause,
    /// Embedded ESM reject PDU when cause is EsmFailure
    pub nas_msg: Option<Bytes>,
    pub security: Option<EmmAsSecurityData>,
}

/// EMM-AS primitive family
#[derive(Debug, Clone, PartialEq)]
pub enum EmmAsPrimitive {
    SecurityReq(SecurityReq),
    EstablishCnf(EstablishCnf),
    EstablishRej(EstablishRej),
}

/// Downlink sink towards the access stratum. The production sink hands the
/// primitive to the S1AP layer; the recording sink captures it for
/// inspection.
pub trait AsMessageSink: Send + Sync {
    fn deliver(&self, primitive: EmmAsPrimitive);
}

/// Sink that records every delivered primitive
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<EmmAsPrimitive>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<EmmAsPrimitive> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<EmmAsPrimitive> {
        self.delivered.lock().unwrap().last().cloned()
    }
}

impl AsMessageSink for RecordingSink {
    fn deliver(&self, primitive: EmmAsPrimitive) {
        log::trace!("EMMAS delivered: {:?}", primitive);
        self.delivered.lock().unwrap().push(primitive);
    }
}

// ============================================================================
// EMM-REG Primitives (registration outcomes)
// ============================================================================

/// EMMREG primitive kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmRegKind {
    /// Attach completed successfully
    AttachCnf,
    /// Attach failed; when `cause` is set it overrides the procedure cause
    AttachRej { cause: Option<EmmCause> },
    /// Abort the running attach procedure
    AttachAbort,
    /// Abort a running common procedure, restoring the prior FSM state
    CommonProcAbort(CommonProcKind),
}

/// EMMREG primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmRegPrimitive {
    pub kind: EmmRegKind,
    /// Run the procedure's outcome handler (e.g. emit the reject downlink)
    pub notify: bool,
    /// Delete the procedure node afterwards
    pub free_proc: bool,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Tagged primitive accepted by the dispatcher
#[derive(Debug)]
pub enum EmmSap {
    Reg(EmmRegPrimitive),
    As(EmmAsPrimitive),
    Esm(EsmSapPrimitive),
}

/// What the dispatch produced for the caller
#[derive(Debug)]
pub enum SapOutcome {
    Done,
    /// Response from the ESM collaborator, steering the attach procedure
    Esm(EsmSapResponse),
}

/// Single entry point for EMM-SAP primitives. The caller holds the
/// per-context lock.
pub fn emm_sap_send(rt: &MmeRuntime, ctx: &mut EmmContext, sap: EmmSap) -> SapOutcome {
    match sap {
        EmmSap::As(primitive) => {
            send_as(rt, ctx, primitive);
            SapOutcome::Done
        }
        EmmSap::Reg(primitive) => {
            send_reg(rt, ctx, primitive);
            SapOutcome::Done
        }
        EmmSap::Esm(primitive) => SapOutcome::Esm(rt.esm.esm_sap_send(primitive)),
    }
}

/// Deliver a downlink primitive, advancing the NAS downlink count of the
/// protecting security context exactly once per protected message.
fn send_as(rt: &MmeRuntime, ctx: &mut EmmContext, primitive: EmmAsPrimitive) {
    let protected = match &primitive {
        EmmAsPrimitive::SecurityReq(req) => req.security.is_some(),
        EmmAsPrimitive::EstablishCnf(cnf) => cnf.security.is_some(),
        EmmAsPrimitive::EstablishRej(rej) => rej.security.is_some(),
    };
    let is_new_context = matches!(
        &primitive,
        EmmAsPrimitive::SecurityReq(SecurityReq {
            security: Some(EmmAsSecurityData { is_new: true, .. }),
            ..
        })
    );
    rt.as_sink.deliver(primitive);
    if protected {
        if is_new_context {
            if let Some(sc) = ctx.non_current_security.as_mut() {
                sc.bump_dl_count();
            }
        } else {
            ctx.bump_dl_count();
        }
    }
}

fn send_reg(rt: &MmeRuntime, ctx: &mut EmmContext, primitive: EmmRegPrimitive) {
    match primitive.kind {
        EmmRegKind::AttachCnf => {
            log::info!("ue_id={} EMMREG_ATTACH_CNF", ctx.ue_id);
            if primitive.free_proc {
                let tokens = ctx.procedures.take_all_timers();
                for token in tokens {
                    rt.timers.stop(token);
                }
                ctx.procedures.remove_specific();
            }
            ctx.fsm.transition(EmmState::Registered);
            ctx.ever_registered = true;
        }
        EmmRegKind::AttachRej { cause } => {
            attach_rej(rt, ctx, cause, primitive.notify, primitive.free_proc);
        }
        EmmRegKind::AttachAbort => {
            crate::attach::abort_attach_procedure(rt, ctx);
        }
        EmmRegKind::CommonProcAbort(kind) => {
            if let Some(proc) = ctx.procedures.remove_common(kind) {
                log::warn!("ue_id={} EMMREG_COMMON_PROC_ABORT {}", ctx.ue_id, kind);
                if let Some(token) = proc.data().timer {
                    rt.timers.stop(token);
                }
                let previous = proc.data().previous_fsm_state;
                ctx.fsm.restore(previous);
            }
        }
    }
}

/// EMMREG_ATTACH_REJ: emit the reject towards the UE and tear the
/// procedure down. A context that never reached EMM-REGISTERED is released
/// from the identifier index entirely.
fn attach_rej(
    rt: &MmeRuntime,
    ctx: &mut EmmContext,
    cause_override: Option<EmmCause>,
    notify: bool,
    free_proc: bool,
) {
    let had_proc = ctx.procedures.attach().is_some();
    let cause = cause_override
        .or_else(|| ctx.procedures.attach().and_then(|p| p.emm_cause))
        .unwrap_or(EmmCause::IllegalUe);

    log::warn!(
        "ue_id={} EMM attach procedure not accepted by the network (cause={:?})",
        ctx.ue_id,
        cause
    );

    if notify {
        let nas_msg = if cause == EmmCause::EsmFailure {
            let staged = ctx.procedures.attach().and_then(|p| p.esm_msg_out.clone());
            if staged.is_none() {
                log::error!("ue_id={} ESM reject message is missing", ctx.ue_id);
            }
            staged
        } else {
            None
        };
        let rej = EstablishRej {
            ue_id: ctx.ue_id,
            cause,
            nas_msg,
            security: EmmAsSecurityData::from_context(ctx.security.as_ref(), false),
        };
        if let Some(proc) = ctx.procedures.attach_mut() {
            proc.attach_reject_sent = true;
            proc.emm_cause = Some(cause);
        }
        send_as(rt, ctx, EmmAsPrimitive::EstablishRej(rej));
    }

    let tokens = ctx.procedures.take_all_timers();
    for token in tokens {
        rt.timers.stop(token);
    }
    if free_proc {
        ctx.procedures.remove_specific();
    }
    ctx.fsm.transition(EmmState::Deregistered);

    if had_proc && free_proc && !ctx.ever_registered {
        log::warn!("ue_id={} releasing never-registered UE context", ctx.ue_id);
        ctx.release_identities();
        rt.index.remove(ctx.id);
    }
}
