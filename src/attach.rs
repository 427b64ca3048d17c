//! Attach Procedure
//!
//! The UE-requested attach procedure as executed by the MME: context
//! resolution across the identifier index, collision handling against
//! running procedures, the abnormal cases for duplicate requests, the
//! common-procedure sequencing (identification, authentication, security
//! mode control), accept/reject emission and the T3450 retransmission
//! cycle.

use crate::context::{
    DrxParameter, ECgi, EmmContext, EnbUeKey, EpsGuti, EpsTai, Imei, Imsi, KeyUpdates,
    MmeUeS1apId, MsNetworkCapability, UeNetworkCapability, INVALID_MME_UE_S1AP_ID,
};
use crate::emm_common;
use crate::emm_sap::{
    emm_sap_send, EmmAsPrimitive, EmmAsSecurityData, EmmCause, EmmRegKind, EmmRegPrimitive,
    EmmSap, EstablishCnf, NasDecodeStatus, SapOutcome,
};
use crate::esm_sap::{EsmSapPrimitive, EsmSapStatus};
use crate::mme_api::{DuplicatePolicy, MmeRuntime};
use crate::procedures::{AttachStep, CommonProc, CommonProcKind, IdentityType};
use crate::sm::EmmState;
use crate::timer::{TimerExpiry, TimerId, NAS_RETX_MAX};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Request IEs
// ============================================================================

/// Type of the requested attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachType {
    #[default]
    Eps,
    CombinedEpsImsi,
    Emergency,
    Reserved,
}

impl fmt::Display for AttachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachType::Eps => write!(f, "EPS"),
            AttachType::CombinedEpsImsi => write!(f, "IMSI"),
            AttachType::Emergency => write!(f, "EMERGENCY"),
            AttachType::Reserved => write!(f, "RESERVED"),
        }
    }
}

/// Information elements of an ATTACH REQUEST, as decoded below
#[derive(Debug, Clone, Default)]
pub struct AttachRequestIes {
    /// True when carried in the initial message of a new association
    pub is_initial: bool,
    pub attach_type: AttachType,
    pub is_native_sc: bool,
    pub ksi: u8,
    pub is_native_guti: bool,
    pub guti: Option<EpsGuti>,
    pub imsi: Option<Imsi>,
    pub imei: Option<Imei>,
    pub last_visited_registered_tai: Option<EpsTai>,
    pub originating_tai: Option<EpsTai>,
    pub originating_ecgi: Option<ECgi>,
    pub ue_network_capability: UeNetworkCapability,
    pub ms_network_capability: Option<MsNetworkCapability>,
    pub drx_parameter: Option<DrxParameter>,
    /// Embedded ESM message (PDN CONNECTIVITY REQUEST), opaque here
    pub esm_msg: Bytes,
    pub decode_status: NasDecodeStatus,
}

/// Whether the attach parameters differ from those previously stored when
/// the attach procedure was initiated. Presence asymmetry counts as a
/// difference.
pub fn ies_have_changed(ue_id: MmeUeS1apId, a: &AttachRequestIes, b: &AttachRequestIes) -> bool {
    if a.attach_type != b.attach_type {
        log::info!("UE {} attach IEs changed: attach type", ue_id);
        return true;
    }
    if a.is_native_sc != b.is_native_sc {
        log::info!("UE {} attach IEs changed: native security context", ue_id);
        return true;
    }
    if a.ksi != b.ksi {
        log::info!("UE {} attach IEs changed: KSI {} -> {}", ue_id, b.ksi, a.ksi);
        return true;
    }
    if a.is_native_guti != b.is_native_guti {
        log::info!("UE {} attach IEs changed: native GUTI", ue_id);
        return true;
    }
    if a.guti != b.guti {
        log::info!("UE {} attach IEs changed: GUTI", ue_id);
        return true;
    }
    if a.imsi != b.imsi {
        log::info!("UE {} attach IEs changed: IMSI", ue_id);
        return true;
    }
    if a.imei != b.imei {
        log::info!("UE {} attach IEs changed: IMEI", ue_id);
        return true;
    }
    if a.last_visited_registered_tai != b.last_visited_registered_tai {
        log::info!("UE {} attach IEs changed: last visited registered TAI", ue_id);
        return true;
    }
    if a.originating_tai != b.originating_tai {
        log::info!("UE {} attach IEs changed: originating TAI", ue_id);
        return true;
    }
    if a.originating_ecgi != b.originating_ecgi {
        log::info!("UE {} attach IEs changed: originating ECGI", ue_id);
        return true;
    }
    if a.ue_network_capability != b.ue_network_capability {
        log::info!("UE {} attach IEs changed: UE network capability", ue_id);
        return true;
    }
    if a.ms_network_capability != b.ms_network_capability {
        log::info!("UE {} attach IEs changed: MS network capability", ue_id);
        return true;
    }
    false
}

// ============================================================================
// Entry Point: ATTACH REQUEST
// ============================================================================

/// What collision handling decided about the rest of the request
enum RequestOutcome {
    /// Fully handled (rejected, resent or ignored)
    Done,
    /// Create the procedure (if needed) and run it, optionally resolving a
    /// pending duplicate eNB association first
    Proceed { resolve: Option<DuplicatePolicy> },
}

/// UE-requested attach procedure (TS 24.301 section 5.5.1.2.3)
pub fn on_attach_request(
    rt: &MmeRuntime,
    enb_key: EnbUeKey,
    ran_id: MmeUeS1apId,
    ies: AttachRequestIes,
) {
    log::info!(
        "EMM-PROC ATTACH - EPS attach type={} initial={} (ue_id={})",
        ies.attach_type,
        ies.is_initial,
        ran_id
    );

    // Resolve the target context: lower-layer id first, then the
    // identities carried in the request, finally the eNB association.
    let mut duplicate = false;
    let mut found = None;
    let mut via_enb_key = false;
    if ran_id != INVALID_MME_UE_S1AP_ID {
        found = rt.index.id_by_ran_id(ran_id);
    }
    if found.is_none() {
        if let Some(ref guti) = ies.guti {
            if let Some(id) = rt.index.id_by_guti(guti) {
                if rt.index.keys_of(id).and_then(|k| k.enb_key) != Some(enb_key) {
                    log::trace!("found old context matching GUTI in ATTACH REQUEST");
                    duplicate = true;
                }
                found = Some(id);
            }
        }
    }
    if found.is_none() {
        if let Some(ref imsi) = ies.imsi {
            if let Some(id) = rt.index.id_by_imsi(imsi) {
                if rt.index.keys_of(id).and_then(|k| k.enb_key) != Some(enb_key) {
                    log::trace!("found old context matching IMSI in ATTACH REQUEST");
                    duplicate = true;
                }
                found = Some(id);
            }
        }
    }
    if found.is_none() {
        if let Some(id) = rt.index.id_by_enb_key(&enb_key) {
            found = Some(id);
            via_enb_key = true;
        }
    }

    let mut ctx_arc = match found {
        Some(id) => match rt.index.find(id) {
            Some(ctx) => ctx,
            None => return,
        },
        None => {
            let assigned = if ran_id == INVALID_MME_UE_S1AP_ID {
                rt.next_mme_ue_s1ap_id()
            } else {
                ran_id
            };
            match rt.index.create(enb_key, assigned) {
                Ok(ctx) => {
                    if ran_id == INVALID_MME_UE_S1AP_ID {
                        rt.notify_new_ran_id(enb_key.enb_ue_s1ap_id, enb_key.enb_id, assigned);
                    }
                    ctx
                }
                Err(e) => {
                    log::error!("cannot create UE context: {}", e);
                    return;
                }
            }
        }
    };
    let matched_id = {
        let ctx = ctx_arc.lock().unwrap();
        ctx.id
    };

    // A context found by its eNB association only may still lack a
    // lower-layer id; assign one and tell the access layer.
    if via_enb_key {
        let mut ctx = ctx_arc.lock().unwrap();
        if ctx.ue_id == INVALID_MME_UE_S1AP_ID {
            let new_id = rt.next_mme_ue_s1ap_id();
            match rt.index.rekey(
                ctx.id,
                KeyUpdates {
                    ran_id: Some(new_id),
                    ..Default::default()
                },
            ) {
                Ok(()) => {
                    ctx.ue_id = new_id;
                    ctx.fsm.set_ue_id(new_id);
                    rt.notify_new_ran_id(enb_key.enb_ue_s1ap_id, enb_key.enb_id, new_id);
                }
                Err(e) => log::error!("cannot assign lower-layer id: {}", e),
            }
        } else {
            log::warn!(
                "found old context matching eNB key in ATTACH REQUEST, very suspicious"
            );
        }
    }

    // An initial request wins the association immediately: the stale
    // context created for the new association is dropped.
    if duplicate && ies.is_initial {
        if let Some(kept) =
            rt.duplicate_enb_ue_s1ap_id_detected(enb_key, matched_id, DuplicatePolicy::RemoveNewContext)
        {
            adopt_association(rt, &kept, enb_key, ran_id);
            ctx_arc = kept;
            duplicate = false;
        }
    }

    let outcome = {
        let mut ctx = ctx_arc.lock().unwrap();
        handle_request_on_context(rt, &mut ctx, &ies, duplicate)
    };

    match outcome {
        RequestOutcome::Done => {}
        RequestOutcome::Proceed { resolve } => {
            let target = match resolve {
                Some(policy) => {
                    match rt.duplicate_enb_ue_s1ap_id_detected(enb_key, matched_id, policy) {
                        Some(kept) => {
                            if policy == DuplicatePolicy::RemoveNewContext {
                                adopt_association(rt, &kept, enb_key, ran_id);
                            }
                            kept
                        }
                        None => return,
                    }
                }
                None => ctx_arc,
            };
            let mut ctx = target.lock().unwrap();
            if !ctx.procedures.is_specific_running() {
                create_attach_procedure(&mut ctx, ies);
            }
            run_procedure(rt, &mut ctx);
        }
    }
}

/// Collision handling against whatever is already running on the context
fn handle_request_on_context(
    rt: &MmeRuntime,
    ctx: &mut EmmContext,
    ies: &AttachRequestIes,
    duplicate: bool,
) -> RequestOutcome {
    // An MME not supporting emergency bearer services rejects any
    // emergency attach outright.
    if ies.attach_type == AttachType::Emergency
        && !rt.config.network_feature.emergency_bearer_services
    {
        log::warn!("ue_id={} emergency attach not supported", ctx.ue_id);
        emm_sap_send(
            rt,
            ctx,
            EmmSap::Reg(EmmRegPrimitive {
                kind: EmmRegKind::AttachRej {
                    cause: Some(EmmCause::ImeiNotAccepted),
                },
                notify: true,
                free_proc: false,
            }),
        );
        return RequestOutcome::Done;
    }

    let prior_requests = ctx.num_attach_request;
    ctx.num_attach_request += 1;

    // A running GUTI reallocation means the stored GUTI can no longer be
    // trusted: drop the procedure and the GUTI-derived state.
    if ctx
        .procedures
        .is_common_running(CommonProcKind::GutiReallocation)
    {
        log::warn!(
            "ue_id={} attach collides with GUTI reallocation, clearing EMM context",
            ctx.ue_id
        );
        if let Some(proc) = ctx.procedures.remove_common(CommonProcKind::GutiReallocation) {
            if let Some(token) = proc.data().timer {
                rt.timers.stop(token);
            }
        }
        ctx.guti.clear();
        ctx.old_guti.clear();
        ctx.security = None;
        ctx.non_current_security = None;
        if let Err(e) = rt.index.rekey(
            ctx.id,
            KeyUpdates {
                guti: Some(None),
                ..Default::default()
            },
        ) {
            log::error!("ue_id={} cannot drop GUTI key: {}", ctx.ue_id, e);
        }
    }

    // A running security mode control procedure is aborted.
    if ctx
        .procedures
        .is_common_running(CommonProcKind::SecurityModeControl)
    {
        emm_sap_send(
            rt,
            ctx,
            EmmSap::Reg(EmmRegPrimitive {
                kind: EmmRegKind::CommonProcAbort(CommonProcKind::SecurityModeControl),
                notify: false,
                free_proc: true,
            }),
        );
    }

    // A running identification procedure.
    if ctx
        .procedures
        .is_common_running(CommonProcKind::Identification)
    {
        let requested_for_attach = matches!(
            ctx.procedures.common(CommonProcKind::Identification),
            Some(CommonProc::Identification(p)) if p.requested_for_attach
        );
        let attach_state = ctx.procedures.attach().map(|proc| {
            (
                proc.is_accept_sent() || proc.is_reject_sent(),
                ies_have_changed(ctx.ue_id, ies, &proc.ies),
            )
        });
        match attach_state {
            None => {
                // No specific procedure yet: one is created below and the
                // identification keeps running.
            }
            Some((true, _)) => {
                // Outcome already sent, nothing additional here.
            }
            Some((false, changed)) if requested_for_attach => {
                if changed {
                    emm_sap_send(
                        rt,
                        ctx,
                        EmmSap::Reg(EmmRegPrimitive {
                            kind: EmmRegKind::AttachAbort,
                            notify: true,
                            free_proc: true,
                        }),
                    );
                    // A fresh procedure is created below.
                } else {
                    log::info!(
                        "ue_id={} duplicate ATTACH REQUEST during identification ignored",
                        ctx.ue_id
                    );
                    return RequestOutcome::Done;
                }
            }
            Some(_) => {}
        }
    }

    // Abnormal cases for a request colliding with a running attach
    // (TS 24.301 section 5.5.1.2.7).
    let attach_state = ctx.procedures.attach().map(|proc| {
        (
            proc.is_accept_sent(),
            proc.is_complete_received(),
            ies_have_changed(ctx.ue_id, ies, &proc.ies),
        )
    });
    if let Some((accept_sent, complete_received, changed)) = attach_state {
        if accept_sent && !complete_received {
            // Case d: accept sent, complete outstanding.
            if changed {
                emm_sap_send(
                    rt,
                    ctx,
                    EmmSap::Reg(EmmRegPrimitive {
                        kind: EmmRegKind::AttachAbort,
                        notify: true,
                        free_proc: true,
                    }),
                );
                return RequestOutcome::Proceed {
                    resolve: duplicate.then_some(DuplicatePolicy::RemoveOldContext),
                };
            }
            // Identical request: resend the accept and restart T3450
            // without incrementing the retransmission counter.
            log::info!(
                "ue_id={} identical ATTACH REQUEST while accept in flight, resending",
                ctx.ue_id
            );
            if let Some(token) = ctx.procedures.attach_mut().and_then(|p| p.t3450.take()) {
                rt.timers.stop(token);
            }
            send_attach_accept(rt, ctx, false);
            return RequestOutcome::Done;
        } else if !accept_sent && prior_requests >= 1 {
            // Case e: more than one request, no outcome sent yet.
            if changed {
                emm_sap_send(
                    rt,
                    ctx,
                    EmmSap::Reg(EmmRegPrimitive {
                        kind: EmmRegKind::AttachAbort,
                        notify: false,
                        free_proc: true,
                    }),
                );
                return RequestOutcome::Proceed {
                    resolve: duplicate.then_some(DuplicatePolicy::RemoveNewContext),
                };
            }
            log::info!(
                "ue_id={} second identical ATTACH REQUEST ignored",
                ctx.ue_id
            );
            return RequestOutcome::Done;
        }
    }

    // Case f: the UE is already registered; treat as an implicit
    // re-attach on the same context.
    if ctx.fsm.state() == EmmState::Registered {
        log::info!("ue_id={} ATTACH REQUEST while registered, re-attaching", ctx.ue_id);
    }

    RequestOutcome::Proceed {
        resolve: duplicate.then_some(DuplicatePolicy::RemoveOldContext),
    }
}

/// Make a kept context the owner of the new eNB association, taking over
/// the incoming lower-layer id when the request carried a valid one.
fn adopt_association(
    rt: &MmeRuntime,
    kept: &std::sync::Arc<std::sync::Mutex<EmmContext>>,
    enb_key: EnbUeKey,
    ran_id: MmeUeS1apId,
) {
    let mut ctx = kept.lock().unwrap();
    ctx.enb_key = enb_key;
    if ran_id != INVALID_MME_UE_S1AP_ID && ctx.ue_id != ran_id {
        match rt.index.rekey(
            ctx.id,
            KeyUpdates {
                ran_id: Some(ran_id),
                ..Default::default()
            },
        ) {
            Ok(()) => {
                ctx.ue_id = ran_id;
                ctx.fsm.set_ue_id(ran_id);
            }
            Err(e) => log::error!("ue_id={} cannot adopt lower-layer id: {}", ctx.ue_id, e),
        }
    }
}

fn create_attach_procedure(ctx: &mut EmmContext, ies: AttachRequestIes) {
    // The capability is usable (but unconfirmed) as soon as the request is
    // frozen; the security mode command replays it.
    ctx.ue_network_capability.set(ies.ue_network_capability);
    let previous = ctx.fsm.state();
    match ctx.procedures.new_attach(ies, previous) {
        Ok(_) => ctx.fsm.transition(EmmState::CommonProcedureInitiated),
        Err(e) => log::error!("ue_id={} cannot create attach procedure: {}", ctx.ue_id, e),
    }
}

// ============================================================================
// Procedure Sequencing
// ============================================================================

/// Start the common procedures the request calls for (TS 24.301 section
/// 5.5.1.2.3): a MAC-verified IMSI goes straight to authentication, an
/// unverified IMSI or a GUTI is identified first, an IMEI-only request
/// would be an emergency attach and fails closed.
fn run_procedure(rt: &MmeRuntime, ctx: &mut EmmContext) {
    let Some(proc) = ctx.procedures.attach() else {
        return;
    };
    let imsi = proc.ies.imsi.clone();
    let mac_matched = proc.ies.decode_status.mac_matched;
    let has_guti = proc.ies.guti.is_some();
    let has_imei = proc.ies.imei.is_some();

    if let Some(imsi) = imsi {
        if mac_matched {
            ctx.imsi.set(imsi.clone());
            if let Err(e) = rt.index.rekey(
                ctx.id,
                KeyUpdates {
                    imsi: Some(imsi),
                    ..Default::default()
                },
            ) {
                log::error!("ue_id={} cannot index IMSI: {}", ctx.ue_id, e);
            }
            emm_common::start_authentication(
                rt,
                ctx,
                AttachStep::StartSecurityMode,
                AttachStep::Reject(EmmCause::IllegalUe),
            );
        } else {
            emm_common::start_identification(
                rt,
                ctx,
                IdentityType::Imsi,
                true,
                AttachStep::StartAuthentication,
                AttachStep::Reject(EmmCause::IllegalUe),
            );
        }
    } else if has_guti {
        emm_common::start_identification(
            rt,
            ctx,
            IdentityType::Imsi,
            true,
            AttachStep::StartAuthentication,
            AttachStep::Reject(EmmCause::IllegalUe),
        );
    } else if has_imei {
        // Emergency / IMEI-only attach is not supported.
        log::warn!("ue_id={} IMEI-only attach not supported", ctx.ue_id);
        run_step(rt, ctx, AttachStep::Reject(EmmCause::ImeiNotAccepted));
    } else {
        run_step(
            rt,
            ctx,
            AttachStep::Reject(EmmCause::ProtocolErrorUnspecified),
        );
    }
}

/// Resolve an attach continuation
pub(crate) fn run_step(rt: &MmeRuntime, ctx: &mut EmmContext, step: AttachStep) {
    match step {
        AttachStep::StartAuthentication => {
            emm_common::start_authentication(
                rt,
                ctx,
                AttachStep::StartSecurityMode,
                AttachStep::Reject(EmmCause::IllegalUe),
            );
        }
        AttachStep::StartSecurityMode => {
            let ksi = ctx.procedures.attach().map(|p| p.ksi).unwrap_or(0);
            emm_common::start_security_mode_control(
                rt,
                ctx,
                ksi,
                AttachStep::Attach,
                AttachStep::Release,
            );
        }
        AttachStep::Attach => attach(rt, ctx),
        AttachStep::Reject(cause) => {
            emm_sap_send(
                rt,
                ctx,
                EmmSap::Reg(EmmRegPrimitive {
                    kind: EmmRegKind::AttachRej { cause: Some(cause) },
                    notify: true,
                    free_proc: true,
                }),
            );
        }
        AttachStep::Release => release(rt, ctx),
        AttachStep::Stop => {}
    }
}

/// All common procedures succeeded: hand the embedded ESM message to the
/// session management sublayer, then send the accept.
fn attach(rt: &MmeRuntime, ctx: &mut EmmContext) {
    let Some(esm_msg) = ctx.procedures.attach().map(|p| p.ies.esm_msg.clone()) else {
        return;
    };
    if esm_msg.is_empty() {
        send_attach_accept(rt, ctx, true);
        return;
    }

    let primitive = EsmSapPrimitive::UnitdataInd {
        ue: ctx.id,
        msg: esm_msg,
    };
    let outcome = emm_sap_send(rt, ctx, EmmSap::Esm(primitive));
    let SapOutcome::Esm(response) = outcome else {
        return;
    };
    match response.status {
        EsmSapStatus::Success => {
            if let Some(proc) = ctx.procedures.attach_mut() {
                proc.esm_msg_out = response.reply;
            }
            send_attach_accept(rt, ctx, true);
        }
        EsmSapStatus::Discarded => {
            log::info!("ue_id={} embedded ESM message discarded", ctx.ue_id);
        }
        EsmSapStatus::Failed => {
            if let Some(proc) = ctx.procedures.attach_mut() {
                proc.emm_cause = Some(EmmCause::EsmFailure);
                proc.esm_msg_out = response.reply;
            }
            emm_sap_send(
                rt,
                ctx,
                EmmSap::Reg(EmmRegPrimitive {
                    kind: EmmRegKind::AttachRej { cause: None },
                    notify: true,
                    free_proc: true,
                }),
            );
        }
    }
}

// ============================================================================
// Accept Emission
// ============================================================================

/// Update the context from the frozen request IEs while the accept is
/// being prepared.
fn attach_update(rt: &MmeRuntime, ctx: &mut EmmContext) {
    let Some(ies) = ctx.procedures.attach().map(|p| p.ies.clone()) else {
        return;
    };

    ctx.is_emergency = ies.attach_type == AttachType::Emergency;
    if ctx.ksi != ies.ksi {
        log::trace!("ue_id={} update KSI {} -> {}", ctx.ue_id, ctx.ksi, ies.ksi);
        ctx.ksi = ies.ksi;
    }

    ctx.ue_network_capability.set_valid(ies.ue_network_capability);
    match ies.ms_network_capability {
        Some(capability) => ctx.ms_network_capability.set_valid(capability),
        None => ctx.ms_network_capability.clear(),
    }
    if let Some(drx) = ies.drx_parameter {
        ctx.drx_parameter.set_valid(drx);
    }
    match ies.last_visited_registered_tai {
        Some(tai) => ctx.last_visited_registered_tai.set_valid(tai),
        None => ctx.last_visited_registered_tai.clear(),
    }
    ctx.originating_tai = ies.originating_tai;
    ctx.originating_ecgi = ies.originating_ecgi;

    // A GUTI carried by the UE becomes the old GUTI and an index key.
    if let Some(guti) = ies.guti {
        if ctx.old_guti.value() != Some(&guti) {
            ctx.old_guti.set(guti);
            if let Err(e) = rt.index.rekey(
                ctx.id,
                KeyUpdates {
                    guti: Some(Some(guti)),
                    ..Default::default()
                },
            ) {
                log::error!("ue_id={} cannot index old GUTI: {}", ctx.ue_id, e);
            }
        }
    }

    if let Some(imsi) = ies.imsi {
        if ctx.imsi.value() != Some(&imsi) {
            ctx.imsi.set_valid(imsi.clone());
            if let Err(e) = rt.index.rekey(
                ctx.id,
                KeyUpdates {
                    imsi: Some(imsi),
                    ..Default::default()
                },
            ) {
                log::error!("ue_id={} cannot index IMSI: {}", ctx.ue_id, e);
            }
        } else {
            ctx.imsi.validate();
        }
    }

    if let Some(imei) = ies.imei {
        ctx.imei.set_valid(imei);
    }
}

/// Send the ATTACH ACCEPT and (re)start T3450. `count_transmission` is
/// false only for the identical-duplicate resend, which must not touch the
/// retransmission counter.
pub(crate) fn send_attach_accept(rt: &MmeRuntime, ctx: &mut EmmContext, count_transmission: bool) {
    if ctx.procedures.attach().is_none() {
        log::warn!("ue_id={} no attach procedure for accept", ctx.ue_id);
        return;
    }

    attach_update(rt, ctx);

    if !ctx.guti.is_present() {
        let Some(imsi) = ctx.imsi.value().cloned() else {
            log::error!("ue_id={} cannot allocate GUTI without IMSI", ctx.ue_id);
            run_step(rt, ctx, AttachStep::Reject(EmmCause::IllegalUe));
            return;
        };
        let old_guti = ctx.old_guti.value().copied();
        let (guti, tai_list) =
            rt.allocate_guti(&imsi, old_guti.as_ref(), ctx.originating_tai.as_ref());
        ctx.guti.set(guti);
        ctx.guti_is_new = true;
        ctx.tai_list.set_valid(tai_list);
    }

    let Some(&guti) = ctx.guti.value() else {
        return;
    };
    // A present-but-unconfirmed GUTI is an implicit reallocation: the
    // accept carries it for the UE to take into use.
    let new_guti = if ctx.guti.is_valid() { None } else { Some(guti) };
    let tai_list = ctx.tai_list.valid().cloned().unwrap_or_default();
    let security = EmmAsSecurityData::from_context(ctx.security.as_ref(), false);
    let (encryption, integrity) = ctx
        .security
        .as_ref()
        .map(|sc| {
            (
                sc.selected_algorithms.encryption,
                sc.selected_algorithms.integrity,
            )
        })
        .unwrap_or((0, 0));
    let nas_msg = ctx.procedures.attach().and_then(|p| p.esm_msg_out.clone());

    let cnf = EstablishCnf {
        ue_id: ctx.ue_id,
        guti,
        new_guti,
        tai_list,
        eps_network_feature_support: rt.config.network_feature.to_octet(),
        security,
        encryption,
        integrity,
        nas_msg,
        t3402: Duration::from_secs(rt.config.timer.t3402),
    };
    emm_sap_send(rt, ctx, EmmSap::As(EmmAsPrimitive::EstablishCnf(cnf)));

    let token = rt.timers.start(
        TimerId::T3450,
        TimerId::T3450.duration(&rt.config.timer),
        ctx.id,
    );
    let Some(proc) = ctx.procedures.attach_mut() else {
        rt.timers.stop(token);
        return;
    };
    proc.guti = Some(guti);
    if count_transmission {
        proc.attach_accept_sent += 1;
    }
    if let Some(previous) = proc.t3450.replace(token) {
        rt.timers.stop(previous);
    }
    ctx.fsm.transition(EmmState::RegisteredInitiated);
}

// ============================================================================
// T3450
// ============================================================================

/// T3450 expiry (TS 24.301 section 5.5.1.2.7 case c): retransmit the
/// accept, aborting the procedure on the fifth expiry.
pub fn on_t3450_expiry(rt: &MmeRuntime, expiry: TimerExpiry) {
    let Some(ctx_arc) = rt.index.find(expiry.ue) else {
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    let ue_id = ctx.ue_id;
    let Some(proc) = ctx.procedures.attach_mut() else {
        return;
    };
    if proc.t3450 != Some(expiry.token) {
        log::debug!("ue_id={} stale T3450 expiry ignored", ue_id);
        return;
    }
    proc.t3450 = None;
    let sent = proc.attach_accept_sent;
    log::warn!(
        "ue_id={} T3450 expired, retransmission counter = {}",
        ue_id,
        sent
    );
    if sent < NAS_RETX_MAX {
        send_attach_accept(rt, &mut ctx, true);
    } else {
        emm_sap_send(
            rt,
            &mut ctx,
            EmmSap::Reg(EmmRegPrimitive {
                kind: EmmRegKind::AttachAbort,
                notify: true,
                free_proc: true,
            }),
        );
    }
}

// ============================================================================
// Abort / Release
// ============================================================================

/// Abort the running attach procedure: tell ESM that PDN connectivity was
/// locally refused, stop every timer in the subtree and drop it. No
/// message is sent to the UE.
pub(crate) fn abort_attach_procedure(rt: &MmeRuntime, ctx: &mut EmmContext) {
    if ctx.procedures.attach().is_none() {
        return;
    }
    log::warn!("ue_id={} aborting attach procedure", ctx.ue_id);
    let primitive = EsmSapPrimitive::PdnConnectivityRej { ue: ctx.id };
    emm_sap_send(rt, ctx, EmmSap::Esm(primitive));
    let tokens = ctx.procedures.take_all_timers();
    for token in tokens {
        rt.timers.stop(token);
    }
    ctx.procedures.remove_specific();
    ctx.fsm.transition(EmmState::Deregistered);
}

/// Release the context data of a failed attach. A context that never
/// reached EMM-REGISTERED is purged from the identifier index.
fn release(rt: &MmeRuntime, ctx: &mut EmmContext) {
    log::warn!("ue_id={} releasing UE context data", ctx.ue_id);
    let tokens = ctx.procedures.take_all_timers();
    for token in tokens {
        rt.timers.stop(token);
    }
    ctx.procedures.remove_specific();
    ctx.release_identities();
    ctx.fsm.transition(EmmState::Deregistered);
    if !ctx.ever_registered {
        rt.index.remove(ctx.id);
    }
}

// ============================================================================
// Entry Point: ATTACH COMPLETE
// ============================================================================

/// ATTACH COMPLETE (TS 24.301 section 5.5.1.2.4): stop T3450, take the
/// GUTI sent in the accept into use and confirm the default bearer
/// activation towards ESM.
pub fn on_attach_complete(
    rt: &MmeRuntime,
    ran_id: MmeUeS1apId,
    esm_msg: Bytes,
    _decode_status: NasDecodeStatus,
) {
    let Some(ctx_arc) = rt.index.lookup_by_ran_id(ran_id) else {
        log::info!("UE {} ATTACH COMPLETE discarded (context not found)", ran_id);
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();

    let Some(proc) = ctx.procedures.attach_mut() else {
        log::info!(
            "UE {} ATTACH COMPLETE discarded (EMM procedure not found)",
            ran_id
        );
        return;
    };
    let Some(guti) = proc.guti else {
        log::warn!("UE {} ATTACH COMPLETE without accept in flight", ran_id);
        return;
    };
    proc.attach_complete_received = true;

    // The GUTI sent in the ATTACH ACCEPT is now valid; deleting the
    // procedure stops T3450.
    ctx.guti.set_valid(guti);
    let tokens = ctx.procedures.take_all_timers();
    for token in tokens {
        rt.timers.stop(token);
    }
    ctx.procedures.remove_specific();
    if let Err(e) = rt.index.rekey(
        ctx.id,
        KeyUpdates {
            guti: Some(Some(guti)),
            ..Default::default()
        },
    ) {
        log::error!("ue_id={} cannot index new GUTI: {}", ctx.ue_id, e);
    }
    ctx.old_guti.clear();
    ctx.guti_is_new = false;

    // Forward the Activate Default EPS Bearer Context Accept to ESM.
    let primitive = EsmSapPrimitive::DefaultEpsBearerContextActivateCnf {
        ue: ctx.id,
        msg: esm_msg,
    };
    let outcome = emm_sap_send(rt, &mut ctx, EmmSap::Esm(primitive));
    let SapOutcome::Esm(response) = outcome else {
        return;
    };
    match response.status {
        EsmSapStatus::Success => {
            ctx.is_attached = true;
            emm_sap_send(
                rt,
                &mut ctx,
                EmmSap::Reg(EmmRegPrimitive {
                    kind: EmmRegKind::AttachCnf,
                    notify: true,
                    free_proc: true,
                }),
            );
        }
        EsmSapStatus::Failed => {
            emm_sap_send(
                rt,
                &mut ctx,
                EmmSap::Reg(EmmRegPrimitive {
                    kind: EmmRegKind::AttachRej { cause: None },
                    notify: true,
                    free_proc: true,
                }),
            );
        }
        EsmSapStatus::Discarded => {
            log::info!("ue_id={} bearer activation reply discarded", ctx.ue_id);
        }
    }
}

// ============================================================================
// Entry Point: Protocol Error
// ============================================================================

/// A lower-layer decode error on an ATTACH REQUEST (TS 24.301 section
/// 5.5.1.2.7 case b): answer with an ATTACH REJECT carrying the cause.
pub fn on_attach_reject_from_protocol_error(
    rt: &MmeRuntime,
    ran_id: MmeUeS1apId,
    cause: EmmCause,
) {
    let Some(ctx_arc) = rt.index.lookup_by_ran_id(ran_id) else {
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    if ctx.procedures.attach().is_none() {
        return;
    }
    emm_sap_send(
        rt,
        &mut ctx,
        EmmSap::Reg(EmmRegPrimitive {
            kind: EmmRegKind::AttachRej { cause: Some(cause) },
            notify: true,
            free_proc: true,
        }),
    );
}
