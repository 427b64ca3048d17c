//! EMM Common Procedures
//!
//! Identification, authentication and security mode control as the attach
//! procedure drives them. Starting one arms its retransmission timer and
//! emits the request towards the UE; the uplink completion handler stops
//! the timer, deletes the node and yields back to the parent through the
//! recorded continuation.

use crate::attach;
use crate::context::{EmmContext, Imei, Imsi, KeyUpdates, MmeUeS1apId};
use crate::emm_sap::{
    emm_sap_send, EmmAsPrimitive, EmmAsSecurityData, EmmCause, EmmSap, NasDownlinkRequest,
    SecurityReq,
};
use crate::mme_api::MmeRuntime;
use crate::nas_security::{select_algorithms, SecurityContext, KSI_NO_KEY_AVAILABLE};
use crate::procedures::{
    AttachStep, AuthenticationProc, CommonProc, CommonProcData, CommonProcKind, IdentificationProc,
    IdentityType, SecurityModeProc,
};
use crate::timer::{TimerExpiry, TimerId, NAS_RETX_MAX};

// ============================================================================
// Identification
// ============================================================================

/// Start the identification common procedure. If one is already running it
/// is adopted: the continuations are replaced and no new request is sent.
pub fn start_identification(
    rt: &MmeRuntime,
    ctx: &mut EmmContext,
    identity_type: IdentityType,
    requested_for_attach: bool,
    on_success: AttachStep,
    on_failure: AttachStep,
) {
    if let Some(CommonProc::Identification(proc)) =
        ctx.procedures.common_mut(CommonProcKind::Identification)
    {
        proc.requested_for_attach |= requested_for_attach;
        proc.data.on_success = on_success;
        proc.data.on_failure = on_failure;
        log::debug!("ue_id={} identification already running, adopted", ctx.ue_id);
        return;
    }

    log::info!(
        "ue_id={} EMM-PROC identification initiated type={:?}",
        ctx.ue_id,
        identity_type
    );
    let mut data = CommonProcData::new(ctx.fsm.state(), on_success, on_failure);
    data.timer = Some(rt.timers.start(
        TimerId::T3470,
        TimerId::T3470.duration(&rt.config.timer),
        ctx.id,
    ));
    data.retransmission_count = 1;
    ctx.procedures
        .start_common(CommonProc::Identification(IdentificationProc {
            data,
            identity_type,
            requested_for_attach,
        }))
        .expect("identification not running");

    emit_identity_request(rt, ctx, identity_type);
}

fn emit_identity_request(rt: &MmeRuntime, ctx: &mut EmmContext, identity_type: IdentityType) {
    let req = SecurityReq {
        ue_id: ctx.ue_id,
        request: NasDownlinkRequest::IdentityRequest { identity_type },
        security: EmmAsSecurityData::from_context(ctx.security.as_ref(), false),
    };
    emm_sap_send(rt, ctx, EmmSap::As(EmmAsPrimitive::SecurityReq(req)));
}

/// IDENTITY RESPONSE carrying an IMSI
pub fn on_identity_response(rt: &MmeRuntime, ctx: &mut EmmContext, imsi: Imsi) {
    let Some(proc) = ctx.procedures.remove_common(CommonProcKind::Identification) else {
        log::info!("ue_id={} IDENTITY RESPONSE discarded (no procedure)", ctx.ue_id);
        return;
    };
    if let Some(token) = proc.data().timer {
        rt.timers.stop(token);
    }
    log::info!("ue_id={} identified as imsi {}", ctx.ue_id, imsi);

    ctx.imsi.set_valid(imsi.clone());
    if let Err(e) = rt.index.rekey(
        ctx.id,
        KeyUpdates {
            imsi: Some(imsi),
            ..Default::default()
        },
    ) {
        log::error!("ue_id={} failed to index identified IMSI: {}", ctx.ue_id, e);
        attach::run_step(rt, ctx, proc.data().on_failure);
        return;
    }
    attach::run_step(rt, ctx, proc.data().on_success);
}

// ============================================================================
// Authentication
// ============================================================================

/// Start the authentication common procedure using the vector already on
/// the context or one fetched from the vector source.
pub fn start_authentication(
    rt: &MmeRuntime,
    ctx: &mut EmmContext,
    on_success: AttachStep,
    on_failure: AttachStep,
) {
    if ctx.auth_vector.is_none() {
        let fetched = ctx
            .imsi
            .value()
            .and_then(|imsi| rt.vectors.authentication_vector(imsi));
        match fetched {
            Some(vector) => ctx.auth_vector = Some(vector),
            None => {
                log::warn!("ue_id={} no authentication vector, rejecting attach", ctx.ue_id);
                attach::run_step(rt, ctx, AttachStep::Reject(EmmCause::NetworkFailure));
                return;
            }
        }
    }

    if ctx
        .procedures
        .is_common_running(CommonProcKind::Authentication)
    {
        log::warn!("ue_id={} authentication already running", ctx.ue_id);
        return;
    }

    let ksi = if ctx.ksi == KSI_NO_KEY_AVAILABLE { 0 } else { ctx.ksi };
    log::info!("ue_id={} EMM-PROC authentication initiated ksi={}", ctx.ue_id, ksi);

    let mut data = CommonProcData::new(ctx.fsm.state(), on_success, on_failure);
    data.timer = Some(rt.timers.start(
        TimerId::T3460,
        TimerId::T3460.duration(&rt.config.timer),
        ctx.id,
    ));
    data.retransmission_count = 1;
    ctx.procedures
        .start_common(CommonProc::Authentication(AuthenticationProc { data, ksi }))
        .expect("authentication not running");

    emit_authentication_request(rt, ctx, ksi);
}

fn emit_authentication_request(rt: &MmeRuntime, ctx: &mut EmmContext, ksi: u8) {
    let Some(vector) = ctx.auth_vector.as_ref() else {
        return;
    };
    let req = SecurityReq {
        ue_id: ctx.ue_id,
        request: NasDownlinkRequest::AuthenticationRequest {
            ksi,
            rand: vector.rand,
            autn: vector.autn,
        },
        security: EmmAsSecurityData::from_context(ctx.security.as_ref(), false),
    };
    emm_sap_send(rt, ctx, EmmSap::As(EmmAsPrimitive::SecurityReq(req)));
}

/// AUTHENTICATION RESPONSE: compare RES against the expected XRES
pub fn on_authentication_response(rt: &MmeRuntime, ctx: &mut EmmContext, res: &[u8]) {
    if !ctx
        .procedures
        .is_common_running(CommonProcKind::Authentication)
    {
        log::info!(
            "ue_id={} AUTHENTICATION RESPONSE discarded (no procedure)",
            ctx.ue_id
        );
        return;
    }
    let matched = match ctx.auth_vector.as_ref() {
        Some(vector) => !res.is_empty() && res == vector.xres.as_slice(),
        None => false,
    };
    let proc = ctx
        .procedures
        .remove_common(CommonProcKind::Authentication)
        .expect("checked running");
    if let Some(token) = proc.data().timer {
        rt.timers.stop(token);
    }
    if matched {
        log::info!("ue_id={} authentication successful", ctx.ue_id);
        attach::run_step(rt, ctx, proc.data().on_success);
    } else {
        log::warn!("ue_id={} authentication response mismatch", ctx.ue_id);
        attach::run_step(rt, ctx, proc.data().on_failure);
    }
}

// ============================================================================
// Security Mode Control
// ============================================================================

/// Start the security mode control common procedure: select algorithms for
/// the UE's capability, derive a fresh non-current NAS security context and
/// command the UE to take it into use.
pub fn start_security_mode_control(
    rt: &MmeRuntime,
    ctx: &mut EmmContext,
    ksi: u8,
    on_success: AttachStep,
    on_failure: AttachStep,
) {
    if ctx
        .procedures
        .is_common_running(CommonProcKind::SecurityModeControl)
    {
        log::warn!("ue_id={} security mode control already running", ctx.ue_id);
        return;
    }
    let Some(kasme) = ctx.auth_vector.as_ref().map(|v| v.kasme) else {
        log::warn!("ue_id={} security mode control without vector", ctx.ue_id);
        attach::run_step(rt, ctx, AttachStep::Reject(EmmCause::IllegalUe));
        return;
    };

    // A new NAS security context replaces whatever was in use.
    ctx.clear_security();

    let capability = ctx
        .ue_network_capability
        .value()
        .map(Into::into)
        .unwrap_or_default();
    let selected = select_algorithms(
        &capability,
        &rt.config.ciphering_order,
        &rt.config.integrity_order,
    );
    let eksi = if ksi == KSI_NO_KEY_AVAILABLE { 0 } else { ksi };
    ctx.non_current_security = Some(SecurityContext::from_kasme(eksi, kasme, capability, selected));

    log::info!(
        "ue_id={} EMM-PROC security mode control initiated eea{} eia{}",
        ctx.ue_id,
        selected.encryption,
        selected.integrity
    );

    let mut data = CommonProcData::new(ctx.fsm.state(), on_success, on_failure);
    data.timer = Some(rt.timers.start(
        TimerId::T3460,
        TimerId::T3460.duration(&rt.config.timer),
        ctx.id,
    ));
    data.retransmission_count = 1;
    ctx.procedures
        .start_common(CommonProc::SecurityModeControl(SecurityModeProc {
            data,
            ksi: eksi,
        }))
        .expect("security mode control not running");

    emit_security_mode_command(rt, ctx);
}

fn emit_security_mode_command(rt: &MmeRuntime, ctx: &mut EmmContext) {
    let Some(sc) = ctx.non_current_security.as_ref() else {
        return;
    };
    let req = SecurityReq {
        ue_id: ctx.ue_id,
        request: NasDownlinkRequest::SecurityModeCommand {
            ksi: sc.eksi,
            selected_algorithms: sc.selected_algorithms,
            replayed_capability: sc.capability,
        },
        security: EmmAsSecurityData::from_context(ctx.non_current_security.as_ref(), true),
    };
    emm_sap_send(rt, ctx, EmmSap::As(EmmAsPrimitive::SecurityReq(req)));
}

/// SECURITY MODE COMPLETE: take the new context into use
pub fn on_security_mode_complete(rt: &MmeRuntime, ctx: &mut EmmContext, imeisv: Option<Imei>) {
    let Some(proc) = ctx
        .procedures
        .remove_common(CommonProcKind::SecurityModeControl)
    else {
        log::info!(
            "ue_id={} SECURITY MODE COMPLETE discarded (no procedure)",
            ctx.ue_id
        );
        return;
    };
    if let Some(token) = proc.data().timer {
        rt.timers.stop(token);
    }
    if let Some(imeisv) = imeisv {
        ctx.imei.set_valid(imeisv);
    }
    ctx.promote_non_current_security();
    log::info!("ue_id={} NAS security activated", ctx.ue_id);
    attach::run_step(rt, ctx, proc.data().on_success);
}

/// SECURITY MODE REJECT from the UE
pub fn on_security_mode_reject(rt: &MmeRuntime, ctx: &mut EmmContext) {
    let Some(proc) = ctx
        .procedures
        .remove_common(CommonProcKind::SecurityModeControl)
    else {
        return;
    };
    if let Some(token) = proc.data().timer {
        rt.timers.stop(token);
    }
    log::warn!("ue_id={} security mode rejected by UE", ctx.ue_id);
    ctx.non_current_security = None;
    attach::run_step(rt, ctx, proc.data().on_failure);
}

// ============================================================================
// Timer handling
// ============================================================================

/// T3460/T3470 expiry. The token must still match the owning procedure's
/// armed handle; a stale expiry that raced a stop is discarded.
pub fn on_timer_expiry(rt: &MmeRuntime, expiry: TimerExpiry) {
    let Some(ctx_arc) = rt.index.find(expiry.ue) else {
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    let kind = match expiry.timer_id {
        TimerId::T3470 => CommonProcKind::Identification,
        TimerId::T3460 => {
            // T3460 guards both authentication and security mode control;
            // the token decides which one fired.
            if owns_token(&ctx, CommonProcKind::Authentication, expiry) {
                CommonProcKind::Authentication
            } else {
                CommonProcKind::SecurityModeControl
            }
        }
        _ => return,
    };
    if !owns_token(&ctx, kind, expiry) {
        log::debug!("ue_id={} stale {} expiry ignored", ctx.ue_id, expiry.timer_id.name());
        return;
    }

    let (count, on_failure) = {
        let proc = ctx.procedures.common_mut(kind).expect("owner checked");
        let data = proc.data_mut();
        data.timer = None;
        (data.retransmission_count, data.on_failure)
    };

    if count < NAS_RETX_MAX {
        log::warn!(
            "ue_id={} {} expired, retransmission counter = {}",
            ctx.ue_id,
            expiry.timer_id.name(),
            count
        );
        let token = rt.timers.start(
            expiry.timer_id,
            expiry.timer_id.duration(&rt.config.timer),
            ctx.id,
        );
        {
            let proc = ctx.procedures.common_mut(kind).expect("owner checked");
            let data = proc.data_mut();
            data.timer = Some(token);
            data.retransmission_count += 1;
        }
        match kind {
            CommonProcKind::Identification => {
                let identity_type = match ctx.procedures.common(kind) {
                    Some(CommonProc::Identification(p)) => p.identity_type,
                    _ => IdentityType::Imsi,
                };
                emit_identity_request(rt, &mut ctx, identity_type);
            }
            CommonProcKind::Authentication => {
                let ksi = match ctx.procedures.common(kind) {
                    Some(CommonProc::Authentication(p)) => p.ksi,
                    _ => 0,
                };
                emit_authentication_request(rt, &mut ctx, ksi);
            }
            CommonProcKind::SecurityModeControl => emit_security_mode_command(rt, &mut ctx),
            CommonProcKind::GutiReallocation => {}
        }
    } else {
        log::warn!(
            "ue_id={} {} expired {} times, aborting {}",
            ctx.ue_id,
            expiry.timer_id.name(),
            count,
            kind
        );
        ctx.procedures.remove_common(kind);
        attach::run_step(rt, &mut ctx, on_failure);
    }
}

fn owns_token(ctx: &EmmContext, kind: CommonProcKind, expiry: TimerExpiry) -> bool {
    ctx.procedures
        .common(kind)
        .map(|p| p.data().timer == Some(expiry.token))
        .unwrap_or(false)
}

// ============================================================================
// Uplink entry points (by lower-layer id)
// ============================================================================

/// IDENTITY RESPONSE received from the access layer
pub fn identification_complete(rt: &MmeRuntime, ran_id: MmeUeS1apId, imsi: Imsi) {
    let Some(ctx_arc) = rt.index.lookup_by_ran_id(ran_id) else {
        log::info!("UE {} IDENTITY RESPONSE discarded (context not found)", ran_id);
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    on_identity_response(rt, &mut ctx, imsi);
}

/// AUTHENTICATION RESPONSE received from the access layer
pub fn authentication_complete(rt: &MmeRuntime, ran_id: MmeUeS1apId, res: &[u8]) {
    let Some(ctx_arc) = rt.index.lookup_by_ran_id(ran_id) else {
        log::info!(
            "UE {} AUTHENTICATION RESPONSE discarded (context not found)",
            ran_id
        );
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    on_authentication_response(rt, &mut ctx, res);
}

/// SECURITY MODE COMPLETE received from the access layer
pub fn security_mode_complete(rt: &MmeRuntime, ran_id: MmeUeS1apId, imeisv: Option<Imei>) {
    let Some(ctx_arc) = rt.index.lookup_by_ran_id(ran_id) else {
        log::info!(
            "UE {} SECURITY MODE COMPLETE discarded (context not found)",
            ran_id
        );
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    on_security_mode_complete(rt, &mut ctx, imeisv);
}

/// SECURITY MODE REJECT received from the access layer
pub fn security_mode_reject(rt: &MmeRuntime, ran_id: MmeUeS1apId) {
    let Some(ctx_arc) = rt.index.lookup_by_ran_id(ran_id) else {
        return;
    };
    let mut ctx = ctx_arc.lock().unwrap();
    on_security_mode_reject(rt, &mut ctx);
}
