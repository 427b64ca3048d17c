//! End-to-end attach scenarios
//!
//! Drives the public dispatcher entry points with a recording access
//! stratum sink and a scripted ESM collaborator, and checks the visible
//! outcomes: emitted downlink primitives, context state, identifier index
//! contents and timer bookkeeping.

use bytes::Bytes;
use epc_mmed::attach::{self, AttachRequestIes, AttachType};
use epc_mmed::config::MmeConfig;
use epc_mmed::context::{
    AuthVector, EnbUeKey, Imei, Imsi, MmeUeS1apId, UeNetworkCapability, INVALID_MME_UE_S1AP_ID,
};
use epc_mmed::emm_common;
use epc_mmed::emm_sap::{
    EmmAsPrimitive, EmmCause, NasDecodeStatus, NasDownlinkRequest, RecordingSink,
};
use epc_mmed::esm_sap::{EsmSapPrimitive, EsmSapResponse, ScriptedEsm};
use epc_mmed::mme_api::{AuthVectorSource, MmeRuntime};
use epc_mmed::sm::EmmState;
use epc_mmed::timer::{TimerExpiry, TimerId};
use std::sync::Arc;

const XRES: [u8; 8] = [0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe];

struct TestVectors;

impl AuthVectorSource for TestVectors {
    fn authentication_vector(&self, _imsi: &Imsi) -> Option<AuthVector> {
        Some(AuthVector {
            rand: [0x11; 16],
            autn: [0x22; 16],
            xres: XRES.to_vec(),
            kasme: [0x33; 32],
        })
    }
}

struct Harness {
    rt: MmeRuntime,
    sink: Arc<RecordingSink>,
    esm: Arc<ScriptedEsm>,
}

fn harness_with(esm: ScriptedEsm, config: MmeConfig) -> Harness {
    let sink = Arc::new(RecordingSink::new());
    let esm = Arc::new(esm);
    let rt = MmeRuntime::new(config, sink.clone(), esm.clone())
        .with_vector_source(Arc::new(TestVectors));
    Harness { rt, sink, esm }
}

fn harness() -> Harness {
    harness_with(ScriptedEsm::new(), MmeConfig::default())
}

fn enb_key(n: u32) -> EnbUeKey {
    EnbUeKey {
        enb_id: 0x1001,
        enb_ue_s1ap_id: n,
    }
}

fn imsi() -> Imsi {
    Imsi::from_bcd("001010123456789").unwrap()
}

fn base_request() -> AttachRequestIes {
    AttachRequestIes {
        is_initial: true,
        attach_type: AttachType::Eps,
        ksi: 7,
        imsi: Some(imsi()),
        ue_network_capability: UeNetworkCapability {
            eea: 0xe0,
            eia: 0x60,
            ..Default::default()
        },
        esm_msg: Bytes::from_static(&[0x52, 0x01, 0xd0]),
        decode_status: NasDecodeStatus {
            mac_matched: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn ran_id_of(h: &Harness) -> MmeUeS1apId {
    h.rt.index
        .lookup_by_imsi(&imsi())
        .expect("context indexed by IMSI")
        .lock()
        .unwrap()
        .ue_id
}

fn establish_cnfs(h: &Harness) -> Vec<epc_mmed::emm_sap::EstablishCnf> {
    h.sink
        .delivered()
        .into_iter()
        .filter_map(|p| match p {
            EmmAsPrimitive::EstablishCnf(cnf) => Some(cnf),
            _ => None,
        })
        .collect()
}

fn downlink_requests(h: &Harness) -> Vec<NasDownlinkRequest> {
    h.sink
        .delivered()
        .into_iter()
        .filter_map(|p| match p {
            EmmAsPrimitive::SecurityReq(req) => Some(req.request),
            _ => None,
        })
        .collect()
}

/// Run a fresh attach up to the point where the accept has been sent
fn drive_to_accept(h: &Harness) -> MmeUeS1apId {
    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, base_request());
    let ran_id = ran_id_of(h);
    emm_common::authentication_complete(&h.rt, ran_id, &XRES);
    emm_common::security_mode_complete(&h.rt, ran_id, None);
    ran_id
}

// ============================================================================
// Scenario: happy path
// ============================================================================

#[test]
fn test_happy_path_attach() {
    let h = harness();
    let ran_id = drive_to_accept(&h);

    // Authentication then security mode control ran, in order.
    let requests = downlink_requests(&h);
    assert_eq!(requests.len(), 2);
    assert!(matches!(
        requests[0],
        NasDownlinkRequest::AuthenticationRequest { .. }
    ));
    assert!(matches!(
        requests[1],
        NasDownlinkRequest::SecurityModeCommand { .. }
    ));

    // The accept carries a freshly allocated GUTI and the ESM reply.
    let cnfs = establish_cnfs(&h);
    assert_eq!(cnfs.len(), 1);
    let cnf = &cnfs[0];
    assert!(cnf.new_guti.is_some());
    assert!(cnf.security.is_some());
    assert!(!cnf.tai_list.is_empty());
    assert_eq!(cnf.nas_msg.as_ref().unwrap(), &Bytes::from_static(&[0x02]));
    let accept_guti = cnf.guti;

    {
        let ctx_arc = h.rt.index.lookup_by_ran_id(ran_id).unwrap();
        let ctx = ctx_arc.lock().unwrap();
        assert_eq!(ctx.fsm.state(), EmmState::RegisteredInitiated);
        assert_eq!(ctx.procedures.attach().unwrap().attach_accept_sent, 1);
        assert!(ctx.security.as_ref().unwrap().activated);
    }
    assert_eq!(h.rt.timers.armed_count(), 1);

    attach::on_attach_complete(
        &h.rt,
        ran_id,
        Bytes::from_static(&[0xc2]),
        NasDecodeStatus::default(),
    );

    let ctx_arc = h.rt.index.lookup_by_guti(&accept_guti).expect("by new GUTI");
    let ctx = ctx_arc.lock().unwrap();
    assert_eq!(ctx.fsm.state(), EmmState::Registered);
    assert!(ctx.is_attached);
    assert_eq!(ctx.guti.valid(), Some(&accept_guti));
    assert!(!ctx.procedures.is_specific_running());
    assert_eq!(h.rt.timers.armed_count(), 0);
}

// ============================================================================
// Scenario: identical duplicate while accept in flight
// ============================================================================

#[test]
fn test_identical_duplicate_resends_accept() {
    let h = harness();
    let ran_id = drive_to_accept(&h);

    let mut replay = base_request();
    replay.is_initial = false;
    attach::on_attach_request(&h.rt, enb_key(1), ran_id, replay);

    // Accept resent, retransmission counter untouched, timer restarted,
    // no new procedure, single context.
    assert_eq!(establish_cnfs(&h).len(), 2);
    assert_eq!(h.rt.timers.armed_count(), 1);
    assert_eq!(h.rt.index.len(), 1);
    let ctx_arc = h.rt.index.lookup_by_ran_id(ran_id).unwrap();
    let ctx = ctx_arc.lock().unwrap();
    assert_eq!(ctx.procedures.attach().unwrap().attach_accept_sent, 1);
    assert_eq!(ctx.fsm.state(), EmmState::RegisteredInitiated);
}

// ============================================================================
// Scenario: IE drift while accept in flight
// ============================================================================

#[test]
fn test_ie_drift_aborts_and_restarts() {
    let h = harness();
    let ran_id = drive_to_accept(&h);

    let mut replay = base_request();
    replay.is_initial = false;
    replay.ksi = 6;
    attach::on_attach_request(&h.rt, enb_key(1), ran_id, replay);

    // The old procedure was aborted (ESM told PDN connectivity was
    // refused) and a new one created with the drifted KSI.
    assert!(h
        .esm
        .received()
        .iter()
        .any(|p| matches!(p, EsmSapPrimitive::PdnConnectivityRej { .. })));
    {
        let ctx_arc = h.rt.index.lookup_by_ran_id(ran_id).unwrap();
        let ctx = ctx_arc.lock().unwrap();
        let proc = ctx.procedures.attach().unwrap();
        assert_eq!(proc.ksi, 6);
        assert!(!proc.is_accept_sent());
    }

    // The new procedure runs the common procedures again and re-emits the
    // accept.
    emm_common::authentication_complete(&h.rt, ran_id, &XRES);
    emm_common::security_mode_complete(&h.rt, ran_id, None);
    assert_eq!(establish_cnfs(&h).len(), 2);

    attach::on_attach_complete(
        &h.rt,
        ran_id,
        Bytes::from_static(&[0xc2]),
        NasDecodeStatus::default(),
    );
    let ctx_arc = h.rt.index.lookup_by_ran_id(ran_id).unwrap();
    let ctx = ctx_arc.lock().unwrap();
    assert_eq!(ctx.fsm.state(), EmmState::Registered);
    assert!(ctx.is_attached);
}

// ============================================================================
// Scenario: emergency attach rejected
// ============================================================================

#[test]
fn test_emergency_attach_rejected() {
    let h = harness();
    let request = AttachRequestIes {
        is_initial: true,
        attach_type: AttachType::Emergency,
        imei: Imei::from_bcd("35123456789012"),
        decode_status: NasDecodeStatus::default(),
        ..Default::default()
    };
    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, request);

    let delivered = h.sink.delivered();
    assert_eq!(delivered.len(), 1);
    match &delivered[0] {
        EmmAsPrimitive::EstablishRej(rej) => {
            assert_eq!(rej.cause, EmmCause::ImeiNotAccepted);
        }
        other => panic!("expected EstablishRej, got {:?}", other),
    }
    // No common procedure was started and no timers run.
    assert!(downlink_requests(&h).is_empty());
    assert_eq!(h.rt.timers.armed_count(), 0);
}

// ============================================================================
// Scenario: T3450 exhaustion
// ============================================================================

#[test]
fn test_t3450_exhaustion_aborts() {
    let h = harness();
    let ran_id = drive_to_accept(&h);
    let ctx_arc = h.rt.index.lookup_by_ran_id(ran_id).unwrap();
    let ue = ctx_arc.lock().unwrap().id;

    let fire = |h: &Harness| {
        let token = {
            let ctx = ctx_arc.lock().unwrap();
            ctx.procedures.attach().unwrap().t3450.unwrap()
        };
        attach::on_t3450_expiry(
            &h.rt,
            TimerExpiry {
                token,
                timer_id: TimerId::T3450,
                ue,
            },
        );
    };

    // First four expiries retransmit the accept.
    for n in 1..=4u32 {
        fire(&h);
        assert_eq!(establish_cnfs(&h).len(), 1 + n as usize);
        let ctx = ctx_arc.lock().unwrap();
        assert_eq!(ctx.procedures.attach().unwrap().attach_accept_sent, 1 + n);
    }

    // The fifth expiry aborts instead of retransmitting.
    fire(&h);
    assert_eq!(establish_cnfs(&h).len(), 5);
    let ctx = ctx_arc.lock().unwrap();
    assert_eq!(ctx.fsm.state(), EmmState::Deregistered);
    assert!(!ctx.procedures.is_specific_running());
    assert_eq!(h.rt.timers.armed_count(), 0);
    assert!(h
        .esm
        .received()
        .iter()
        .any(|p| matches!(p, EsmSapPrimitive::PdnConnectivityRej { .. })));
}

// ============================================================================
// Scenario: ESM failure path
// ============================================================================

#[test]
fn test_esm_failure_rejects_with_reply() {
    let esm = ScriptedEsm::new()
        .with_unitdata_response(EsmSapResponse::failed(Some(Bytes::from_static(&[0xe5, 0x01]))));
    let h = harness_with(esm, MmeConfig::default());

    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, base_request());
    let ran_id = ran_id_of(&h);
    emm_common::authentication_complete(&h.rt, ran_id, &XRES);
    emm_common::security_mode_complete(&h.rt, ran_id, None);

    // One reject with the ESM reply embedded; the accept and T3450 never
    // happened.
    assert!(establish_cnfs(&h).is_empty());
    let rejects: Vec<_> = h
        .sink
        .delivered()
        .into_iter()
        .filter_map(|p| match p {
            EmmAsPrimitive::EstablishRej(rej) => Some(rej),
            _ => None,
        })
        .collect();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].cause, EmmCause::EsmFailure);
    assert_eq!(
        rejects[0].nas_msg.as_ref().unwrap(),
        &Bytes::from_static(&[0xe5, 0x01])
    );
    assert_eq!(h.rt.timers.armed_count(), 0);
    // The never-registered context was released from the index.
    assert_eq!(h.rt.index.len(), 0);
}

// ============================================================================
// Replay while common procedures run
// ============================================================================

#[test]
fn test_identical_replay_before_accept_is_noop() {
    let h = harness();
    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, base_request());
    let ran_id = ran_id_of(&h);
    let delivered_before = h.sink.delivered().len();

    let mut replay = base_request();
    replay.is_initial = false;
    attach::on_attach_request(&h.rt, enb_key(1), ran_id, replay);

    // No state change, no message emitted.
    assert_eq!(h.sink.delivered().len(), delivered_before);
    assert_eq!(h.rt.index.len(), 1);
    let ctx_arc = h.rt.index.lookup_by_ran_id(ran_id).unwrap();
    let ctx = ctx_arc.lock().unwrap();
    assert!(ctx.procedures.attach().is_some());
    assert_eq!(ctx.num_attach_request, 2);
}

// ============================================================================
// Duplicate eNB association
// ============================================================================

#[test]
fn test_duplicate_enb_key_resolves_to_new_ran_id() {
    let h = harness();
    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, base_request());
    let old_ran_id = ran_id_of(&h);

    // The UE reappears on a new association with a new lower-layer id.
    let new_ran_id = old_ran_id + 100;
    attach::on_attach_request(&h.rt, enb_key(2), new_ran_id, base_request());

    assert_eq!(h.rt.index.len(), 1);
    let ctx_arc = h.rt.index.lookup_by_ran_id(new_ran_id).expect("new ran id");
    {
        let ctx = ctx_arc.lock().unwrap();
        assert_eq!(ctx.ue_id, new_ran_id);
        assert_eq!(ctx.enb_key, enb_key(2));
        assert_eq!(ctx.imsi.value(), Some(&imsi()));
    }
    assert!(h.rt.index.lookup_by_ran_id(old_ran_id).is_none());
    assert!(h.rt.index.lookup_by_enb_key(&enb_key(1)).is_none());
}

// ============================================================================
// Identification collision
// ============================================================================

#[test]
fn test_identification_collision_with_ksi_drift() {
    let h = harness();
    let guti = epc_mmed::context::EpsGuti {
        plmn_id: epc_mmed::context::PlmnId::new("001", "01"),
        mme_gid: 9,
        mme_code: 9,
        m_tmsi: 0xdead,
    };
    let request = AttachRequestIes {
        is_initial: true,
        ksi: 7,
        is_native_guti: true,
        guti: Some(guti),
        ue_network_capability: UeNetworkCapability {
            eea: 0xe0,
            eia: 0x60,
            ..Default::default()
        },
        esm_msg: Bytes::from_static(&[0x52]),
        ..Default::default()
    };

    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, request.clone());
    let ctx_arc = h.rt.index.lookup_by_enb_key(&enb_key(1)).unwrap();
    let ran_id = ctx_arc.lock().unwrap().ue_id;

    // An unverified GUTI attach starts with identification.
    let requests = downlink_requests(&h);
    assert_eq!(requests.len(), 1);
    assert!(matches!(
        requests[0],
        NasDownlinkRequest::IdentityRequest { .. }
    ));

    // A replay differing in exactly one field aborts and restarts.
    let mut replay = request.clone();
    replay.is_initial = false;
    replay.ksi = 6;
    attach::on_attach_request(&h.rt, enb_key(1), ran_id, replay);

    assert!(h
        .esm
        .received()
        .iter()
        .any(|p| matches!(p, EsmSapPrimitive::PdnConnectivityRej { .. })));
    let requests = downlink_requests(&h);
    assert_eq!(requests.len(), 2);
    assert!(matches!(
        requests[1],
        NasDownlinkRequest::IdentityRequest { .. }
    ));
    {
        let ctx = ctx_arc.lock().unwrap();
        assert_eq!(ctx.procedures.attach().unwrap().ksi, 6);
    }

    // Identification completes and authentication follows.
    emm_common::identification_complete(&h.rt, ran_id, imsi());
    let requests = downlink_requests(&h);
    assert_eq!(requests.len(), 3);
    assert!(matches!(
        requests[2],
        NasDownlinkRequest::AuthenticationRequest { .. }
    ));
}

// ============================================================================
// Protocol error
// ============================================================================

#[test]
fn test_protocol_error_rejects_running_attach() {
    let h = harness();
    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, base_request());
    let ran_id = ran_id_of(&h);

    attach::on_attach_reject_from_protocol_error(
        &h.rt,
        ran_id,
        EmmCause::ProtocolErrorUnspecified,
    );

    let rejects: Vec<_> = h
        .sink
        .delivered()
        .into_iter()
        .filter_map(|p| match p {
            EmmAsPrimitive::EstablishRej(rej) => Some(rej),
            _ => None,
        })
        .collect();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].cause, EmmCause::ProtocolErrorUnspecified);
    // The never-registered context is gone.
    assert_eq!(h.rt.index.len(), 0);
    assert_eq!(h.rt.timers.armed_count(), 0);
}

// ============================================================================
// Authentication failure
// ============================================================================

#[test]
fn test_authentication_mismatch_rejects_illegal_ue() {
    let h = harness();
    attach::on_attach_request(&h.rt, enb_key(1), INVALID_MME_UE_S1AP_ID, base_request());
    let ran_id = ran_id_of(&h);

    emm_common::authentication_complete(&h.rt, ran_id, &[0xff; 8]);

    let rejects: Vec<_> = h
        .sink
        .delivered()
        .into_iter()
        .filter_map(|p| match p {
            EmmAsPrimitive::EstablishRej(rej) => Some(rej),
            _ => None,
        })
        .collect();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].cause, EmmCause::IllegalUe);
    assert_eq!(h.rt.index.len(), 0);
}
