//! MME Event Definitions
//!
//! Events carried on the central inter-task queue: uplink NAS messages
//! handed over by the access-stratum task, timer expiries and the
//! shutdown marker. `process_event` routes one event into the dispatcher;
//! per-context serialization happens on the context locks inside.

use crate::attach::{self, AttachRequestIes};
use crate::context::{EnbUeKey, Imei, Imsi, MmeUeS1apId};
use crate::emm_common;
use crate::emm_sap::{EmmCause, NasDecodeStatus};
use crate::mme_api::MmeRuntime;
use crate::timer::{TimerExpiry, TimerId};
use bytes::Bytes;

/// Events on the central inter-task queue
#[derive(Debug)]
pub enum MmeEvent {
    AttachRequest {
        enb_key: EnbUeKey,
        ran_id: MmeUeS1apId,
        ies: Box<AttachRequestIes>,
    },
    AttachComplete {
        ran_id: MmeUeS1apId,
        esm_msg: Bytes,
        decode_status: NasDecodeStatus,
    },
    AttachProtocolError {
        ran_id: MmeUeS1apId,
        cause: EmmCause,
    },
    IdentityResponse {
        ran_id: MmeUeS1apId,
        imsi: Imsi,
    },
    AuthenticationResponse {
        ran_id: MmeUeS1apId,
        res: Vec<u8>,
    },
    SecurityModeComplete {
        ran_id: MmeUeS1apId,
        imeisv: Option<Imei>,
    },
    SecurityModeReject {
        ran_id: MmeUeS1apId,
    },
    Timer(TimerExpiry),
    Shutdown,
}

/// Route one event into the dispatcher
pub fn process_event(rt: &MmeRuntime, event: MmeEvent) {
    match event {
        MmeEvent::AttachRequest {
            enb_key,
            ran_id,
            ies,
        } => attach::on_attach_request(rt, enb_key, ran_id, *ies),
        MmeEvent::AttachComplete {
            ran_id,
            esm_msg,
            decode_status,
        } => attach::on_attach_complete(rt, ran_id, esm_msg, decode_status),
        MmeEvent::AttachProtocolError { ran_id, cause } => {
            attach::on_attach_reject_from_protocol_error(rt, ran_id, cause)
        }
        MmeEvent::IdentityResponse { ran_id, imsi } => {
            emm_common::identification_complete(rt, ran_id, imsi)
        }
        MmeEvent::AuthenticationResponse { ran_id, res } => {
            emm_common::authentication_complete(rt, ran_id, &res)
        }
        MmeEvent::SecurityModeComplete { ran_id, imeisv } => {
            emm_common::security_mode_complete(rt, ran_id, imeisv)
        }
        MmeEvent::SecurityModeReject { ran_id } => emm_common::security_mode_reject(rt, ran_id),
        MmeEvent::Timer(expiry) => match expiry.timer_id {
            TimerId::T3450 => attach::on_t3450_expiry(rt, expiry),
            TimerId::T3460 | TimerId::T3470 => emm_common::on_timer_expiry(rt, expiry),
            other => log::debug!("unhandled {} expiry", other.name()),
        },
        MmeEvent::Shutdown => {}
    }
}
