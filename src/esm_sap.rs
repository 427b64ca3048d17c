//! ESM Service Access Point
//!
//! Seam to the EPS Session Management sublayer. The EMM attach procedure
//! hands the embedded ESM message across this interface and is steered by
//! the returned status: success carries the reply PDU to embed in the
//! ATTACH ACCEPT, failure carries the PDN connectivity reject to embed in
//! the ATTACH REJECT, and a discarded message is ignored locally.

use crate::context::UeCtxId;
use bytes::Bytes;
use std::sync::Mutex;

/// Primitives the EMM sublayer sends towards ESM
#[derive(Debug, Clone)]
pub enum EsmSapPrimitive {
    /// ESM message received inside an EMM message (attach request)
    UnitdataInd { ue: UeCtxId, msg: Bytes },
    /// Activate Default EPS Bearer Context Accept inside ATTACH COMPLETE
    DefaultEpsBearerContextActivateCnf { ue: UeCtxId, msg: Bytes },
    /// The network locally refused PDN connectivity (attach aborted)
    PdnConnectivityRej { ue: UeCtxId },
}

/// Outcome of an ESM-SAP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsmSapStatus {
    Success,
    /// The received message was discarded or answered with a status
    /// message; treat as success locally
    Discarded,
    Failed,
}

/// Response returned by the ESM sublayer
#[derive(Debug, Clone)]
pub struct EsmSapResponse {
    pub status: EsmSapStatus,
    /// Reply PDU to carry back to the UE, when there is one
    pub reply: Option<Bytes>,
}

impl EsmSapResponse {
    pub fn success(reply: Option<Bytes>) -> Self {
        Self {
            status: EsmSapStatus::Success,
            reply,
        }
    }

    pub fn discarded() -> Self {
        Self {
            status: EsmSapStatus::Discarded,
            reply: None,
        }
    }

    pub fn failed(reply: Option<Bytes>) -> Self {
        Self {
            status: EsmSapStatus::Failed,
            reply,
        }
    }
}

/// The ESM collaborator interface
pub trait EsmSap: Send + Sync {
    fn esm_sap_send(&self, primitive: EsmSapPrimitive) -> EsmSapResponse;
}

/// Scripted ESM collaborator: replays a fixed response per primitive kind
/// and records what it was asked. The daemon uses it until a real session
/// management task is wired in; tests drive it directly.
#[derive(Debug)]
pub struct ScriptedEsm {
    unitdata_response: EsmSapResponse,
    activate_cnf_response: EsmSapResponse,
    received: Mutex<Vec<EsmSapPrimitive>>,
}

impl Default for ScriptedEsm {
    fn default() -> Self {
        Self {
            unitdata_response: EsmSapResponse::success(Some(Bytes::from_static(&[0x02]))),
            activate_cnf_response: EsmSapResponse::success(None),
            received: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedEsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response to return for ESM_UNITDATA_IND
    pub fn with_unitdata_response(mut self, response: EsmSapResponse) -> Self {
        self.unitdata_response = response;
        self
    }

    /// Response to return for the bearer activation confirmation
    pub fn with_activate_cnf_response(mut self, response: EsmSapResponse) -> Self {
        self.activate_cnf_response = response;
        self
    }

    /// Primitives seen so far
    pub fn received(&self) -> Vec<EsmSapPrimitive> {
        self.received.lock().unwrap().clone()
    }
}

impl EsmSap for ScriptedEsm {
    fn esm_sap_send(&self, primitive: EsmSapPrimitive) -> EsmSapResponse {
        let response = match &primitive {
            EsmSapPrimitive::UnitdataInd { .. } => self.unitdata_response.clone(),
            EsmSapPrimitive::DefaultEpsBearerContextActivateCnf { .. } => {
                self.activate_cnf_response.clone()
            }
            EsmSapPrimitive::PdnConnectivityRej { .. } => EsmSapResponse::success(None),
        };
        self.received.lock().unwrap().push(primitive);
        response
    }
}
