//! MME Application API
//!
//! The runtime value threaded through the dispatcher in place of process
//! globals: identifier index, configuration, timers and collaborator
//! seams, plus the MME-application services the attach procedure calls up
//! into (GUTI allocation, duplicate signalling-association policy, new
//! lower-layer id association).

use crate::config::MmeConfig;
use crate::context::{
    AuthVector, EmmContext, EnbUeKey, EpsGuti, EpsTai, Imsi, MmeUeS1apId, PlmnId, UeContextIndex,
    UeCtxId, INVALID_MME_UE_S1AP_ID,
};
use crate::emm_sap::AsMessageSink;
use crate::esm_sap::EsmSap;
use crate::timer::TimerManager;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Source of EPS authentication vectors. The S6a exchange with the HSS
/// runs in another task; this seam hands the attach procedure the vector
/// it produced. The null source makes authentication fail closed.
pub trait AuthVectorSource: Send + Sync {
    fn authentication_vector(&self, imsi: &Imsi) -> Option<AuthVector>;
}

/// Vector source with no HSS behind it
#[derive(Debug, Default)]
pub struct NullVectorSource;

impl AuthVectorSource for NullVectorSource {
    fn authentication_vector(&self, imsi: &Imsi) -> Option<AuthVector> {
        log::warn!("no authentication vector available for imsi {}", imsi);
        None
    }
}

/// Which context survives when two contexts claim one eNB UE association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the context reachable by the eNB key, drop the matched one
    RemoveOldContext,
    /// Keep the matched context, drop the one reachable by the eNB key
    RemoveNewContext,
}

/// Process-wide MME state handed to every dispatcher call
pub struct MmeRuntime {
    pub config: MmeConfig,
    pub index: UeContextIndex,
    pub timers: TimerManager,
    pub as_sink: Arc<dyn AsMessageSink>,
    pub esm: Arc<dyn EsmSap>,
    pub vectors: Arc<dyn AuthVectorSource>,
    next_m_tmsi: AtomicU32,
    next_mme_ue_s1ap_id: AtomicU32,
}

impl MmeRuntime {
    pub fn new(config: MmeConfig, as_sink: Arc<dyn AsMessageSink>, esm: Arc<dyn EsmSap>) -> Self {
        Self {
            config,
            index: UeContextIndex::new(),
            timers: TimerManager::new(),
            as_sink,
            esm,
            vectors: Arc::new(NullVectorSource),
            next_m_tmsi: AtomicU32::new(1),
            next_mme_ue_s1ap_id: AtomicU32::new(1),
        }
    }

    /// Replace the authentication vector source
    pub fn with_vector_source(mut self, vectors: Arc<dyn AuthVectorSource>) -> Self {
        self.vectors = vectors;
        self
    }

    /// Served PLMN as configured
    pub fn served_plmn(&self) -> PlmnId {
        PlmnId::new(&self.config.plmn.mcc, &self.config.plmn.mnc)
    }

    /// Allocate the next lower-layer UE identifier, skipping the invalid
    /// marker on wrap-around.
    pub fn next_mme_ue_s1ap_id(&self) -> MmeUeS1apId {
        let id = self.next_mme_ue_s1ap_id.fetch_add(1, Ordering::SeqCst);
        if id == INVALID_MME_UE_S1AP_ID {
            self.next_mme_ue_s1ap_id.store(1, Ordering::SeqCst);
            1
        } else {
            id
        }
    }

    /// Allocate a fresh GUTI for the subscriber together with the tracking
    /// area list it is registered in. The originating TAI, when served,
    /// leads the list.
    pub fn allocate_guti(
        &self,
        imsi: &Imsi,
        old_guti: Option<&EpsGuti>,
        originating_tai: Option<&EpsTai>,
    ) -> (EpsGuti, Vec<EpsTai>) {
        let plmn_id = self.served_plmn();
        let guti = EpsGuti {
            plmn_id,
            mme_gid: self.config.mme_gid,
            mme_code: self.config.mme_code,
            m_tmsi: self.next_m_tmsi.fetch_add(1, Ordering::SeqCst),
        };
        let mut tai_list: Vec<EpsTai> = self
            .config
            .tac_list
            .iter()
            .map(|&tac| EpsTai { plmn_id, tac })
            .collect();
        if let Some(tai) = originating_tai {
            if let Some(pos) = tai_list.iter().position(|t| t == tai) {
                tai_list.swap(0, pos);
            }
        }
        log::info!(
            "allocated GUTI {} for imsi {} (old GUTI {:?})",
            guti,
            imsi,
            old_guti
        );
        (guti, tai_list)
    }

    /// Resolve two contexts claiming one eNB UE association. Pure index
    /// surgery: the dropped context is purged from every index, the kept
    /// one is made reachable by the eNB key. The caller owns any field
    /// fix-ups on the survivor.
    pub fn duplicate_enb_ue_s1ap_id_detected(
        &self,
        enb_key: EnbUeKey,
        matched: UeCtxId,
        policy: DuplicatePolicy,
    ) -> Option<Arc<Mutex<EmmContext>>> {
        let by_enb_key = self.index.id_by_enb_key(&enb_key);
        match policy {
            DuplicatePolicy::RemoveNewContext => {
                if let Some(new_id) = by_enb_key {
                    if new_id != matched {
                        log::warn!("duplicate eNB UE association: removing new context {:?}", new_id);
                        self.index.remove(new_id);
                    }
                }
                let updates = crate::context::KeyUpdates {
                    enb_key: Some(enb_key),
                    ..Default::default()
                };
                if let Err(e) = self.index.rekey(matched, updates) {
                    log::error!("failed to move eNB key to kept context: {}", e);
                }
                self.index.find(matched)
            }
            DuplicatePolicy::RemoveOldContext => {
                log::warn!("duplicate eNB UE association: removing old context {:?}", matched);
                self.index.remove(matched);
                by_enb_key.and_then(|id| self.index.find(id))
            }
        }
    }

    /// Tell the access layer which lower-layer id now identifies the UE of
    /// an eNB association.
    pub fn notify_new_ran_id(&self, enb_ue_s1ap_id: u32, enb_id: u32, new_ran_id: MmeUeS1apId) {
        log::debug!(
            "new UE association: enb_id={} enb_ue_s1ap_id={} -> mme_ue_s1ap_id={}",
            enb_id,
            enb_ue_s1ap_id,
            new_ran_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emm_sap::RecordingSink;
    use crate::esm_sap::ScriptedEsm;

    fn runtime() -> MmeRuntime {
        MmeRuntime::new(
            MmeConfig::default(),
            Arc::new(RecordingSink::new()),
            Arc::new(ScriptedEsm::new()),
        )
    }

    fn enb_key(n: u32) -> EnbUeKey {
        EnbUeKey {
            enb_id: 0x1001,
            enb_ue_s1ap_id: n,
        }
    }

    #[test]
    fn test_allocate_guti_uses_config_identity() {
        let rt = runtime();
        let imsi = Imsi::from_bcd("001010123456789").unwrap();
        let (guti, tai_list) = rt.allocate_guti(&imsi, None, None);
        assert_eq!(guti.mme_gid, rt.config.mme_gid);
        assert_eq!(guti.mme_code, rt.config.mme_code);
        assert_eq!(tai_list.len(), rt.config.tac_list.len());

        let (guti2, _) = rt.allocate_guti(&imsi, Some(&guti), None);
        assert_ne!(guti.m_tmsi, guti2.m_tmsi);
    }

    #[test]
    fn test_allocate_guti_orders_originating_tai_first() {
        let mut config = MmeConfig::default();
        config.tac_list = vec![1, 2, 3];
        let rt = MmeRuntime::new(
            config,
            Arc::new(RecordingSink::new()),
            Arc::new(ScriptedEsm::new()),
        );
        let imsi = Imsi::from_bcd("001010123456789").unwrap();
        let originating = EpsTai {
            plmn_id: rt.served_plmn(),
            tac: 2,
        };
        let (_, tai_list) = rt.allocate_guti(&imsi, None, Some(&originating));
        assert_eq!(tai_list[0].tac, 2);
    }

    #[test]
    fn test_next_mme_ue_s1ap_id_monotonic() {
        let rt = runtime();
        let a = rt.next_mme_ue_s1ap_id();
        let b = rt.next_mme_ue_s1ap_id();
        assert!(b > a);
    }

    #[test]
    fn test_duplicate_remove_new_keeps_matched() {
        let rt = runtime();
        let old = rt.index.create(enb_key(1), 100).unwrap();
        let old_id = old.lock().unwrap().id;
        let new = rt.index.create(enb_key(2), 200).unwrap();
        let new_id = new.lock().unwrap().id;

        let kept = rt
            .duplicate_enb_ue_s1ap_id_detected(enb_key(2), old_id, DuplicatePolicy::RemoveNewContext)
            .unwrap();
        assert_eq!(kept.lock().unwrap().id, old_id);
        assert!(rt.index.find(new_id).is_none());
        // The kept context is now reachable by the new eNB key
        assert_eq!(rt.index.id_by_enb_key(&enb_key(2)), Some(old_id));
        assert_eq!(rt.index.id_by_enb_key(&enb_key(1)), None);
    }

    #[test]
    fn test_duplicate_remove_old_keeps_new() {
        let rt = runtime();
        let old = rt.index.create(enb_key(1), 100).unwrap();
        let old_id = old.lock().unwrap().id;
        let new = rt.index.create(enb_key(2), 200).unwrap();
        let new_id = new.lock().unwrap().id;

        let kept = rt
            .duplicate_enb_ue_s1ap_id_detected(enb_key(2), old_id, DuplicatePolicy::RemoveOldContext)
            .unwrap();
        assert_eq!(kept.lock().unwrap().id, new_id);
        assert!(rt.index.find(old_id).is_none());
    }
}
