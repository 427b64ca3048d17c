//! UE Context Management
//!
//! The per-UE EMM context and the multi-key identifier index the MME keeps
//! over all known UEs. A context is reachable by every identifier it
//! currently holds (lower-layer id, eNB key, IMSI, GUTI); index mutations
//! are applied as a single atomic unit under one writer lock, while each
//! context itself is serialized by its own mutex.

use crate::nas_security::{SecurityContext, UeSecurityCapability, KASME_LEN};
use crate::procedures::EmmProcedures;
use crate::sm::EmmFsm;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

// ============================================================================
// Identifier Types
// ============================================================================

/// MME-assigned lower-layer UE identifier
pub type MmeUeS1apId = u32;

/// Lower-layer id meaning "not assigned yet"
pub const INVALID_MME_UE_S1AP_ID: MmeUeS1apId = 0xffff_ffff;

/// Maximum number of IMSI digits
pub const MAX_IMSI_DIGITS: usize = 15;

/// (eNB id, eNB-assigned UE id) pair identifying the signalling association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnbUeKey {
    pub enb_id: u32,
    pub enb_ue_s1ap_id: u32,
}

/// Pool id of a UE context; stable for the context lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UeCtxId(pub u64);

/// PLMN identity as BCD digits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    pub mcc1: u8,
    pub mcc2: u8,
    pub mcc3: u8,
    pub mnc1: u8,
    pub mnc2: u8,
    /// 0xf for a 2-digit MNC
    pub mnc3: u8,
}

impl PlmnId {
    /// Build from decimal MCC/MNC strings
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let digit = |s: &str, i: usize, default: u8| {
            s.as_bytes()
                .get(i)
                .and_then(|b| (*b as char).to_digit(10))
                .map(|d| d as u8)
                .unwrap_or(default)
        };
        Self {
            mcc1: digit(mcc, 0, 0),
            mcc2: digit(mcc, 1, 0),
            mcc3: digit(mcc, 2, 0),
            mnc1: digit(mnc, 0, 0),
            mnc2: digit(mnc, 1, 0),
            mnc3: digit(mnc, 2, 0xf),
        }
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.mcc1, self.mcc2, self.mcc3)?;
        write!(f, "{}{}", self.mnc1, self.mnc2)?;
        if self.mnc3 != 0xf {
            write!(f, "{}", self.mnc3)?;
        }
        Ok(())
    }
}

/// Tracking Area Identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsTai {
    pub plmn_id: PlmnId,
    pub tac: u16,
}

/// E-UTRAN Cell Global Identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ECgi {
    pub plmn_id: PlmnId,
    /// 28-bit cell identity; upper 20 bits are the eNB id
    pub cell_id: u32,
}

impl ECgi {
    /// eNB id part of the cell identity
    pub fn enb_id(&self) -> u32 {
        self.cell_id >> 8
    }
}

/// Globally Unique Temporary Identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    pub plmn_id: PlmnId,
    pub mme_gid: u16,
    pub mme_code: u8,
    pub m_tmsi: u32,
}

impl fmt::Display for EpsGuti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:04x}-{:02x}-{:08x}",
            self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi
        )
    }
}

/// Permanent subscriber identity, BCD digit string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Imsi(String);

impl Imsi {
    /// Parse from a BCD digit string (6 to 15 digits)
    pub fn from_bcd(digits: &str) -> Option<Self> {
        if (6..=MAX_IMSI_DIGITS).contains(&digits.len())
            && digits.bytes().all(|b| b.is_ascii_digit())
        {
            Some(Self(digits.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Imsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Permanent equipment identity (IMEI or IMEISV), BCD digit string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Imei(String);

impl Imei {
    /// Parse from a BCD digit string (14 to 16 digits)
    pub fn from_bcd(digits: &str) -> Option<Self> {
        if (14..=16).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(digits.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Capability IEs
// ============================================================================

/// UE network capability IE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeNetworkCapability {
    pub eea: u8,
    pub eia: u8,
    pub uea: u8,
    pub uia: u8,
}

impl From<&UeNetworkCapability> for UeSecurityCapability {
    fn from(capability: &UeNetworkCapability) -> Self {
        UeSecurityCapability {
            eea: capability.eea,
            eia: capability.eia,
            uea: capability.uea,
            uia: capability.uia,
        }
    }
}

/// MS network capability IE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsNetworkCapability {
    pub gea1: bool,
    pub extended_gea: u8,
}

/// DRX parameter IE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrxParameter {
    pub split_pg_cycle_code: u8,
    pub cn_specific_drx: u8,
}

// ============================================================================
// Attribute Tri-State
// ============================================================================

/// Per-attribute state: a value is first stored (present) and only usable
/// in outgoing messages once confirmed by the peer (valid).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Attribute<T> {
    #[default]
    Absent,
    Present(T),
    Valid(T),
}

impl<T> Attribute<T> {
    pub fn is_present(&self) -> bool {
        !matches!(self, Attribute::Absent)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Attribute::Valid(_))
    }

    /// Present view: the stored value, confirmed or not
    pub fn value(&self) -> Option<&T> {
        match self {
            Attribute::Absent => None,
            Attribute::Present(v) | Attribute::Valid(v) => Some(v),
        }
    }

    /// Valid view: only a peer-confirmed value
    pub fn valid(&self) -> Option<&T> {
        match self {
            Attribute::Valid(v) => Some(v),
            _ => None,
        }
    }

    /// Store a value without confirming it
    pub fn set(&mut self, value: T) {
        *self = Attribute::Present(value);
    }

    /// Store a confirmed value
    pub fn set_valid(&mut self, value: T) {
        *self = Attribute::Valid(value);
    }

    /// Confirm the stored value, if any
    pub fn validate(&mut self) {
        let prev = std::mem::replace(self, Attribute::Absent);
        *self = match prev {
            Attribute::Present(v) | Attribute::Valid(v) => Attribute::Valid(v),
            Attribute::Absent => Attribute::Absent,
        };
    }

    pub fn clear(&mut self) {
        *self = Attribute::Absent;
    }
}

// ============================================================================
// EMM Context
// ============================================================================

/// EPS authentication vector for the in-flight authentication
#[derive(Debug, Clone)]
pub struct AuthVector {
    pub rand: [u8; 16],
    pub autn: [u8; 16],
    pub xres: Vec<u8>,
    pub kasme: [u8; KASME_LEN],
}

/// Per-UE EMM context
#[derive(Debug, Default)]
pub struct EmmContext {
    /// Pool id, assigned at creation
    pub id: UeCtxId,
    /// Lower-layer id; INVALID_MME_UE_S1AP_ID until assigned
    pub ue_id: MmeUeS1apId,
    /// Signalling association key
    pub enb_key: EnbUeKey,
    pub fsm: EmmFsm,

    pub imsi: Attribute<Imsi>,
    pub imei: Attribute<Imei>,
    pub guti: Attribute<EpsGuti>,
    pub old_guti: Attribute<EpsGuti>,
    pub tai_list: Attribute<Vec<EpsTai>>,
    pub last_visited_registered_tai: Attribute<EpsTai>,
    pub originating_tai: Option<EpsTai>,
    pub originating_ecgi: Option<ECgi>,
    pub ue_network_capability: Attribute<UeNetworkCapability>,
    pub ms_network_capability: Attribute<MsNetworkCapability>,
    pub drx_parameter: Attribute<DrxParameter>,

    /// Key set identifier signalled by the UE
    pub ksi: u8,
    pub auth_vector: Option<AuthVector>,
    /// Current NAS security context
    pub security: Option<SecurityContext>,
    /// Context created by a common procedure, not yet taken into use
    pub non_current_security: Option<SecurityContext>,

    /// Number of ATTACH REQUESTs seen on this context
    pub num_attach_request: u32,
    pub is_attached: bool,
    pub is_emergency: bool,
    pub guti_is_new: bool,
    /// Whether this context ever reached EMM-REGISTERED
    pub ever_registered: bool,

    pub procedures: EmmProcedures,
}

impl Default for EnbUeKey {
    fn default() -> Self {
        Self {
            enb_id: 0,
            enb_ue_s1ap_id: 0,
        }
    }
}

impl Default for UeCtxId {
    fn default() -> Self {
        UeCtxId(0)
    }
}

impl EmmContext {
    pub fn new(id: UeCtxId, enb_key: EnbUeKey, ue_id: MmeUeS1apId) -> Self {
        Self {
            id,
            ue_id,
            enb_key,
            fsm: EmmFsm::new(ue_id),
            ..Default::default()
        }
    }

    /// Take the non-current security context into use. Invoked when a
    /// SECURITY MODE COMPLETE has been accepted; the promoted context is
    /// marked activated.
    pub fn promote_non_current_security(&mut self) {
        if let Some(mut sc) = self.non_current_security.take() {
            sc.activated = true;
            self.security = Some(sc);
        }
    }

    /// Drop the current security context
    pub fn clear_security(&mut self) {
        self.security = None;
    }

    /// Advance the downlink NAS count of the current security context
    pub fn bump_dl_count(&mut self) {
        if let Some(sc) = self.security.as_mut() {
            sc.bump_dl_count();
        }
    }

    /// Strip identities and security material; run when a never-registered
    /// context is released after an attach reject.
    pub fn release_identities(&mut self) {
        self.old_guti.clear();
        self.guti.clear();
        self.imsi.clear();
        self.imei.clear();
        self.auth_vector = None;
        self.security = None;
        self.non_current_security = None;
    }
}

// ============================================================================
// Identifier Index
// ============================================================================

/// Index mutation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("identifier collision on {0}")]
    Collision(&'static str),
    #[error("unknown context {0:?}")]
    UnknownContext(UeCtxId),
}

/// Key changes to apply to a context as one atomic unit
#[derive(Debug, Clone, Default)]
pub struct KeyUpdates {
    /// New lower-layer id (replaces the previous one)
    pub ran_id: Option<MmeUeS1apId>,
    /// New signalling association key
    pub enb_key: Option<EnbUeKey>,
    /// Now also reachable by this IMSI
    pub imsi: Option<Imsi>,
    /// Replace (Some(guti)) or drop (None) the GUTI key
    pub guti: Option<Option<EpsGuti>>,
}

/// Identifier snapshot for one context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CtxKeys {
    pub ran_id: Option<MmeUeS1apId>,
    pub enb_key: Option<EnbUeKey>,
    pub imsi: Option<Imsi>,
    pub guti: Option<EpsGuti>,
}

#[derive(Debug, Default)]
struct IndexInner {
    pool: HashMap<UeCtxId, Arc<Mutex<EmmContext>>>,
    keys: HashMap<UeCtxId, CtxKeys>,
    by_ran_id: HashMap<MmeUeS1apId, UeCtxId>,
    by_enb_key: HashMap<EnbUeKey, UeCtxId>,
    by_imsi: HashMap<Imsi, UeCtxId>,
    by_guti: HashMap<EpsGuti, UeCtxId>,
}

/// Multi-key store of UE contexts
#[derive(Debug, Default)]
pub struct UeContextIndex {
    inner: RwLock<IndexInner>,
    next_ctx_id: AtomicU64,
}

impl UeContextIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
            next_ctx_id: AtomicU64::new(1),
        }
    }

    /// Create a new context reachable by its eNB key (and lower-layer id if
    /// already assigned). Fails if either identifier is taken.
    pub fn create(
        &self,
        enb_key: EnbUeKey,
        ue_id: MmeUeS1apId,
    ) -> Result<Arc<Mutex<EmmContext>>, IndexError> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_enb_key.contains_key(&enb_key) {
            return Err(IndexError::Collision("enb_key"));
        }
        if ue_id != INVALID_MME_UE_S1AP_ID && inner.by_ran_id.contains_key(&ue_id) {
            return Err(IndexError::Collision("ran_id"));
        }
        let id = UeCtxId(self.next_ctx_id.fetch_add(1, Ordering::SeqCst));
        let ctx = Arc::new(Mutex::new(EmmContext::new(id, enb_key, ue_id)));
        let mut keys = CtxKeys {
            enb_key: Some(enb_key),
            ..Default::default()
        };
        inner.by_enb_key.insert(enb_key, id);
        if ue_id != INVALID_MME_UE_S1AP_ID {
            inner.by_ran_id.insert(ue_id, id);
            keys.ran_id = Some(ue_id);
        }
        inner.keys.insert(id, keys);
        inner.pool.insert(id, Arc::clone(&ctx));
        Ok(ctx)
    }

    pub fn find(&self, id: UeCtxId) -> Option<Arc<Mutex<EmmContext>>> {
        self.inner.read().unwrap().pool.get(&id).cloned()
    }

    pub fn lookup_by_ran_id(&self, ue_id: MmeUeS1apId) -> Option<Arc<Mutex<EmmContext>>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_ran_id
            .get(&ue_id)
            .and_then(|id| inner.pool.get(id))
            .cloned()
    }

    pub fn lookup_by_enb_key(&self, enb_key: &EnbUeKey) -> Option<Arc<Mutex<EmmContext>>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_enb_key
            .get(enb_key)
            .and_then(|id| inner.pool.get(id))
            .cloned()
    }

    pub fn lookup_by_imsi(&self, imsi: &Imsi) -> Option<Arc<Mutex<EmmContext>>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_imsi
            .get(imsi)
            .and_then(|id| inner.pool.get(id))
            .cloned()
    }

    pub fn lookup_by_guti(&self, guti: &EpsGuti) -> Option<Arc<Mutex<EmmContext>>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_guti
            .get(guti)
            .and_then(|id| inner.pool.get(id))
            .cloned()
    }

    /// Apply a set of key changes atomically: either every change is
    /// applied, or (on any collision) none is.
    pub fn rekey(&self, id: UeCtxId, updates: KeyUpdates) -> Result<(), IndexError> {
        let mut inner = self.inner.write().unwrap();
        let current = inner
            .keys
            .get(&id)
            .cloned()
            .ok_or(IndexError::UnknownContext(id))?;

        // Validate the whole diff before touching any map.
        if let Some(ran_id) = updates.ran_id {
            if let Some(&other) = inner.by_ran_id.get(&ran_id) {
                if other != id {
                    return Err(IndexError::Collision("ran_id"));
                }
            }
        }
        if let Some(enb_key) = updates.enb_key {
            if let Some(&other) = inner.by_enb_key.get(&enb_key) {
                if other != id {
                    return Err(IndexError::Collision("enb_key"));
                }
            }
        }
        if let Some(ref imsi) = updates.imsi {
            if let Some(&other) = inner.by_imsi.get(imsi) {
                if other != id {
                    return Err(IndexError::Collision("imsi"));
                }
            }
        }
        if let Some(Some(ref guti)) = updates.guti {
            if let Some(&other) = inner.by_guti.get(guti) {
                if other != id {
                    return Err(IndexError::Collision("guti"));
                }
            }
        }

        let mut next = current.clone();
        if let Some(ran_id) = updates.ran_id {
            if let Some(prev) = current.ran_id {
                inner.by_ran_id.remove(&prev);
            }
            inner.by_ran_id.insert(ran_id, id);
            next.ran_id = Some(ran_id);
        }
        if let Some(enb_key) = updates.enb_key {
            if let Some(prev) = current.enb_key {
                inner.by_enb_key.remove(&prev);
            }
            inner.by_enb_key.insert(enb_key, id);
            next.enb_key = Some(enb_key);
        }
        if let Some(imsi) = updates.imsi {
            if let Some(ref prev) = current.imsi {
                inner.by_imsi.remove(prev);
            }
            inner.by_imsi.insert(imsi.clone(), id);
            next.imsi = Some(imsi);
        }
        if let Some(guti) = updates.guti {
            if let Some(prev) = current.guti {
                inner.by_guti.remove(&prev);
            }
            if let Some(guti) = guti {
                inner.by_guti.insert(guti, id);
            }
            next.guti = guti;
        }
        inner.keys.insert(id, next);
        Ok(())
    }

    /// Purge every index entry of a context and drop it from the pool
    pub fn remove(&self, id: UeCtxId) -> Option<Arc<Mutex<EmmContext>>> {
        let mut inner = self.inner.write().unwrap();
        let keys = inner.keys.remove(&id)?;
        if let Some(ran_id) = keys.ran_id {
            inner.by_ran_id.remove(&ran_id);
        }
        if let Some(enb_key) = keys.enb_key {
            inner.by_enb_key.remove(&enb_key);
        }
        if let Some(imsi) = keys.imsi {
            inner.by_imsi.remove(&imsi);
        }
        if let Some(guti) = keys.guti {
            inner.by_guti.remove(&guti);
        }
        inner.pool.remove(&id)
    }

    /// Identifier snapshot of a context
    pub fn keys_of(&self, id: UeCtxId) -> Option<CtxKeys> {
        self.inner.read().unwrap().keys.get(&id).cloned()
    }

    pub fn id_by_ran_id(&self, ue_id: MmeUeS1apId) -> Option<UeCtxId> {
        self.inner.read().unwrap().by_ran_id.get(&ue_id).copied()
    }

    pub fn id_by_enb_key(&self, enb_key: &EnbUeKey) -> Option<UeCtxId> {
        self.inner.read().unwrap().by_enb_key.get(enb_key).copied()
    }

    pub fn id_by_imsi(&self, imsi: &Imsi) -> Option<UeCtxId> {
        self.inner.read().unwrap().by_imsi.get(imsi).copied()
    }

    pub fn id_by_guti(&self, guti: &EpsGuti) -> Option<UeCtxId> {
        self.inner.read().unwrap().by_guti.get(guti).copied()
    }

    /// Ids of every live context
    pub fn ids(&self) -> Vec<UeCtxId> {
        self.inner.read().unwrap().pool.keys().copied().collect()
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
