//! NAS Security Context
//!
//! EPS NAS security material for one UE: KASME-derived NAS keys, the
//! per-direction NAS counts (24-bit overflow plus 8-bit sequence number),
//! the algorithms the MME selected and the activation flag that is set
//! only once a SECURITY MODE COMPLETE has been accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Key lengths
pub const KASME_LEN: usize = 32;
pub const KNAS_LEN: usize = 16;

/// NAS key set identifier meaning "no key is available"
pub const KSI_NO_KEY_AVAILABLE: u8 = 7;

/// EIA algorithm identifiers
pub const NAS_INTEGRITY_EIA0: u8 = 0;
pub const NAS_INTEGRITY_EIA1: u8 = 1;
pub const NAS_INTEGRITY_EIA2: u8 = 2;

/// EEA algorithm identifiers
pub const NAS_CIPHERING_EEA0: u8 = 0;
pub const NAS_CIPHERING_EEA1: u8 = 1;
pub const NAS_CIPHERING_EEA2: u8 = 2;

/// Type of a NAS security context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityContextType {
    /// Created by an EPS authentication run
    #[default]
    Native,
    /// Mapped from another system's context
    Mapped,
}

/// NAS COUNT: 24-bit overflow counter plus 8-bit sequence number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NasCount {
    pub overflow: u32,
    pub seq_num: u8,
}

impl NasCount {
    /// Flat 32-bit value used as KDF and MAC input
    pub fn value(&self) -> u32 {
        (self.overflow << 8) | u32::from(self.seq_num)
    }

    /// Advance by one message. The overflow counter wraps at 24 bits;
    /// counts must never be reused within the lifetime of a KASME, so the
    /// context has to be re-keyed long before that point.
    pub fn increment(&mut self) {
        let (seq, carried) = self.seq_num.overflowing_add(1);
        self.seq_num = seq;
        if carried {
            self.overflow = (self.overflow + 1) & 0x00ff_ffff;
        }
    }
}

/// UE security capability replayed in the SECURITY MODE COMMAND
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeSecurityCapability {
    /// Supported EPS encryption algorithms (EEA bitmap, bit 7 = EEA0)
    pub eea: u8,
    /// Supported EPS integrity algorithms (EIA bitmap, bit 7 = EIA0)
    pub eia: u8,
    /// Supported UMTS encryption algorithms
    pub uea: u8,
    /// Supported UMTS integrity algorithms
    pub uia: u8,
}

impl UeSecurityCapability {
    /// Whether the given EEA algorithm id is supported
    pub fn supports_eea(&self, alg: u8) -> bool {
        alg < 8 && (self.eea & (0x80 >> alg)) != 0
    }

    /// Whether the given EIA algorithm id is supported
    pub fn supports_eia(&self, alg: u8) -> bool {
        alg < 8 && (self.eia & (0x80 >> alg)) != 0
    }
}

/// Algorithms selected by the MME for this security context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectedAlgorithms {
    pub encryption: u8,
    pub integrity: u8,
}

/// EPS NAS security context
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub sc_type: SecurityContextType,
    /// NAS key set identifier for E-UTRAN
    pub eksi: u8,
    /// ASME master key
    pub kasme: [u8; KASME_LEN],
    /// NAS ciphering key
    pub knas_enc: [u8; KNAS_LEN],
    /// NAS integrity key
    pub knas_int: [u8; KNAS_LEN],
    pub dl_count: NasCount,
    pub ul_count: NasCount,
    /// Capability bitmaps replayed to the UE
    pub capability: UeSecurityCapability,
    pub selected_algorithms: SelectedAlgorithms,
    /// True only after a SECURITY MODE COMPLETE has been accepted
    pub activated: bool,
}

impl SecurityContext {
    /// Create a fresh (non-activated) context from an authentication run,
    /// deriving the NAS keys for the selected algorithms.
    pub fn from_kasme(
        eksi: u8,
        kasme: [u8; KASME_LEN],
        capability: UeSecurityCapability,
        selected: SelectedAlgorithms,
    ) -> Self {
        let knas_enc = derive_knas(&kasme, KdfAlgType::NasEnc, selected.encryption);
        let knas_int = derive_knas(&kasme, KdfAlgType::NasInt, selected.integrity);
        Self {
            sc_type: SecurityContextType::Native,
            eksi,
            kasme,
            knas_enc,
            knas_int,
            capability,
            selected_algorithms: selected,
            ..Default::default()
        }
    }

    /// Advance the downlink count. Called exactly once per emitted NAS
    /// message that is ciphered or integrity protected.
    pub fn bump_dl_count(&mut self) {
        self.dl_count.increment();
    }
}

/// Algorithm type distinguishers for the NAS key derivation
#[derive(Debug, Clone, Copy)]
pub enum KdfAlgType {
    NasEnc,
    NasInt,
}

impl KdfAlgType {
    fn distinguisher(self) -> u8 {
        match self {
            KdfAlgType::NasEnc => 0x01,
            KdfAlgType::NasInt => 0x02,
        }
    }
}

/// Derive a 128-bit NAS key from KASME (TS 33.401 A.7: FC = 0x15,
/// P0 = algorithm type distinguisher, P1 = algorithm identity; the NAS
/// keys are the 128 least significant bits of the 256-bit KDF output).
pub fn derive_knas(kasme: &[u8; KASME_LEN], alg_type: KdfAlgType, alg_id: u8) -> [u8; KNAS_LEN] {
    let mut s = Vec::with_capacity(7);
    s.push(0x15);
    s.push(alg_type.distinguisher());
    s.extend_from_slice(&1u16.to_be_bytes());
    s.push(alg_id);
    s.extend_from_slice(&1u16.to_be_bytes());

    let mut mac = HmacSha256::new_from_slice(kasme).expect("hmac accepts any key length");
    mac.update(&s);
    let digest = mac.finalize().into_bytes();

    let mut key = [0u8; KNAS_LEN];
    key.copy_from_slice(&digest[16..32]);
    key
}

/// Pick the first algorithm in the configured preference order the UE
/// supports. Falls back to the null algorithm when nothing matches.
pub fn select_algorithms(
    capability: &UeSecurityCapability,
    ciphering_order: &[u8],
    integrity_order: &[u8],
) -> SelectedAlgorithms {
    let encryption = ciphering_order
        .iter()
        .copied()
        .find(|&alg| alg == NAS_CIPHERING_EEA0 || capability.supports_eea(alg))
        .unwrap_or(NAS_CIPHERING_EEA0);
    let integrity = integrity_order
        .iter()
        .copied()
        .find(|&alg| alg == NAS_INTEGRITY_EIA0 || capability.supports_eia(alg))
        .unwrap_or(NAS_INTEGRITY_EIA0);
    SelectedAlgorithms {
        encryption,
        integrity,
    }
}
