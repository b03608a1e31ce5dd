//! EVSE security: certificate store, CSR issuance, chain verification
//!
//! Owns the on-disk certificate material: one leaf bundle per signing use
//! (CSMS client certificate, V2G certificate), trust anchors per CA class,
//! and the cached OCSP responses. Verification walks the presented chain
//! with `x509-parser` and anchors it against the installed CAs; CSR
//! issuance generates a fresh P-256 key with `rcgen`.
//!
//! Layout under the configured root:
//!
//! ```text
//! certs/
//!   ca/{csms,v2g,mo,mf}/*.pem     trust anchors
//!   leaf/{csms,v2g}/leaf.pem      installed chain (leaf first)
//!   leaf/{csms,v2g}/key.pem       private key for the (pending) leaf
//!   ocsp/<hex-hash>.der           cached OCSP responses
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

use crate::domain::{DomainError, InfraError};

// ── Types ──────────────────────────────────────────────────────

/// What a leaf certificate is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateSigningUse {
    ChargingStationCertificate,
    V2GCertificate,
}

impl CertificateSigningUse {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::ChargingStationCertificate => "csms",
            Self::V2GCertificate => "v2g",
        }
    }

    /// The trust-anchor class a chain of this use verifies against.
    pub fn anchor_type(&self) -> CaCertificateType {
        match self {
            Self::ChargingStationCertificate => CaCertificateType::Csms,
            Self::V2GCertificate => CaCertificateType::V2g,
        }
    }
}

/// Trust anchor classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaCertificateType {
    Csms,
    V2g,
    Mo,
    Mf,
}

impl CaCertificateType {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Csms => "csms",
            Self::V2g => "v2g",
            Self::Mo => "mo",
            Self::Mf => "mf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateVerificationResult {
    Valid,
    Expired,
    NotYetValid,
    InvalidSignature,
    IssuerNotFound,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallCertificateResult {
    Accepted,
    Rejected,
    Failed,
}

/// Data needed to build an OCSP request for one installed leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspRequestData {
    /// Hex SHA-256 over the issuer distinguished name (DER).
    pub issuer_name_hash: String,
    /// Hex SHA-256 over the issuer public key (DER).
    pub issuer_key_hash: String,
    /// Hex serial number of the leaf.
    pub serial_number: String,
    /// Responder URL from the leaf's AuthorityInfoAccess, if present.
    pub responder_url: Option<String>,
}

/// Summary of an installed leaf certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafCertificateInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Hex SHA-256 over the leaf DER.
    pub fingerprint: String,
    pub ocsp: Option<OcspRequestData>,
}

const OCSP_ACCESS_METHOD_OID: &str = "1.3.6.1.5.5.7.48.1";

// ── EvseSecurity ───────────────────────────────────────────────

pub struct EvseSecurity {
    root: PathBuf,
}

impl EvseSecurity {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, InfraError> {
        let root = root.into();
        for sub in ["ca/csms", "ca/v2g", "ca/mo", "ca/mf", "leaf/csms", "leaf/v2g", "ocsp"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    fn leaf_dir(&self, use_: CertificateSigningUse) -> PathBuf {
        self.root.join("leaf").join(use_.dir_name())
    }

    fn ca_dir(&self, ca: CaCertificateType) -> PathBuf {
        self.root.join("ca").join(ca.dir_name())
    }

    // ── CSR issuance ───────────────────────────────────────

    /// Generate a fresh P-256 key pair and a PEM-encoded CSR for `use_`.
    /// The key is persisted next to the leaf slot so the signed chain can
    /// be paired with it on installation.
    pub fn generate_csr(
        &self,
        use_: CertificateSigningUse,
        common_name: &str,
        organization: &str,
        country: &str,
    ) -> Result<String, DomainError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| DomainError::Security(format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| DomainError::Security(format!("CSR parameters: {}", e)))?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization);
        params.distinguished_name.push(DnType::CountryName, country);

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| DomainError::Security(format!("CSR serialization: {}", e)))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| DomainError::Security(format!("CSR encoding: {}", e)))?;

        let key_path = self.leaf_dir(use_).join("key.pem");
        write_atomically(&key_path, key_pair.serialize_pem().as_bytes())
            .map_err(|e| DomainError::Security(format!("key persistence: {}", e)))?;

        info!(use_ = ?use_, common_name, "Generated CSR");
        Ok(csr_pem)
    }

    // ── Chain verification & installation ──────────────────

    /// Verify a PEM chain (leaf first) against the trust anchors of the
    /// class matching `use_`.
    pub fn verify_chain(
        &self,
        chain_pem: &str,
        use_: CertificateSigningUse,
    ) -> CertificateVerificationResult {
        let ders = match parse_pem_chain(chain_pem) {
            Ok(d) if !d.is_empty() => d,
            _ => return CertificateVerificationResult::Malformed,
        };
        let anchors = match self.load_anchor_ders(use_.anchor_type()) {
            Ok(a) => a,
            Err(_) => return CertificateVerificationResult::IssuerNotFound,
        };
        verify_chain_against_anchors(&ders, &anchors, Utc::now())
    }

    /// Install a verified leaf chain. The write is atomic (temp + rename)
    /// so a crash mid-install never leaves a half-written bundle.
    pub fn install_certificate_chain(
        &self,
        chain_pem: &str,
        use_: CertificateSigningUse,
    ) -> InstallCertificateResult {
        match self.verify_chain(chain_pem, use_) {
            CertificateVerificationResult::Valid => {}
            other => {
                warn!(use_ = ?use_, result = ?other, "Rejecting certificate chain");
                return InstallCertificateResult::Rejected;
            }
        }
        let path = self.leaf_dir(use_).join("leaf.pem");
        match write_atomically(&path, chain_pem.as_bytes()) {
            Ok(()) => {
                info!(use_ = ?use_, path = %path.display(), "Installed certificate chain");
                InstallCertificateResult::Accepted
            }
            Err(e) => {
                warn!(use_ = ?use_, error = %e, "Certificate install failed");
                InstallCertificateResult::Failed
            }
        }
    }

    /// Install a trust anchor.
    pub fn install_ca_certificate(
        &self,
        pem: &str,
        ca: CaCertificateType,
    ) -> InstallCertificateResult {
        let ders = match parse_pem_chain(pem) {
            Ok(d) if !d.is_empty() => d,
            _ => return InstallCertificateResult::Rejected,
        };
        // name the file after the certificate fingerprint so re-installing
        // the same anchor is idempotent
        let fingerprint = hex::encode(Sha256::digest(&ders[0]));
        let path = self.ca_dir(ca).join(format!("{}.pem", fingerprint));
        match write_atomically(&path, pem.as_bytes()) {
            Ok(()) => InstallCertificateResult::Accepted,
            Err(_) => InstallCertificateResult::Failed,
        }
    }

    pub fn delete_ca_certificate(
        &self,
        ca: CaCertificateType,
        fingerprint: &str,
    ) -> Result<bool, InfraError> {
        let path = self.ca_dir(ca).join(format!("{}.pem", fingerprint));
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ── Leaf inspection ────────────────────────────────────

    pub fn has_leaf_certificate(&self, use_: CertificateSigningUse) -> bool {
        self.leaf_dir(use_).join("leaf.pem").exists()
    }

    /// Expiry, fingerprint and OCSP request data for the installed leaf.
    pub fn get_leaf_certificate_info(
        &self,
        use_: CertificateSigningUse,
    ) -> Result<LeafCertificateInfo, DomainError> {
        let path = self.leaf_dir(use_).join("leaf.pem");
        let pem_text = fs::read_to_string(&path)
            .map_err(|_| DomainError::Security(format!("no leaf installed for {:?}", use_)))?;
        let ders = parse_pem_chain(&pem_text)
            .map_err(|e| DomainError::Security(format!("unreadable leaf bundle: {}", e)))?;
        let leaf_der = ders
            .first()
            .ok_or_else(|| DomainError::Security("empty leaf bundle".to_string()))?;
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| DomainError::Security(format!("leaf parse: {}", e)))?;

        let not_before = asn1_to_utc(leaf.validity().not_before.timestamp());
        let not_after = asn1_to_utc(leaf.validity().not_after.timestamp());
        let fingerprint = hex::encode(Sha256::digest(leaf_der));

        // issuer hashes come from the next chain element when present
        let ocsp = ders.get(1).and_then(|issuer_der| {
            let (_, issuer) = X509Certificate::from_der(issuer_der).ok()?;
            Some(OcspRequestData {
                issuer_name_hash: hex::encode(Sha256::digest(issuer.subject().as_raw())),
                issuer_key_hash: hex::encode(Sha256::digest(
                    issuer.public_key().subject_public_key.data.as_ref(),
                )),
                serial_number: hex::encode(leaf.raw_serial()),
                responder_url: extract_ocsp_responder_url(&leaf),
            })
        });

        Ok(LeafCertificateInfo {
            not_before,
            not_after,
            fingerprint,
            ocsp,
        })
    }

    /// Days of validity the installed leaf has left; negative when expired.
    pub fn days_until_leaf_expires(
        &self,
        use_: CertificateSigningUse,
    ) -> Result<i64, DomainError> {
        let info = self.get_leaf_certificate_info(use_)?;
        Ok((info.not_after - Utc::now()).num_days())
    }

    /// OCSP request data for every installed V2G leaf.
    pub fn get_v2g_ocsp_request_data(&self) -> Vec<OcspRequestData> {
        match self.get_leaf_certificate_info(CertificateSigningUse::V2GCertificate) {
            Ok(info) => info.ocsp.into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }

    // ── OCSP cache ─────────────────────────────────────────

    /// Cache an OCSP response under the serial it answers for.
    pub fn update_ocsp_cache(&self, serial_number: &str, response_der: &[u8]) -> Result<(), InfraError> {
        let path = self.root.join("ocsp").join(format!("{}.der", serial_number));
        write_atomically(&path, response_der)
            .map_err(|e| InfraError::CertificateStore(format!("OCSP cache write: {}", e)))
    }

    pub fn get_cached_ocsp_response(&self, serial_number: &str) -> Option<Vec<u8>> {
        fs::read(self.root.join("ocsp").join(format!("{}.der", serial_number))).ok()
    }

    // ── Internals ──────────────────────────────────────────

    fn load_anchor_ders(&self, ca: CaCertificateType) -> Result<Vec<Vec<u8>>, InfraError> {
        let mut anchors = Vec::new();
        for entry in fs::read_dir(self.ca_dir(ca))? {
            let entry = entry?;
            if entry.path().extension().map(|e| e == "pem").unwrap_or(false) {
                let text = fs::read_to_string(entry.path())?;
                if let Ok(ders) = parse_pem_chain(&text) {
                    anchors.extend(ders);
                }
            }
        }
        Ok(anchors)
    }
}

// ── Free functions ─────────────────────────────────────────────

fn parse_pem_chain(pem_text: &str) -> Result<Vec<Vec<u8>>, InfraError> {
    let mut ders = Vec::new();
    for pem in Pem::iter_from_buffer(pem_text.as_bytes()) {
        let pem = pem.map_err(|e| InfraError::CertificateStore(format!("PEM parse: {}", e)))?;
        if pem.label == "CERTIFICATE" {
            ders.push(pem.contents);
        }
    }
    Ok(ders)
}

fn asn1_to_utc(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now)
}

fn extract_ocsp_responder_url(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.to_id_string() == OCSP_ACCESS_METHOD_OID {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Some(uri.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Walk the chain leaf-first: each element must be within its validity
/// window and signed by its successor; the last element must be signed by
/// one of the anchors (or be an anchor itself).
fn verify_chain_against_anchors(
    chain: &[Vec<u8>],
    anchors: &[Vec<u8>],
    now: DateTime<Utc>,
) -> CertificateVerificationResult {
    let mut parsed = Vec::with_capacity(chain.len());
    for der in chain {
        match X509Certificate::from_der(der) {
            Ok((_, cert)) => parsed.push(cert),
            Err(_) => return CertificateVerificationResult::Malformed,
        }
    }

    for cert in &parsed {
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        if now.timestamp() < not_before {
            return CertificateVerificationResult::NotYetValid;
        }
        if now.timestamp() > not_after {
            return CertificateVerificationResult::Expired;
        }
    }

    for i in 0..parsed.len().saturating_sub(1) {
        let issuer = &parsed[i + 1];
        if parsed[i].issuer().as_raw() != issuer.subject().as_raw() {
            return CertificateVerificationResult::IssuerNotFound;
        }
        if parsed[i].verify_signature(Some(issuer.public_key())).is_err() {
            return CertificateVerificationResult::InvalidSignature;
        }
    }

    // anchor the tail
    let tail = match parsed.last() {
        Some(t) => t,
        None => return CertificateVerificationResult::Malformed,
    };
    for anchor_der in anchors {
        // the tail may itself be an installed anchor
        if chain.last().map(|d| d == anchor_der).unwrap_or(false) {
            return CertificateVerificationResult::Valid;
        }
        if let Ok((_, anchor)) = X509Certificate::from_der(anchor_der) {
            if tail.issuer().as_raw() == anchor.subject().as_raw()
                && tail.verify_signature(Some(anchor.public_key())).is_ok()
            {
                return CertificateVerificationResult::Valid;
            }
        }
    }
    CertificateVerificationResult::IssuerNotFound
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, Certificate, IsCa};

    fn make_ca() -> (Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Test Root CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn make_leaf(ca: &Certificate, ca_key: &KeyPair) -> (String, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "station-001");
        let cert = params.signed_by(&key, ca, ca_key).unwrap();
        (cert.pem(), key)
    }

    fn security() -> EvseSecurity {
        let dir = std::env::temp_dir().join(format!("evse-security-{}", uuid::Uuid::new_v4()));
        EvseSecurity::new(dir).unwrap()
    }

    #[test]
    fn csr_is_pem_encoded_request() {
        let sec = security();
        let csr = sec
            .generate_csr(
                CertificateSigningUse::ChargingStationCertificate,
                "station-001",
                "OcppStation",
                "DE",
            )
            .unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));
        // the key must be persisted for the later CertificateSigned pairing
        assert!(sec
            .leaf_dir(CertificateSigningUse::ChargingStationCertificate)
            .join("key.pem")
            .exists());
    }

    #[test]
    fn chain_verifies_against_installed_anchor() {
        let sec = security();
        let (ca, ca_key) = make_ca();
        let (leaf_pem, _leaf_key) = make_leaf(&ca, &ca_key);

        // no anchor installed yet
        assert_eq!(
            sec.verify_chain(&leaf_pem, CertificateSigningUse::ChargingStationCertificate),
            CertificateVerificationResult::IssuerNotFound
        );

        sec.install_ca_certificate(&ca.pem(), CaCertificateType::Csms);
        assert_eq!(
            sec.verify_chain(&leaf_pem, CertificateSigningUse::ChargingStationCertificate),
            CertificateVerificationResult::Valid
        );
    }

    #[test]
    fn chain_signed_by_unknown_ca_rejected() {
        let sec = security();
        let (trusted_ca, _) = make_ca();
        sec.install_ca_certificate(&trusted_ca.pem(), CaCertificateType::Csms);

        let (rogue_ca, rogue_key) = make_ca();
        let (leaf_pem, _) = make_leaf(&rogue_ca, &rogue_key);
        assert_eq!(
            sec.verify_chain(&leaf_pem, CertificateSigningUse::ChargingStationCertificate),
            CertificateVerificationResult::IssuerNotFound
        );
    }

    #[test]
    fn install_writes_leaf_and_exposes_info() {
        let sec = security();
        let (ca, ca_key) = make_ca();
        sec.install_ca_certificate(&ca.pem(), CaCertificateType::Csms);
        let (leaf_pem, _) = make_leaf(&ca, &ca_key);
        let chain = format!("{}{}", leaf_pem, ca.pem());

        assert_eq!(
            sec.install_certificate_chain(&chain, CertificateSigningUse::ChargingStationCertificate),
            InstallCertificateResult::Accepted
        );
        assert!(sec.has_leaf_certificate(CertificateSigningUse::ChargingStationCertificate));

        let info = sec
            .get_leaf_certificate_info(CertificateSigningUse::ChargingStationCertificate)
            .unwrap();
        assert!(info.not_after > Utc::now());
        assert_eq!(info.fingerprint.len(), 64);
        let ocsp = info.ocsp.expect("issuer present in bundle");
        assert!(!ocsp.issuer_name_hash.is_empty());
        assert!(!ocsp.serial_number.is_empty());

        let days = sec
            .days_until_leaf_expires(CertificateSigningUse::ChargingStationCertificate)
            .unwrap();
        assert!(days > 0);
    }

    #[test]
    fn garbage_chain_is_malformed() {
        let sec = security();
        assert_eq!(
            sec.verify_chain("not a pem", CertificateSigningUse::V2GCertificate),
            CertificateVerificationResult::Malformed
        );
        assert_eq!(
            sec.install_certificate_chain("not a pem", CertificateSigningUse::V2GCertificate),
            InstallCertificateResult::Rejected
        );
    }

    #[test]
    fn ocsp_cache_roundtrip() {
        let sec = security();
        sec.update_ocsp_cache("0a1b2c", b"fake-der").unwrap();
        assert_eq!(sec.get_cached_ocsp_response("0a1b2c").unwrap(), b"fake-der");
        assert!(sec.get_cached_ocsp_response("deadbeef").is_none());
    }
}
