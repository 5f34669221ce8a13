//! Route attestation validation: ROA coverage, origin ASN, certificate
//! chain presence and revocation checks.
//!
//! Chain and signature validation are presence checks pending a real PKI
//! integration; revocation is checked against a TTL-cached set of revoked
//! serials and fails open so a stale CRL never takes the fabric down.

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use sha2::{Digest, Sha256};

use weft_types::{AttestationData, RoaData, WeftError};

/// Outcome of a revocation lookup for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationStatus {
    /// Serial derived from the certificate.
    pub serial_number: String,
    /// Whether the serial appears on a cached CRL.
    pub is_revoked: bool,
}

/// TTL-cached revocation checker.
///
/// Revoked serials are fed in by whatever fetches CRLs out-of-band; lookups
/// that miss the cache are treated as not revoked (fail-open for
/// availability).
pub struct RevocationChecker {
    revoked: Cache<String, ()>,
}

impl std::fmt::Debug for RevocationChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationChecker")
            .field("revoked_serials", &self.revoked.entry_count())
            .finish()
    }
}

impl RevocationChecker {
    /// Build a checker whose entries expire after `refresh_interval`.
    #[must_use]
    pub fn new(refresh_interval: std::time::Duration) -> Self {
        Self {
            revoked: Cache::builder()
                .time_to_live(refresh_interval)
                .max_capacity(100_000)
                .build(),
        }
    }

    /// Derive the serial we key revocations by: the first 16 hex chars of
    /// the certificate digest.
    #[must_use]
    pub fn serial_for(certificate_pem: &str) -> String {
        let digest = Sha256::digest(certificate_pem.as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    /// Mark a serial revoked until the cache entry expires.
    pub fn revoke_serial(&self, serial: impl Into<String>) {
        self.revoked.insert(serial.into(), ());
    }

    /// Check one certificate against the cached revocations.
    #[must_use]
    pub fn check_revocation(&self, certificate_pem: &str) -> RevocationStatus {
        let serial_number = Self::serial_for(certificate_pem);
        let is_revoked = self.revoked.contains_key(&serial_number);
        RevocationStatus {
            serial_number,
            is_revoked,
        }
    }
}

impl Default for RevocationChecker {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(3600))
    }
}

fn roa_covers(roa: &RoaData, route_prefix: &str) -> bool {
    let Some((roa_network, roa_len)) = split_prefix(&roa.prefix) else {
        return false;
    };
    let Some((route_network, route_len)) = split_prefix(route_prefix) else {
        return false;
    };
    roa_network == route_network && roa_len <= route_len && route_len <= roa.max_length
}

fn split_prefix(prefix: &str) -> Option<(&str, u32)> {
    let (network, len) = prefix.split_once('/')?;
    Some((network, len.parse().ok()?))
}

/// Validates attestation objects accompanying announced routes.
#[derive(Debug, Default)]
pub struct AttestationValidator {
    revocation: RevocationChecker,
}

impl AttestationValidator {
    /// Build a validator around an existing revocation checker.
    #[must_use]
    pub const fn new(revocation: RevocationChecker) -> Self {
        Self { revocation }
    }

    /// The revocation checker, for feeding in CRL data.
    #[must_use]
    pub const fn revocation(&self) -> &RevocationChecker {
        &self.revocation
    }

    /// Validate an attestation for a prefix and claimed origin ASN.
    ///
    /// Checks, in order: ROA validity window, ROA prefix coverage, ASN
    /// match, chain presence, signature presence, and revocation of every
    /// chain certificate.
    ///
    /// # Errors
    /// Returns `WeftError::AttestationRejected` naming the failed check.
    pub fn validate_at(
        &self,
        route_prefix: &str,
        asn: u32,
        attestation: &AttestationData,
        now: DateTime<Utc>,
    ) -> Result<(), WeftError> {
        let roa = &attestation.roa;
        if !(roa.not_before <= now && now <= roa.not_after) {
            return Err(WeftError::attestation("roa outside validity window"));
        }
        if !roa_covers(roa, route_prefix) {
            return Err(WeftError::attestation(format!(
                "roa {} does not cover {route_prefix}",
                roa.prefix
            )));
        }
        if roa.asn != asn {
            return Err(WeftError::attestation(format!(
                "asn mismatch: roa={} route={asn}",
                roa.asn
            )));
        }
        if attestation.certificate_chain.is_empty() {
            return Err(WeftError::attestation("empty certificate chain"));
        }
        if attestation.signature.is_empty() || attestation.signed_data.is_empty() {
            return Err(WeftError::attestation("missing signature"));
        }
        for cert in &attestation.certificate_chain {
            let status = self.revocation.check_revocation(cert);
            if status.is_revoked {
                return Err(WeftError::attestation(format!(
                    "certificate {} revoked",
                    status.serial_number
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attestation(prefix: &str, asn: u32) -> AttestationData {
        AttestationData {
            roa: RoaData {
                asn,
                prefix: prefix.to_string(),
                max_length: 24,
                not_before: DateTime::from_timestamp(0, 0).unwrap(),
                not_after: DateTime::from_timestamp(4_102_444_800, 0).unwrap(),
            },
            certificate_chain: vec!["cert-a".into()],
            signature: "sig".into(),
            signed_data: "payload".into(),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn valid_attestation_passes() {
        let validator = AttestationValidator::default();
        let att = attestation("192.0.2.0/24", 65001);
        assert!(validator.validate_at("192.0.2.0/24", 65001, &att, now()).is_ok());
    }

    #[test]
    fn asn_mismatch_rejected() {
        let validator = AttestationValidator::default();
        let att = attestation("192.0.2.0/24", 65001);
        assert!(validator.validate_at("192.0.2.0/24", 65999, &att, now()).is_err());
    }

    #[test]
    fn uncovered_prefix_rejected() {
        let validator = AttestationValidator::default();
        let att = attestation("192.0.2.0/24", 65001);
        assert!(validator.validate_at("198.51.100.0/24", 65001, &att, now()).is_err());
    }

    #[test]
    fn revoked_certificate_rejected() {
        let validator = AttestationValidator::default();
        let att = attestation("192.0.2.0/24", 65001);
        validator
            .revocation()
            .revoke_serial(RevocationChecker::serial_for("cert-a"));
        assert!(validator.validate_at("192.0.2.0/24", 65001, &att, now()).is_err());
    }
}
