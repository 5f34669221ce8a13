//! Wire frames: AGP peering messages and the dispatch/stream protocol.
//!
//! All frames are JSON over a bidirectional transport. Parsers tolerate
//! unknown top-level fields; announcement attributes are kept as raw JSON so
//! one malformed route never poisons the rest of an UPDATE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WeftError;

/// AGP message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum AgpMessageType {
    /// Session establishment and capability exchange.
    Open,
    /// Liveness probe.
    Keepalive,
    /// Route announcements and withdrawals.
    Update,
    /// Request to re-send the full table.
    RouteRefresh,
    /// Protocol-level error notification.
    Error,
}

/// Peer capabilities advertised in OPEN. Unknown keys are retained and
/// ignored (forward compatibility).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Protocol version, `major.minor`.
    #[serde(default = "Capabilities::default_version")]
    pub agp_version: String,
    /// Unrecognized capability keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Capabilities {
    fn default_version() -> String {
        "1.0".to_string()
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            agp_version: Self::default_version(),
            extra: serde_json::Map::new(),
        }
    }
}

/// OPEN message: identifies the peer and negotiates the protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenMessage {
    /// Message discriminator; always `OPEN`.
    #[serde(rename = "type")]
    pub message_type: AgpMessageType,
    /// The peer's router identifier.
    pub router_id: String,
    /// The peer's autonomous domain number.
    pub adn: u32,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Unknown top-level fields, preserved.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OpenMessage {
    /// Validate message structure.
    ///
    /// # Errors
    /// Returns `WeftError::Validation` for a wrong discriminator or empty
    /// router id.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.message_type != AgpMessageType::Open {
            return Err(WeftError::validation(format!(
                "invalid message type: {:?}",
                self.message_type
            )));
        }
        if self.router_id.is_empty() {
            return Err(WeftError::validation("router_id is required"));
        }
        Ok(())
    }

    /// The peer's protocol version.
    #[must_use]
    pub fn agp_version(&self) -> &str {
        &self.capabilities.agp_version
    }
}

/// One announcement inside an UPDATE. Attributes stay raw JSON here; the
/// handler parses and validates them route by route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Destination prefix being announced.
    pub prefix: String,
    /// Raw route attributes; must contain at least `path` and `next_hop`.
    pub attrs: serde_json::Value,
}

/// UPDATE message: announcements and/or withdrawals, optionally attested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    /// Message discriminator; always `UPDATE`.
    #[serde(rename = "type", default = "UpdateMessage::default_type")]
    pub message_type: AgpMessageType,
    /// Routes being announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<Vec<Announcement>>,
    /// Prefixes being withdrawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdraw: Option<Vec<String>>,
    /// Optional route attestation covering the announcements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationData>,
    /// Unknown top-level fields, preserved.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UpdateMessage {
    const fn default_type() -> AgpMessageType {
        AgpMessageType::Update
    }

    /// Validate message structure: the discriminator, the announce/withdraw
    /// presence rule, and that each announcement carries `path` and
    /// `next_hop` in its attributes.
    ///
    /// # Errors
    /// Returns `WeftError::Validation` describing the first failure.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.message_type != AgpMessageType::Update {
            return Err(WeftError::validation(format!(
                "invalid message type: {:?}",
                self.message_type
            )));
        }
        let has_announce = self.announce.as_ref().is_some_and(|a| !a.is_empty());
        let has_withdraw = self.withdraw.as_ref().is_some_and(|w| !w.is_empty());
        if !has_announce && !has_withdraw {
            return Err(WeftError::validation(
                "UPDATE message must have announce or withdraw",
            ));
        }
        if let Some(announce) = &self.announce {
            for entry in announce {
                if entry.prefix.is_empty() {
                    return Err(WeftError::validation("announce missing prefix"));
                }
                let attrs = entry
                    .attrs
                    .as_object()
                    .ok_or_else(|| WeftError::validation("announce attrs must be an object"))?;
                if !attrs.contains_key("path") || !attrs.contains_key("next_hop") {
                    return Err(WeftError::validation(
                        "route attrs missing path or next_hop",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Route Origin Authorization carried inside an attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoaData {
    /// Autonomous system number authorized to originate the prefix.
    pub asn: u32,
    /// Authorized prefix.
    pub prefix: String,
    /// Longest prefix length the authorization extends to.
    #[serde(default = "RoaData::default_max_length")]
    pub max_length: u32,
    /// Authorization validity start (epoch seconds).
    #[serde(with = "chrono::serde::ts_seconds")]
    pub not_before: DateTime<Utc>,
    /// Authorization validity end (epoch seconds).
    #[serde(with = "chrono::serde::ts_seconds")]
    pub not_after: DateTime<Utc>,
}

impl RoaData {
    const fn default_max_length() -> u32 {
        32
    }
}

/// Attestation object accompanying announced routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationData {
    /// The route origin authorization.
    pub roa: RoaData,
    /// PEM-encoded certificate chain.
    #[serde(default)]
    pub certificate_chain: Vec<String>,
    /// Base64-encoded signature over `signed_data`.
    #[serde(default)]
    pub signature: String,
    /// The data that was signed.
    #[serde(default)]
    pub signed_data: String,
}

/// One dispatch target: a persona clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchTarget {
    /// Persona the clone specializes.
    pub persona_id: String,
    /// Globally unique clone id within the fabric.
    pub clone_id: u64,
}

/// Budget envelope attached to a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchBudget {
    /// Token allowance across all targets.
    pub tokens: u64,
    /// Dollar allowance across all targets.
    pub dollars: f64,
}

/// Producer → worker dispatch frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchFrame {
    /// Owning parallel session.
    pub session_id: String,
    /// Clones this dispatch addresses.
    pub targets: Vec<DispatchTarget>,
    /// Budget envelope.
    pub budget: DispatchBudget,
}

/// Worker → producer streamed token frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Owning parallel session.
    pub session_id: String,
    /// Persona emitting the data.
    pub persona_id: String,
    /// Clone emitting the data.
    pub clone_id: u64,
    /// 1-based sequence number within the clone's stream.
    pub seq: u64,
    /// Token payload.
    pub data: String,
}

/// Per-clone completion statistics reported in END frames.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersonaStats {
    /// Tokens emitted by the clone.
    #[serde(default)]
    pub tokens_out: u64,
    /// Wall-clock generation time, milliseconds.
    #[serde(default)]
    pub latency_ms: f64,
    /// Cost attributed to the clone.
    #[serde(default)]
    pub cost_usd: f64,
    /// Unrecognized stat fields, preserved.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Worker → producer stream-termination frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndFrame {
    /// Owning parallel session.
    pub session_id: String,
    /// Persona that finished.
    pub persona_id: String,
    /// Clone that finished.
    pub clone_id: u64,
    /// Completion statistics.
    #[serde(default)]
    pub stats: PersonaStats,
}

/// Frames a worker task sends back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerFrame {
    /// A streamed token chunk.
    Stream(StreamFrame),
    /// End of the clone's stream.
    End(EndFrame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_requires_announce_or_withdraw() {
        let msg: UpdateMessage = serde_json::from_value(serde_json::json!({
            "type": "UPDATE",
        }))
        .unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn unknown_top_level_fields_tolerated() {
        let msg: UpdateMessage = serde_json::from_value(serde_json::json!({
            "type": "UPDATE",
            "withdraw": ["10.0.0.0/8"],
            "experimental_field": 42,
        }))
        .unwrap();
        assert!(msg.validate().is_ok());
        assert!(msg.extra.contains_key("experimental_field"));
    }

    #[test]
    fn announce_attrs_must_carry_path_and_next_hop() {
        let msg: UpdateMessage = serde_json::from_value(serde_json::json!({
            "type": "UPDATE",
            "announce": [{"prefix": "10.0.0.0/8", "attrs": {"path": [65001]}}],
        }))
        .unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn attestation_uses_camel_case_keys() {
        let data: AttestationData = serde_json::from_value(serde_json::json!({
            "roa": {
                "asn": 65001,
                "prefix": "192.0.2.0/24",
                "maxLength": 24,
                "notBefore": 0,
                "notAfter": 4_102_444_800u64,
            },
            "certificateChain": ["cert-a"],
            "signature": "sig",
            "signedData": "payload",
        }))
        .unwrap();
        assert_eq!(data.roa.max_length, 24);
        assert_eq!(data.certificate_chain.len(), 1);
    }
}
