//! UPDATE/OPEN message handling: parsing, policy filtering, loop
//! prevention, attestation, and hand-off to the route table.

use chrono::{DateTime, Utc};
use serde_json::Value;

use weft_types::{
    OpenMessage, Route, RouteAttributes, UpdateMessage, WeftError,
};

use crate::attestation::AttestationValidator;
use crate::stats::{HandlerCounters, inc};
use crate::table::RouteTable;

/// Default origin ASN assumed when a route carries no `asn:` prefix in its
/// originator id (private-use range).
const FALLBACK_ASN: u32 = 65_000;

/// Result of OPEN negotiation with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOutcome {
    /// The peer's router id.
    pub peer_router_id: String,
    /// The peer's autonomous domain number.
    pub peer_adn: u32,
    /// Version both sides will speak (the minimum of the two).
    pub negotiated_version: String,
}

/// Result of processing one UPDATE message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateOutcome {
    /// Routes that survived the pipeline and were installed.
    pub accepted: Vec<Route>,
    /// Prefixes withdrawn by the message.
    pub withdrawn: Vec<String>,
}

fn parse_version(version: &str) -> Result<(u32, u32), WeftError> {
    let mut parts = version.splitn(2, '.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| WeftError::validation(format!("malformed version: {version}")))?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((major, minor))
}

/// Handles AGP peering messages for one local router identity.
#[derive(Debug)]
pub struct UpdateHandler {
    router_id: String,
    cluster_id: String,
    our_version: String,
    validator: AttestationValidator,
    counters: HandlerCounters,
}

impl UpdateHandler {
    /// Build a handler for the given local router identity.
    ///
    /// The cluster id is the second `:`-separated token of the router id,
    /// or the full router id when there is no separator.
    #[must_use]
    pub fn new(router_id: impl Into<String>, our_version: impl Into<String>) -> Self {
        let router_id = router_id.into();
        let cluster_id = router_id
            .split(':')
            .nth(1)
            .unwrap_or(&router_id)
            .to_string();
        Self {
            router_id,
            cluster_id,
            our_version: our_version.into(),
            validator: AttestationValidator::default(),
            counters: HandlerCounters::default(),
        }
    }

    /// Swap in a pre-seeded attestation validator.
    #[must_use]
    pub fn with_validator(mut self, validator: AttestationValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Our router identity.
    #[must_use]
    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    /// Handler counter surface.
    #[must_use]
    pub const fn counters(&self) -> &HandlerCounters {
        &self.counters
    }

    /// The attestation validator (for feeding revocation data).
    #[must_use]
    pub const fn validator(&self) -> &AttestationValidator {
        &self.validator
    }

    /// Process an OPEN message and negotiate the protocol version.
    ///
    /// The peer is accepted when the major versions match; the negotiated
    /// version is the numerically lower of the two. Unknown capability keys
    /// are ignored.
    ///
    /// # Errors
    /// Returns `WeftError::Validation` for malformed messages and
    /// `WeftError::VersionIncompatible` on a major-version mismatch.
    pub fn handle_open(&self, message: &Value) -> Result<OpenOutcome, WeftError> {
        let open: OpenMessage = serde_json::from_value(message.clone())?;
        open.validate()?;

        let ours = parse_version(&self.our_version)?;
        let peer_version = open.agp_version().to_string();
        let peers = parse_version(&peer_version)?;
        if ours.0 != peers.0 {
            return Err(WeftError::VersionIncompatible {
                ours: self.our_version.clone(),
                peer: peer_version,
            });
        }
        let negotiated = if peers < ours {
            peer_version.clone()
        } else {
            self.our_version.clone()
        };
        tracing::info!(
            peer = %open.router_id,
            peer_version = %peer_version,
            negotiated = %negotiated,
            "agp open negotiated"
        );
        Ok(OpenOutcome {
            peer_router_id: open.router_id,
            peer_adn: open.adn,
            negotiated_version: negotiated,
        })
    }

    /// Process an UPDATE message against the table.
    ///
    /// # Errors
    /// Returns `WeftError::Validation` when the message itself is
    /// malformed. Per-route failures never fail the message: offending
    /// routes are dropped and counted, the rest proceed.
    pub fn handle_update_at(
        &self,
        table: &mut RouteTable,
        message: &Value,
        peer_router_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, WeftError> {
        let update: UpdateMessage = serde_json::from_value(message.clone()).inspect_err(|_| {
            inc(&self.counters.update_parse_errors_total);
        })?;
        update.validate().inspect_err(|_| {
            inc(&self.counters.update_parse_errors_total);
        })?;

        let mut accepted = Vec::new();
        for entry in update.announce.as_deref().unwrap_or_default() {
            match self.admit_route(table, entry.prefix.clone(), &entry.attrs, peer_router_id, update.attestation.as_ref(), now) {
                Ok(route) => accepted.push(route),
                Err(err) => {
                    tracing::debug!(prefix = %entry.prefix, %err, "route rejected");
                }
            }
        }

        let withdrawn = update.withdraw.clone().unwrap_or_default();
        if !accepted.is_empty() {
            table.update_routes_at(accepted.clone(), now);
        }
        if !withdrawn.is_empty() {
            table.withdraw_routes_at(&withdrawn, Some(peer_router_id), now);
        }

        inc(&self.counters.update_messages_processed_total);
        Ok(UpdateOutcome {
            accepted,
            withdrawn,
        })
    }

    /// [`Self::handle_update_at`] against the current wall clock.
    ///
    /// # Errors
    /// See [`Self::handle_update_at`].
    pub fn handle_update(
        &self,
        table: &mut RouteTable,
        message: &Value,
        peer_router_id: &str,
    ) -> Result<UpdateOutcome, WeftError> {
        self.handle_update_at(table, message, peer_router_id, Utc::now())
    }

    /// Process an UPDATE under an already-negotiated version.
    ///
    /// Behaves like [`Self::handle_update_at`] but attributes schema errors
    /// that look like unknown/unexpected content to protocol mismatch
    /// (`incompatible_updates_total`) instead of the generic parse counter.
    ///
    /// # Errors
    /// See [`Self::handle_update_at`].
    pub fn handle_update_versioned_at(
        &self,
        table: &mut RouteTable,
        message: &Value,
        peer_router_id: &str,
        negotiated_version: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, WeftError> {
        let result = self.handle_update_at(table, message, peer_router_id, now);
        if let Err(err) = &result {
            let text = err.to_string().to_lowercase();
            if text.contains("unknown") || text.contains("unexpected") {
                inc(&self.counters.incompatible_updates_total);
                tracing::warn!(
                    peer = peer_router_id,
                    version = negotiated_version,
                    %err,
                    "incompatible update"
                );
            }
        }
        result
    }

    /// Run one announcement through the admission pipeline.
    fn admit_route(
        &self,
        table: &RouteTable,
        prefix: String,
        attrs: &Value,
        peer_router_id: &str,
        attestation: Option<&weft_types::AttestationData>,
        now: DateTime<Utc>,
    ) -> Result<Route, WeftError> {
        // 1. Parse and validate attributes; bucket rejections.
        let attributes: RouteAttributes = match serde_json::from_value(attrs.clone()) {
            Ok(attributes) => attributes,
            Err(err) => {
                inc(&self.counters.update_parse_errors_total);
                return Err(err.into());
            }
        };
        if let Err(err) = attributes.validate() {
            match &err {
                WeftError::QosBelowFloor { .. } => {
                    inc(&table.counters().qos_fit_rejections_total);
                }
                WeftError::NoExport => {
                    inc(&table.counters().no_export_filtered_total);
                }
                _ => inc(&self.counters.update_parse_errors_total),
            }
            return Err(err);
        }

        let route = Route {
            prefix,
            attributes,
            received_at: now,
            peer_router_id: peer_router_id.to_string(),
        };

        // 2. Loop prevention.
        if let Some(via) = self.loop_check(&route) {
            inc(&self.counters.loops_prevented_total);
            return Err(WeftError::LoopDetected { via });
        }

        // 3. Attestation, when the message carries one.
        if let Some(attestation) = attestation {
            let asn = Self::origin_asn(&route);
            if let Err(err) = self
                .validator
                .validate_at(&route.prefix, asn, attestation, now)
            {
                inc(&table.counters().attestation_rejections_total);
                return Err(err);
            }
        }

        Ok(route)
    }

    /// Returns what matched when accepting the route would create a loop.
    fn loop_check(&self, route: &Route) -> Option<String> {
        let attrs = &route.attributes;
        if attrs.originator_id.as_deref() == Some(self.router_id.as_str()) {
            return Some(format!("originator {}", self.router_id));
        }
        if let Some(cluster_list) = &attrs.cluster_list
            && cluster_list.iter().any(|c| c == &self.cluster_id)
        {
            return Some(format!("cluster {}", self.cluster_id));
        }
        None
    }

    /// Origin ASN for attestation: the leading token of an
    /// `asn:router_id`-shaped originator id. Originator ids without the
    /// `:` separator carry no ASN and get the private-use fallback.
    fn origin_asn(route: &Route) -> u32 {
        route
            .attributes
            .originator_id
            .as_deref()
            .and_then(|originator| originator.split_once(':'))
            .and_then(|(asn, _)| asn.parse().ok())
            .unwrap_or(FALLBACK_ASN)
    }
}
