//! Counter surface for the federation engine.
//!
//! Metrics registries are out of scope for this crate; counters are plain
//! atomics that embedders scrape or export however they like.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! counters {
    ($(#[$meta:meta])* $name:ident, $snap:ident { $($(#[$fmeta:meta])* $field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: AtomicU64,)+
        }

        impl $name {
            /// Copy every counter into a plain snapshot.
            #[must_use]
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }

        /// Point-in-time copy of the counters.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct $snap {
            $($(#[$fmeta])* pub $field: u64,)+
        }
    };
}

counters! {
    /// Counters owned by the route table.
    TableCounters, TableCountersSnapshot {
        /// Routes stored or replaced.
        route_updates_total,
        /// Routes removed by withdrawal.
        route_withdrawals_total,
        /// ECMP groups with more than one member handed out.
        ecmp_splits_total,
        /// Prefixes that crossed into suppression on a recorded flap.
        flaps_dampened_total,
        /// Withdrawals/advertisements deferred by hold-down or grace.
        hold_down_events_total,
        /// Times the table fell back to the last-known-good snapshot.
        safe_mode_entries_total,
        /// Snapshots taken.
        route_snapshots_taken_total,
        /// Capacity envelopes scaled down under backpressure.
        backpressure_capacity_reductions_total,
        /// Routes rejected for insufficient QoS support.
        qos_fit_rejections_total,
        /// Routes rejected for carrying `no-export`.
        no_export_filtered_total,
        /// Routes rejected by attestation validation.
        attestation_rejections_total,
    }
}

counters! {
    /// Counters owned by the UPDATE handler.
    HandlerCounters, HandlerCountersSnapshot {
        /// UPDATE messages fully processed.
        update_messages_processed_total,
        /// Announcements dropped for malformed or non-conformant attributes.
        update_parse_errors_total,
        /// Routes dropped by originator/cluster loop checks.
        loops_prevented_total,
        /// Schema errors attributed to protocol version mismatch.
        incompatible_updates_total,
    }
}

/// Bump a counter by one.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
