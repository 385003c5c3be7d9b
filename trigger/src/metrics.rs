use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};

static REGISTER_METRICS: Once = Once::new();

pub const TRIGGER_BATCHES_DELIVERED_TOTAL: &str = "trigger_batches_delivered_total";
pub const TRIGGER_ROWS_DELIVERED_TOTAL: &str = "trigger_rows_delivered_total";
pub const TRIGGER_BATCHES_FAILED_TOTAL: &str = "trigger_batches_failed_total";
pub const TRIGGER_LEASE_RENEWALS_TOTAL: &str = "trigger_lease_renewals_total";
pub const TRIGGER_HANDLER_CANCELLATIONS_TOTAL: &str = "trigger_handler_cancellations_total";
pub const TRIGGER_SCALE_RECOMMENDATIONS_TOTAL: &str = "trigger_scale_recommendations_total";
pub const TRIGGER_UNPROCESSED_CHANGES: &str = "trigger_unprocessed_changes";
pub const TRIGGER_ACTIVE_WORKERS: &str = "trigger_active_workers";

/// Label key for the tracked user-table id.
pub const TABLE_ID_LABEL: &str = "table_id";
/// Label key for the emitted scale recommendation.
pub const RECOMMENDATION_LABEL: &str = "recommendation";

/// Register metrics emitted by the trigger runtime. This should be called
/// before starting a pipeline. It is safe to call this method multiple times.
/// It is guaranteed to register the metrics only once.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            TRIGGER_BATCHES_DELIVERED_TOTAL,
            Unit::Count,
            "Total number of change batches successfully delivered to the handler"
        );

        describe_counter!(
            TRIGGER_ROWS_DELIVERED_TOTAL,
            Unit::Count,
            "Total number of change rows successfully delivered to the handler"
        );

        describe_counter!(
            TRIGGER_BATCHES_FAILED_TOTAL,
            Unit::Count,
            "Total number of handler invocations that failed or were abandoned"
        );

        describe_counter!(
            TRIGGER_LEASE_RENEWALS_TOTAL,
            Unit::Count,
            "Total number of lease renewal rounds performed on in-flight batches"
        );

        describe_counter!(
            TRIGGER_HANDLER_CANCELLATIONS_TOTAL,
            Unit::Count,
            "Total number of handler invocations cancelled after exhausting the renewal budget"
        );

        describe_counter!(
            TRIGGER_SCALE_RECOMMENDATIONS_TOTAL,
            Unit::Count,
            "Total number of scale recommendations emitted, labeled by recommendation"
        );

        describe_gauge!(
            TRIGGER_UNPROCESSED_CHANGES,
            Unit::Count,
            "Change rows observed by the scale monitor at its last heartbeat"
        );

        describe_gauge!(
            TRIGGER_ACTIVE_WORKERS,
            Unit::Count,
            "Workers with a fresh liveness row at the scale monitor's last heartbeat"
        );
    });
}
