use metrics::{counter, gauge, histogram};

const RECORDS_TOTAL: &str = "tapglue_distributor_records_total";
const APPLY_DURATION_MS: &str = "tapglue_distributor_apply_duration_ms";
const VALIDATION_ERRORS_TOTAL: &str = "tapglue_distributor_validation_errors_total";
const CURSOR_PERSIST_TOTAL: &str = "tapglue_distributor_cursor_persist_total";
const IN_FLIGHT_GAUGE: &str = "tapglue_distributor_in_flight";
const READER_ERRORS_TOTAL: &str = "tapglue_distributor_reader_errors_total";

pub fn register_record(channel: &str, result: &str, duration_ms: f64) {
    counter!(
        RECORDS_TOTAL,
        "channel" => channel.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        APPLY_DURATION_MS,
        "channel" => channel.to_string()
    )
    .record(duration_ms.max(0.0));
}

pub fn register_validation_error(channel: &str) {
    counter!(VALIDATION_ERRORS_TOTAL, "channel" => channel.to_string()).increment(1);
}

pub fn register_cursor_persist(result: &str) {
    counter!(CURSOR_PERSIST_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn set_in_flight(count: u64) {
    gauge!(IN_FLIGHT_GAUGE).set(count as f64);
}

pub fn register_reader_error(kind: &str) {
    counter!(READER_ERRORS_TOTAL, "kind" => kind.to_string()).increment(1);
}
