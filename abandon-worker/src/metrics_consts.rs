pub const MESSAGES_RECEIVED: &str = "abandonment_messages_received_total";
pub const MESSAGES_ACKNOWLEDGED: &str = "abandonment_messages_acknowledged_total";
pub const MESSAGES_FAILED: &str = "abandonment_messages_failed_total";
pub const ACK_FAILED: &str = "abandonment_ack_failures_total";
pub const MALFORMED_MESSAGES: &str = "abandonment_malformed_messages_total";
pub const DATA_QUALITY_FAILURES: &str = "abandonment_data_quality_failures_total";
pub const DEAD_LETTERED: &str = "abandonment_dead_lettered_total";
pub const RECORDS_WRITTEN: &str = "abandonment_records_written_total";
pub const DUPLICATE_RECORDS: &str = "abandonment_duplicate_records_total";
pub const ABANDON_FLAG: &str = "abandonment_flag";
pub const BATCH_SIZE: &str = "abandonment_batch_events";
pub const PROCESSING_TIME: &str = "abandonment_processing_duration_seconds";
pub const QUEUE_RECV_ERRORS: &str = "abandonment_queue_recv_errors_total";
pub const WORKER_SATURATION: &str = "abandonment_worker_saturation_percent";
pub const DRAIN_ABORTED: &str = "abandonment_drain_aborted_tasks_total";

pub const CACHE_HITS: &str = "duration_cache_hits_total";
pub const CACHE_MISSES: &str = "duration_cache_misses_total";
pub const CACHE_GET_FAILURES: &str = "duration_cache_get_failures_total";
pub const CACHE_SET_FAILURES: &str = "duration_cache_set_failures_total";
pub const CACHE_INVALID_ENTRIES: &str = "duration_cache_invalid_entries_total";
pub const LOOKUP_TIME: &str = "duration_lookup_duration_seconds";
