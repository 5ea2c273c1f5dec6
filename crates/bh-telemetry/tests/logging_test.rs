use bh_telemetry::logging;

#[test]
fn init_is_idempotent() {
    logging::init_logging("bughunt-test", "debug");
    logging::init_logging("bughunt-test", "info");
    logging::init_logging_json("bughunt-test", "info");

    tracing::info!(task_id = "4711", "log line after repeated init");
}

#[test]
fn runtime_format_choice() {
    logging::init("bughunt-test", "warn", true);
    logging::init("bughunt-test", "warn", false);
}
