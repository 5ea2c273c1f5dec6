use uuid::Uuid;

/// A 32 hex character trace id.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span wrapping one CLI command, with the trace id returned for display.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        operation = %operation,
    );
    (span, trace_id)
}

/// Span tagging work on a single task.
pub fn task_span(task_id: &str, operation: &str) -> tracing::Span {
    tracing::info_span!("task", task_id = %task_id, operation = %operation)
}
