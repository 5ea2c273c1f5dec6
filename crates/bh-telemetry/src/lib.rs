//! Operator-facing observability for bughunt.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   written to stderr so command output on stdout stays parseable.
//! - **Spans**: per-command spans carrying a generated trace id, and task
//!   spans tagging everything logged for one task.

pub mod logging;
pub mod spans;
