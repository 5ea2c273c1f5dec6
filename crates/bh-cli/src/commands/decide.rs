use bh_core::config::Config;
use bh_core::types::Decision;
use tracing::Instrument;

use super::{build_workflow, friendly_error};
use crate::render;

/// Run `approve` / `reject`: resume a paused task with the decision.
pub async fn run(config: &Config, task_id: &str, decision: Decision) -> anyhow::Result<()> {
    let (workflow, _) = build_workflow(config)?;
    let report = workflow
        .resume(task_id, decision)
        .instrument(bh_telemetry::spans::task_span(task_id, "resume"))
        .await
        .map_err(friendly_error)?;
    for update in &report.updates {
        for line in render::update_lines(update) {
            println!("{line}");
        }
    }

    let task = workflow.get_state(task_id).map_err(friendly_error)?;
    println!();
    print!("{}", render::task_summary(&task));
    Ok(())
}
