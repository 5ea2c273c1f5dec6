use bh_core::config::Config;
use tracing::Instrument;

use super::{build_workflow, friendly_error};
use crate::render;

/// Run the `investigate` subcommand: fetch, locate, propose, verify, then
/// stop at the approval gate.
pub async fn run(config: &Config, error_id: &str, task_id: Option<&str>) -> anyhow::Result<()> {
    let (workflow, repository) = build_workflow(config)?;
    let updates = workflow.subscribe_task(task_id.unwrap_or(error_id));
    let printer = tokio::spawn(async move {
        while let Ok(update) = updates.recv_async().await {
            for line in render::update_lines(&update) {
                println!("{line}");
            }
        }
    });

    let span = bh_telemetry::spans::task_span(task_id.unwrap_or(error_id), "investigate");
    let outcome = workflow
        .investigate(error_id, repository, task_id)
        .instrument(span)
        .await;
    let snapshot = outcome
        .as_ref()
        .ok()
        .map(|report| workflow.get_state(&report.task_id));

    // Dropping the workflow closes the bus and ends the printer.
    drop(workflow);
    let _ = printer.await;

    outcome.map_err(friendly_error)?;
    if let Some(task) = snapshot {
        let task = task.map_err(friendly_error)?;
        println!();
        print!("{}", render::task_summary(&task));
        if task.is_awaiting_decision() {
            println!();
            println!(
                "Next: `bughunt approve {id}` or `bughunt reject {id}`",
                id = task.id
            );
        }
    }
    Ok(())
}
