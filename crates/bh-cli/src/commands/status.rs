use anyhow::Context;
use bh_core::config::Config;
use bh_core::store::TaskStore;

use super::task_store;
use crate::render;

/// Run the `status` subcommand. Reads the store directly, so no credentials
/// are needed.
pub fn show(config: &Config, task_id: &str, json: bool) -> anyhow::Result<()> {
    let store = task_store(config);
    let Some(task) = store.load(task_id).context("reading task store")? else {
        anyhow::bail!("unknown task: {task_id}\n  (hint: `bughunt list` shows known tasks)");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        print!("{}", render::task_summary(&task));
        println!();
        for entry in &task.log {
            println!("{}", render::log_line(entry));
        }
    }
    Ok(())
}

/// Run the `list` subcommand.
pub fn list(config: &Config) -> anyhow::Result<()> {
    let tasks = task_store(config).list().context("reading task store")?;
    if tasks.is_empty() {
        println!("No tasks yet. Start one with `bughunt investigate <error-id>`.");
        return Ok(());
    }
    print!("{}", render::task_table(&tasks));
    Ok(())
}
