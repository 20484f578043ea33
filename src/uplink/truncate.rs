//! The truncate operation: empty entire collections on the API.
//!
//! Unlike delete, truncation ignores local payload files entirely. Every
//! record id is harvested from the API and deleted, again in reverse
//! dependency order, and the local change-log is wiped afterwards so a
//! following send starts from a clean slate.

use std::sync::Arc;

use dialoguer::Confirm;
use serde_json::Value;
use tracing::info;

use crate::uplink::delete::delete_record_by_id;
use crate::uplink::dispatch::{Engine, MAX_TASK_QUEUE_SIZE, RunError, RunResult};
use crate::uplink::fetch::Fetcher;
use crate::uplink::hashlog::ChangeLog;

pub struct Truncator {
    engine: Arc<Engine>,
}

impl Truncator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn truncate(&self) -> RunResult<()> {
        let mut resources = self.engine.resources.clone();
        resources.reverse();
        self.confirm(&resources)?;

        for resource in &resources {
            info!("truncating {resource} ...");
            self.truncate_resource(resource).await?;
        }
        Ok(())
    }

    fn confirm(&self, resources: &[String]) -> RunResult<()> {
        if self.engine.config.run.force_delete {
            return Ok(());
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete EVERY record from {} resource(s) ({}) on the API, \
                 including records that were never sent from here?",
                resources.len(),
                resources.join(", ")
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if confirmed {
            Ok(())
        } else {
            Err(RunError::NotConfirmed)
        }
    }

    async fn truncate_resource(&self, resource: &str) -> RunResult<()> {
        let records = Fetcher::new(self.engine.clone())
            .collect(resource, &["id".to_string()], &[])
            .await?;
        let counters = self.engine.counters();
        let mut pool = self.engine.pool();
        let mut total = 0usize;

        for record in records {
            let Some(id) = record.get("id").and_then(Value::as_str) else {
                continue;
            };
            total += 1;
            let ordinal = total;
            let id = id.to_string();
            let api = self.engine.api.clone();
            let resource_name = resource.to_string();
            let counters_task = counters.clone();
            pool.spawn(async move {
                if counters_task.aborted() {
                    counters_task.skip_with_reason("run aborted after too many failures");
                    return;
                }
                // there is no source file here; failures are attributed to
                // the resource and the record's position in the listing
                delete_record_by_id(
                    &api,
                    &resource_name,
                    &id,
                    &counters_task,
                    resource_name.clone(),
                    ordinal,
                )
                .await;
            });

            if total % MAX_TASK_QUEUE_SIZE == 0 {
                pool.drain(&counters, total).await;
            }
            if counters.aborted() {
                break;
            }
        }
        pool.drain(&counters, total).await;

        let changelog = ChangeLog::load(&self.engine.config.state_dir, resource)?;
        changelog.clear();
        changelog.save()?;

        self.engine.finish_resource(resource, &counters)
    }
}
