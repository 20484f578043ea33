//! The send operation: POST local payloads in dependency order.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::uplink::api::ApiClient;
use crate::uplink::directory;
use crate::uplink::dispatch::{Engine, MAX_TASK_QUEUE_SIZE, RunCounters, RunResult};
use crate::uplink::hashlog::{ChangeLog, LogEntry};
use crate::uplink::payload::{Payload, linearize};

pub struct Sender {
    engine: Arc<Engine>,
}

impl Sender {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Sends every selected resource, strictly in dependency order. A
    /// tripped failure threshold stops the run after the current resource's
    /// state is flushed.
    pub async fn send(&self) -> RunResult<()> {
        let resources = directory::with_local_data(
            &self.engine.config.data_dir,
            &self.engine.resources,
        )?;
        for resource in &resources {
            info!("sending resource {resource} ...");
            self.send_resource(resource).await?;
        }
        Ok(())
    }

    async fn send_resource(&self, resource: &str) -> RunResult<()> {
        let changelog = Arc::new(ChangeLog::load(&self.engine.config.state_dir, resource)?);
        let counters = self.engine.counters();
        let mut pool = self.engine.pool();
        let mut total = 0usize;

        'files: for file in directory::data_files_for(&self.engine.config.data_dir, resource) {
            let reader = BufReader::new(File::open(&file)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                total += 1;

                let payload = Payload::new(file.clone(), index + 1, data.to_string());
                let logged = changelog.get(&payload.fingerprint);
                if logged.is_some() && !self.engine.policy.should_process(logged) {
                    counters.mark_skipped();
                    continue;
                }

                pool.spawn(post_payload(
                    self.engine.api.clone(),
                    resource.to_string(),
                    payload,
                    counters.clone(),
                    changelog.clone(),
                ));

                if total % MAX_TASK_QUEUE_SIZE == 0 {
                    pool.drain(&counters, total).await;
                }
                if counters.aborted() {
                    break 'files;
                }
            }
        }
        pool.drain(&counters, total).await;

        if counters.skipped() > 0 {
            info!(
                "skipped {} of {} payloads because they were previously processed \
                 and did not match any resend criteria",
                counters.skipped(),
                total
            );
        }

        // Tasks updated the change-log concurrently; flush it even when the
        // failure threshold aborted the resource.
        changelog.save()?;
        self.engine.finish_resource(resource, &counters)
    }
}

/// POSTs one payload and accounts for the response. 401 handling and
/// transient-fault retry live inside the API client; by the time a response
/// reaches here it is attributable to the payload itself.
async fn post_payload(
    api: Arc<ApiClient>,
    resource: String,
    payload: Payload,
    counters: Arc<RunCounters>,
    changelog: Arc<ChangeLog>,
) {
    if counters.aborted() {
        counters.skip_with_reason("run aborted after too many failures");
        return;
    }
    match api.post_record(&resource, payload.data.clone()).await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            counters.increment_status(status);
            if (200..300).contains(&status) {
                counters.mark_succeeded();
            } else {
                counters.record_failure(
                    status,
                    linearize(&body),
                    payload.file_name(),
                    payload.line,
                );
            }
            changelog.record(
                payload.fingerprint,
                LogEntry {
                    last_sent: Utc::now().timestamp(),
                    status,
                },
            );
        }
        Err(e) => {
            counters.record_failure(0, e.to_string(), payload.file_name(), payload.line);
        }
    }
}
