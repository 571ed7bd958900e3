//! Running-job metadata in the intermittent cache.
//!
//! Every job claims its identity here before connecting. The entry records
//! the owning process, so a crashed job's claim is reclaimed by the next
//! start instead of blocking it forever, and children name their parent.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::cache::{process_alive, Cache};
use crate::error::{JobError, Result};
use crate::state::JobState;
use crate::topic::JobIdentity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub state: JobState,
    /// `<unit>/<experiment>/<job>` of the owning job, if any.
    pub parent: Option<String>,
}

impl JobMetadata {
    pub fn new(parent: Option<&JobIdentity>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: OffsetDateTime::now_utc(),
            state: JobState::Init,
            parent: parent.map(ToString::to_string),
        }
    }

    /// Whether this entry still blocks a new instance of the job.
    fn is_live(&self) -> bool {
        !self.state.is_terminal() && process_alive(self.pid)
    }
}

#[derive(Clone)]
pub struct JobRegistry {
    cache: Cache,
}

impl JobRegistry {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Claim `identity` for this process. Fails with `AlreadyRunning` while a
    /// live instance holds it.
    pub async fn claim(&self, identity: &JobIdentity, meta: &JobMetadata) -> Result<()> {
        let key = identity.cache_key();
        let raw = serde_json::to_string(meta)?;
        for _ in 0..2 {
            if self.cache.insert_if_absent(&key, &raw).await? {
                debug!(job = %identity.job, "identity claimed");
                return Ok(());
            }
            let Some(current) = self.cache.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<JobMetadata>(&current) {
                Ok(existing) if existing.is_live() => {
                    return Err(JobError::AlreadyRunning {
                        unit: identity.unit.clone(),
                        experiment: identity.experiment.clone(),
                        job: identity.job.clone(),
                    });
                }
                Ok(existing) => {
                    warn!(
                        job = %identity.job,
                        stale_pid = existing.pid,
                        "reclaiming metadata of a job that is no longer running"
                    );
                }
                Err(e) => warn!(job = %identity.job, "replacing unreadable job metadata: {e}"),
            }
            self.cache.delete_if(&key, &current).await?;
        }
        Err(JobError::AlreadyRunning {
            unit: identity.unit.clone(),
            experiment: identity.experiment.clone(),
            job: identity.job.clone(),
        })
    }

    pub async fn update_state(&self, identity: &JobIdentity, state: JobState) -> Result<()> {
        if let Some(mut meta) = self.get(identity).await? {
            if meta.pid == std::process::id() {
                meta.state = state;
                self.cache.set_json(&identity.cache_key(), &meta).await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, identity: &JobIdentity) -> Result<Option<JobMetadata>> {
        Ok(self.cache.get_json(&identity.cache_key()).await?)
    }

    /// Drop the claim if it is still ours.
    pub async fn release(&self, identity: &JobIdentity) -> Result<()> {
        if let Some(meta) = self.get(identity).await? {
            if meta.pid == std::process::id() {
                self.cache.delete(&identity.cache_key()).await?;
            }
        }
        Ok(())
    }

    /// Live jobs on `unit`, across experiments.
    pub async fn running_jobs(&self, unit: &str) -> Result<Vec<(JobIdentity, JobMetadata)>> {
        let prefix = format!("jobs/{unit}/");
        let mut out = Vec::new();
        for key in self.cache.keys(&prefix).await? {
            let Some((experiment, job)) = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split_once('/'))
            else {
                continue;
            };
            let Some(meta) = self.cache.get_json::<JobMetadata>(&key).await.ok().flatten() else {
                continue;
            };
            if meta.is_live() {
                out.push((JobIdentity::new(unit, experiment, job), meta));
            }
        }
        Ok(out)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
