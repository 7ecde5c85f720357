//! Job metadata sources

use std::collections::HashMap;
use std::path::PathBuf;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::process::Command;
use tracing::debug;

use crate::ClusterError;
use jobscope_types::JobInfo;

/// Read-only job lookup
pub trait JobSource: Send + Sync {
    /// Fetch metadata for a single job
    fn job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<JobInfo, ClusterError>>;
}

/// In-memory job table, used when metadata is supplied directly
#[derive(Default)]
pub struct StaticJobSource {
    jobs: RwLock<HashMap<String, JobInfo>>,
}

impl StaticJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job
    pub fn insert(&self, job: JobInfo) {
        self.jobs.write().insert(job.job_id.clone(), job);
    }

    pub fn with_job(self, job: JobInfo) -> Self {
        self.insert(job);
        self
    }
}

impl JobSource for StaticJobSource {
    fn job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<JobInfo, ClusterError>> {
        let result = self
            .jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClusterError::JobNotFound(job_id.to_string()));
        Box::pin(async move { result })
    }
}

/// Job lookup through `scontrol show job -o`
pub struct ScontrolJobSource {
    program: String,
}

impl ScontrolJobSource {
    pub fn new() -> Self {
        Self {
            program: "scontrol".to_string(),
        }
    }

    /// Use a different scontrol binary (wrappers, absolute paths)
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Parse the one-line `key=value` record printed by `scontrol show job -o`
    pub fn parse_record(job_id: &str, record: &str) -> Result<JobInfo, ClusterError> {
        let trimmed = record.trim();
        if trimmed.is_empty() || trimmed.contains("Invalid job id") {
            return Err(ClusterError::JobNotFound(job_id.to_string()));
        }

        let mut job = JobInfo::new(job_id);
        for token in trimmed.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let value = match value {
                "" | "(null)" => continue,
                v => v,
            };
            match key {
                "JobId" => job.job_id = value.to_string(),
                "JobName" => job.name = Some(value.to_string()),
                // UserId=alice(1000)
                "UserId" => {
                    let user = value.split('(').next().unwrap_or(value);
                    job.user = Some(user.to_string());
                }
                "JobState" => job.state = Some(value.to_string()),
                "WorkDir" => job.working_dir = Some(PathBuf::from(value)),
                "StdOut" => job.stdout = Some(value.to_string()),
                "StdErr" => job.stderr = Some(value.to_string()),
                "NodeList" => job.node_list = value.to_string(),
                _ => {}
            }
        }

        Ok(job)
    }
}

impl Default for ScontrolJobSource {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSource for ScontrolJobSource {
    fn job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<JobInfo, ClusterError>> {
        Box::pin(async move {
            debug!(job_id, program = %self.program, "querying scheduler");
            let output = Command::new(&self.program)
                .args(["show", "job", "-o", job_id])
                .output()
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("Invalid job id") {
                    return Err(ClusterError::JobNotFound(job_id.to_string()));
                }
                return Err(ClusterError::Scheduler(stderr.trim().to_string()));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            Self::parse_record(job_id, &stdout)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = "JobId=42 JobName=train UserId=alice(1000) GroupId=alice(1000) \
        JobState=RUNNING Reason=None NodeList=node[1-2] BatchHost=node1 \
        WorkDir=/home/alice/run StdErr=/home/alice/run/slurm-42.err StdIn=/dev/null \
        StdOut=/home/alice/run/slurm-42.out";

    #[test]
    fn test_parse_record() {
        let job = ScontrolJobSource::parse_record("42", RECORD).unwrap();
        assert_eq!(job.job_id, "42");
        assert_eq!(job.name.as_deref(), Some("train"));
        assert_eq!(job.user.as_deref(), Some("alice"));
        assert_eq!(job.state.as_deref(), Some("RUNNING"));
        assert_eq!(job.node_list, "node[1-2]");
        assert_eq!(job.working_dir, Some(PathBuf::from("/home/alice/run")));
        assert_eq!(job.stdout.as_deref(), Some("/home/alice/run/slurm-42.out"));
    }

    #[test]
    fn test_parse_pending_job_has_no_nodes() {
        let job = ScontrolJobSource::parse_record("7", "JobId=7 JobState=PENDING NodeList=(null)")
            .unwrap();
        assert!(job.node_list.is_empty());
    }

    #[test]
    fn test_parse_invalid_job() {
        let output = "slurm_load_jobs error: Invalid job id specified";
        let err = ScontrolJobSource::parse_record("9", output).unwrap_err();
        assert!(matches!(err, ClusterError::JobNotFound(id) if id == "9"));
    }

    #[tokio::test]
    async fn test_static_source_lookup() {
        let source = StaticJobSource::new().with_job(JobInfo::new("1"));
        assert!(source.job("1").await.is_ok());
        assert!(matches!(
            source.job("2").await,
            Err(ClusterError::JobNotFound(_))
        ));
    }
}
