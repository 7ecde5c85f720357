//! Output path and locality resolution

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::client::JobSource;
use crate::nodelist::expand_node_list;
use crate::ClusterError;
use jobscope_types::{JobInfo, OutputKind};

/// Output redirected here is never streamed
pub const NULL_DEVICE: &str = "/dev/null";

/// Resolver settings
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Nodes whose files are readable from this machine
    pub local_nodes: Vec<String>,
    /// Fallback directory when the job has no working directory
    pub spool_dir: PathBuf,
    /// Default stdout file name; `%j` is the job id
    pub stdout_pattern: String,
    /// Default stderr file name; `%j` is the job id
    pub stderr_pattern: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            local_nodes: vec!["localhost".to_string()],
            spool_dir: PathBuf::from("/var/spool/slurm"),
            stdout_pattern: "slurm-%j.out".to_string(),
            stderr_pattern: "slurm-%j.err".to_string(),
        }
    }
}

/// Where a job's output lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub is_remote: bool,
    /// Primary (first) node of the job, if any were assigned
    pub node: Option<String>,
    /// All assigned nodes, expanded
    pub nodes: Vec<String>,
}

/// Resolves output files for jobs using scheduler metadata
pub struct PathResolver {
    source: Arc<dyn JobSource>,
    config: ResolverConfig,
    local_nodes: HashSet<String>,
}

impl PathResolver {
    pub fn new(source: Arc<dyn JobSource>, config: ResolverConfig) -> Self {
        let local_nodes = config
            .local_nodes
            .iter()
            .flat_map(|n| expand_node_list(n))
            .chain(std::iter::once("localhost".to_string()))
            .collect();

        Self {
            source,
            config,
            local_nodes,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the output file, locality and primary node for a job
    pub async fn resolve_output_path(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<ResolvedPath, ClusterError> {
        let job = self.source.job(job_id).await?;
        let path = self.output_path(&job, kind);
        let nodes = expand_node_list(&job.node_list);
        let is_remote = nodes.iter().any(|n| !self.is_local_node(n));

        debug!(
            job_id,
            %kind,
            path = %path.display(),
            is_remote,
            node_count = nodes.len(),
            "resolved output path"
        );

        Ok(ResolvedPath {
            path,
            is_remote,
            node: nodes.first().cloned(),
            nodes,
        })
    }

    /// Whether files on `node` can be read directly
    pub fn is_local_node(&self, node: &str) -> bool {
        self.local_nodes.contains(node)
    }

    /// Pick the output path: declared path, then working dir, then spool dir
    fn output_path(&self, job: &JobInfo, kind: OutputKind) -> PathBuf {
        if let Some(declared) = job.declared_output(kind) {
            let declared = declared.trim();
            if !declared.is_empty() && declared != NULL_DEVICE {
                let expanded = PathBuf::from(expand_placeholders(declared, job));
                return match (&job.working_dir, expanded.is_relative()) {
                    (Some(dir), true) => dir.join(expanded),
                    _ => expanded,
                };
            }
        }

        let pattern = match kind {
            OutputKind::Stdout => &self.config.stdout_pattern,
            OutputKind::Stderr => &self.config.stderr_pattern,
        };
        let file_name = expand_placeholders(pattern, job);

        match &job.working_dir {
            Some(dir) => dir.join(file_name),
            None => self.config.spool_dir.join(file_name),
        }
    }
}

/// Expand `%j` (job id), `%x` (job name), `%u` (user) and `%%`
///
/// Unknown placeholders are left as written.
pub fn expand_placeholders(pattern: &str, job: &JobInfo) -> String {
    let mut out = String::with_capacity(pattern.len() + job.job_id.len());
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('j') => out.push_str(&job.job_id),
            Some('x') => out.push_str(job.name.as_deref().unwrap_or("")),
            Some('u') => out.push_str(job.user.as_deref().unwrap_or("")),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/// Reject paths that can never hold streamable output
pub fn validate_output_path(path: &Path) -> Result<(), ClusterError> {
    if path.as_os_str().is_empty() {
        return Err(ClusterError::InvalidPath("empty path".to_string()));
    }
    if path == Path::new(NULL_DEVICE) {
        return Err(ClusterError::InvalidPath(format!(
            "output is redirected to {NULL_DEVICE}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticJobSource;

    fn job(id: &str) -> JobInfo {
        JobInfo {
            job_id: id.to_string(),
            name: Some("train".to_string()),
            user: Some("alice".to_string()),
            working_dir: Some(PathBuf::from("/scratch/alice")),
            node_list: "node[1-3]".to_string(),
            ..Default::default()
        }
    }

    fn resolver(jobs: Vec<JobInfo>, local: &[&str]) -> PathResolver {
        let source = StaticJobSource::new();
        for j in jobs {
            source.insert(j);
        }
        let config = ResolverConfig {
            local_nodes: local.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        PathResolver::new(Arc::new(source), config)
    }

    #[tokio::test]
    async fn test_explicit_path_wins() {
        let mut j = job("42");
        j.stdout = Some("logs/%x-%j.log".to_string());
        let r = resolver(vec![j], &["node[1-3]"]);

        let resolved = r.resolve_output_path("42", OutputKind::Stdout).await.unwrap();
        assert_eq!(resolved.path, PathBuf::from("/scratch/alice/logs/train-42.log"));
    }

    #[tokio::test]
    async fn test_null_device_falls_back_to_working_dir() {
        let mut j = job("42");
        j.stderr = Some(NULL_DEVICE.to_string());
        let r = resolver(vec![j], &[]);

        let resolved = r.resolve_output_path("42", OutputKind::Stderr).await.unwrap();
        assert_eq!(resolved.path, PathBuf::from("/scratch/alice/slurm-42.err"));
    }

    #[tokio::test]
    async fn test_spool_dir_fallback() {
        let mut j = job("7");
        j.working_dir = None;
        let r = resolver(vec![j], &[]);

        let resolved = r.resolve_output_path("7", OutputKind::Stdout).await.unwrap();
        assert_eq!(resolved.path, PathBuf::from("/var/spool/slurm/slurm-7.out"));
    }

    #[tokio::test]
    async fn test_locality() {
        let r = resolver(vec![job("1")], &["node1", "node2", "node3"]);
        let resolved = r.resolve_output_path("1", OutputKind::Stdout).await.unwrap();
        assert!(!resolved.is_remote);
        assert_eq!(resolved.node.as_deref(), Some("node1"));
        assert_eq!(resolved.nodes.len(), 3);

        let r = resolver(vec![job("1")], &["node[1-2]"]);
        let resolved = r.resolve_output_path("1", OutputKind::Stdout).await.unwrap();
        assert!(resolved.is_remote);
    }

    #[tokio::test]
    async fn test_unassigned_job_is_local() {
        let mut j = job("3");
        j.node_list = String::new();
        let r = resolver(vec![j], &[]);
        let resolved = r.resolve_output_path("3", OutputKind::Stdout).await.unwrap();
        assert!(!resolved.is_remote);
        assert!(resolved.node.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let r = resolver(vec![], &[]);
        assert!(r.resolve_output_path("404", OutputKind::Stdout).await.is_err());
    }

    #[test]
    fn test_validate_output_path() {
        assert!(validate_output_path(Path::new("")).is_err());
        assert!(validate_output_path(Path::new("/dev/null")).is_err());
        assert!(validate_output_path(Path::new("/tmp/out.log")).is_ok());
    }

    #[test]
    fn test_expand_placeholders() {
        let j = job("5");
        assert_eq!(expand_placeholders("%u/%x_%j_100%%", &j), "alice/train_5_100%");
        assert_eq!(expand_placeholders("out-%N.log", &j), "out-%N.log");
    }
}
