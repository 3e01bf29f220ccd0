//! Docker CLI lister
//!
//! Queries the local engine by running `docker ps` and reading one JSON
//! object per line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::container::DockerPsRow;
use super::{ContainerInfo, ContainerLister, EngineError, EngineResult};

/// Arguments appended to the configured command
const PS_ARGS: [&str; 5] = ["ps", "--all", "--no-trunc", "--format", "{{json .}}"];

/// Default timeout for one `docker ps` invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Lists containers through the docker (or compatible) CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Program followed by any leading arguments, e.g. `["docker"]` or
    /// `["podman"]`
    command: Vec<String>,
    /// Upper bound on a single invocation
    timeout: Duration,
}

impl DockerCli {
    /// Create a lister running the given command
    pub fn new(command: Vec<String>) -> EngineResult<Self> {
        if command.first().map_or(true, |program| program.is_empty()) {
            return Err(EngineError::Unavailable(
                "engine command cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    /// Set the per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command this lister runs
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Parse `docker ps` output, one JSON row per non-empty line
    pub fn parse_output(stdout: &str) -> EngineResult<Vec<ContainerInfo>> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let row: DockerPsRow = serde_json::from_str(line)?;
                Ok(ContainerInfo::from(row))
            })
            .collect()
    }
}

#[async_trait]
impl ContainerLister for DockerCli {
    async fn list_containers(&self) -> EngineResult<Vec<ContainerInfo>> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| EngineError::Unavailable("engine command is empty".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(leading)
            .args(PS_ARGS)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let containers = Self::parse_output(&stdout)?;
        debug!(count = containers.len(), "Listed containers");
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_ROWS: &str = r#"{"ID":"aaa","Names":"web","Image":"nginx","Status":"Up 2 hours","State":"running","CreatedAt":"2024-01-01 10:00:00 +0000 UTC","Ports":"0.0.0.0:8080->80/tcp","Labels":"tier=web"}
{"ID":"bbb","Names":"db","Image":"postgres:16","Status":"Exited (0) 3 days ago","State":"exited","CreatedAt":"2024-01-02","Ports":"","Labels":""}
"#;

    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn sh_lister(script: &tempfile::NamedTempFile) -> DockerCli {
        DockerCli::new(vec![
            "sh".to_string(),
            script.path().to_string_lossy().into_owned(),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_output() {
        let containers = DockerCli::parse_output(TWO_ROWS).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].ports[0].public_port, 8080);
        assert_eq!(containers[0].created, "2024-01-01T10:00:00Z");
        assert_eq!(containers[1].state, "exited");
    }

    #[test]
    fn test_parse_output_empty() {
        assert!(DockerCli::parse_output("").unwrap().is_empty());
        assert!(DockerCli::parse_output("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_output_invalid_row() {
        let result = DockerCli::parse_output("{\"ID\":\"aaa\"}\nnot json\n");
        assert!(matches!(result, Err(EngineError::Parse(_))));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(DockerCli::new(Vec::new()).is_err());
        assert!(DockerCli::new(vec![String::new()]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_containers_from_command() {
        let script = script(&format!("cat <<'EOF'\n{}EOF\n", TWO_ROWS));
        let lister = sh_lister(&script);

        let containers = lister.list_containers().await.unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].image, "postgres:16");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_containers_command_failure() {
        let script = script("echo 'Cannot connect to the Docker daemon' >&2\nexit 1\n");
        let lister = sh_lister(&script);

        match lister.list_containers().await {
            Err(EngineError::CommandFailed { stderr, .. }) => {
                assert!(stderr.contains("Cannot connect"));
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_containers_timeout() {
        let script = script("sleep 5\n");
        let lister = sh_lister(&script).with_timeout(Duration::from_millis(100));

        let result = lister.list_containers().await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_list_containers_missing_binary() {
        let lister = DockerCli::new(vec!["/nonexistent/docker-binary".to_string()]).unwrap();
        let result = lister.list_containers().await;
        assert!(matches!(result, Err(EngineError::Spawn(_))));
    }
}
