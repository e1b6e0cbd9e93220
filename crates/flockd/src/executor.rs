//! External tool invocation.
//!
//! Every state change at the kernel level is carried out by the
//! external block-device configuration tool. The engine hands it a
//! generated resource description on standard input plus an action
//! verb, and gets back the tool's exit status. A tool that could not
//! even be started (binary missing, permission denied) is reported as
//! the reserved status 127 so the engine can tell "the tool failed"
//! from "there is no tool" when deciding whether a retry can help.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use flock_model::consts::EXEC_FAILED;

/// One operation per external verb. Implementations return the tool's
/// exit status; EXEC_FAILED (127) means the tool never started.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Converge the kernel state of a resource to the configuration.
    async fn adjust(&self, res: &str, conf: &str) -> i32;
    /// Bring a resource up completely. Not on the convergence path,
    /// which always goes through `adjust`; used for operator-driven
    /// full starts.
    #[allow(dead_code)]
    async fn up(&self, res: &str, conf: &str) -> i32;
    /// Bring a resource down completely.
    async fn down(&self, res: &str, conf: &str) -> i32;
    /// Switch the resource to the primary role.
    async fn primary(&self, res: &str, conf: &str, force: bool) -> i32;
    /// Switch the resource to the secondary role.
    async fn secondary(&self, res: &str, conf: &str) -> i32;
    /// Connect to the resource's peers.
    async fn connect(&self, res: &str, conf: &str, discard: bool) -> i32;
    /// Disconnect from the resource's peers.
    async fn disconnect(&self, res: &str, conf: &str) -> i32;
    /// Attach a volume's backing device.
    async fn attach(&self, res: &str, vol_id: u8, conf: &str) -> i32;
    /// Detach a volume's backing device.
    async fn detach(&self, res: &str, vol_id: u8, conf: &str) -> i32;
    /// Initialize replication metadata on a volume's backing device.
    async fn create_md(&self, res: &str, vol_id: u8, conf: &str, peers: u8) -> i32;
}

/// Production executor: spawns the configured tool with the generated
/// configuration on stdin and waits for it to exit.
pub struct ToolExecutor {
    tool: PathBuf,
}

impl ToolExecutor {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    async fn invoke(&self, args: &[&str], conf: &str) -> i32 {
        debug!("invoking {} {}", self.tool.display(), args.join(" "));
        let spawned = tokio::process::Command::new(&self.tool)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("cannot start {}: {}", self.tool.display(), e);
                return EXEC_FAILED;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(conf.as_bytes()).await {
                warn!("cannot feed configuration to {}: {}", self.tool.display(), e);
            }
            // Dropping stdin closes the pipe so the tool sees EOF
        }
        match child.wait().await {
            // Killed by signal: no exit code to report
            Ok(status) => status.code().unwrap_or(255),
            Err(e) => {
                warn!("cannot wait for {}: {}", self.tool.display(), e);
                EXEC_FAILED
            }
        }
    }

    fn target(res: &str, vol_id: u8) -> String {
        format!("{}/{}", res, vol_id)
    }
}

#[async_trait]
impl ActionExecutor for ToolExecutor {
    async fn adjust(&self, res: &str, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "adjust", res], conf).await
    }

    async fn up(&self, res: &str, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "up", res], conf).await
    }

    async fn down(&self, res: &str, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "down", res], conf).await
    }

    async fn primary(&self, res: &str, conf: &str, force: bool) -> i32 {
        if force {
            self.invoke(&["-c", "-", "primary", "--force", res], conf).await
        } else {
            self.invoke(&["-c", "-", "primary", res], conf).await
        }
    }

    async fn secondary(&self, res: &str, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "secondary", res], conf).await
    }

    async fn connect(&self, res: &str, conf: &str, discard: bool) -> i32 {
        if discard {
            self.invoke(&["-c", "-", "connect", "--discard-my-data", res], conf)
                .await
        } else {
            self.invoke(&["-c", "-", "connect", res], conf).await
        }
    }

    async fn disconnect(&self, res: &str, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "disconnect", res], conf).await
    }

    async fn attach(&self, res: &str, vol_id: u8, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "attach", &Self::target(res, vol_id)], conf)
            .await
    }

    async fn detach(&self, res: &str, vol_id: u8, conf: &str) -> i32 {
        self.invoke(&["-c", "-", "detach", &Self::target(res, vol_id)], conf)
            .await
    }

    async fn create_md(&self, res: &str, vol_id: u8, conf: &str, peers: u8) -> i32 {
        let peers = peers.to_string();
        self.invoke(
            &[
                "-c",
                "-",
                "create-md",
                "--max-peers",
                &peers,
                &Self::target(res, vol_id),
            ],
            conf,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_status_passthrough() {
        // `true` ignores its arguments and stdin
        let exec = ToolExecutor::new(PathBuf::from("true"));
        assert_eq!(exec.adjust("r1", "resource \"r1\" {}\n").await, 0);

        let exec = ToolExecutor::new(PathBuf::from("false"));
        assert_ne!(exec.adjust("r1", "").await, 0);
    }

    #[tokio::test]
    async fn test_missing_tool_is_exec_failed() {
        let exec = ToolExecutor::new(PathBuf::from("/nonexistent/flock-tool"));
        assert_eq!(exec.down("r1", "").await, EXEC_FAILED);
        assert_eq!(exec.create_md("r1", 0, "", 7).await, EXEC_FAILED);
    }
}
