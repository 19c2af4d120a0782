//! Build launching and progress reporting.
//!
//! Factory methods hand a `BuildJob` to a `BuildLauncher`. The launcher starts
//! the work somewhere else and reports progress back as `BuildNotice`s on a
//! channel the agent run loop drains, so build adaptors are only ever touched
//! by the loop that dispatches method calls.
//!
//! `CommandLauncher` runs an external builder process. The job is written to
//! its stdin as JSON; its stdout is read line by line:
//!
//! ```text
//! STATUS BUILDING
//! PERCENT 40
//! FAILED ImageBuildError the installer exited with status 1
//! ```

use crate::build_adaptor::BuildStatus;
use crate::config::BuilderConfig;
use crate::types::{AgentError, REDACTED};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type NoticeSender = mpsc::UnboundedSender<BuildNotice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<BuildNotice>;

/// Create the channel build progress travels on.
pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}

/// Factory method that started a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOperation {
    Image,
    ProviderImage,
    BuildImage,
    PushImage,
}

impl BuildOperation {
    pub fn method_name(&self) -> &'static str {
        match self {
            BuildOperation::Image => "image",
            BuildOperation::ProviderImage => "provider_image",
            BuildOperation::BuildImage => "build_image",
            BuildOperation::PushImage => "push_image",
        }
    }

    /// Status a build enters once its launcher accepted it.
    pub fn active_status(&self) -> BuildStatus {
        match self {
            BuildOperation::Image | BuildOperation::BuildImage => BuildStatus::Building,
            BuildOperation::ProviderImage | BuildOperation::PushImage => BuildStatus::Pushing,
        }
    }
}

/// Provider credentials. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Everything a builder needs to carry out one build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildJob {
    pub operation: BuildOperation,
    /// Identifier of the image this build produces.
    pub new_image_id: String,
    pub image: String,
    pub build: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Progress reported by a running build.
#[derive(Debug, Clone, PartialEq)]
pub enum NoticeKind {
    Status(BuildStatus),
    Percent(u32),
    Failed { error_type: String, info: String },
    /// The build process is gone.
    Exited { success: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildNotice {
    pub new_image_id: String,
    pub kind: NoticeKind,
}

/// Handle to a launched build, used to cancel it.
#[derive(Debug, Clone, Default)]
pub struct BuildTicket {
    cancel: CancellationToken,
}

impl BuildTicket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Starts builds on behalf of the image factory.
pub trait BuildLauncher: Send + Sync {
    fn launch(&self, job: BuildJob, notices: NoticeSender) -> Result<BuildTicket, AgentError>;
}

/// Parse one line of builder output.
pub fn parse_progress_line(line: &str) -> Option<NoticeKind> {
    let line = line.trim();
    let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match keyword {
        "STATUS" => rest.parse().ok().map(NoticeKind::Status),
        "PERCENT" => rest.parse::<u32>().ok().map(|p| NoticeKind::Percent(p.min(100))),
        "FAILED" => {
            let (error_type, info) = rest.split_once(' ').unwrap_or((rest, ""));
            if error_type.is_empty() {
                return None;
            }
            Some(NoticeKind::Failed {
                error_type: error_type.to_string(),
                info: info.trim().to_string(),
            })
        }
        _ => None,
    }
}

/// Runs each build as an external builder process.
pub struct CommandLauncher {
    config: BuilderConfig,
}

impl CommandLauncher {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Resolve the command path, checking if it exists.
    fn resolve_command(command: &str) -> Result<String, AgentError> {
        let path = std::path::Path::new(command);
        if path.is_absolute() {
            if path.exists() {
                return Ok(command.to_string());
            }
            return Err(AgentError::Invocation(format!(
                "Builder executable not found: {}",
                command
            )));
        }

        match which::which(command) {
            Ok(path) => Ok(path.to_string_lossy().to_string()),
            Err(_) => Err(AgentError::Invocation(format!(
                "Builder executable not found: {}",
                command
            ))),
        }
    }
}

impl BuildLauncher for CommandLauncher {
    fn launch(&self, job: BuildJob, notices: NoticeSender) -> Result<BuildTicket, AgentError> {
        let command_path = Self::resolve_command(&self.config.command)?;
        let payload = serde_json::to_string(&job)?;

        info!(
            command = %command_path,
            operation = job.operation.method_name(),
            image_id = %job.new_image_id,
            "Spawning builder"
        );

        let mut cmd = Command::new(&command_path);
        cmd.args(&self.config.args)
            .arg(job.operation.method_name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = self.config.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Invocation(format!("Failed to spawn '{}': {}", self.config.command, e))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            AgentError::Invocation("Failed to capture builder stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Invocation("Failed to capture builder stdout".to_string())
        })?;

        debug!(pid = ?child.id(), "Builder process started");

        let ticket = BuildTicket::new();
        tokio::spawn(monitor_build(
            job.new_image_id,
            child,
            stdin,
            payload,
            stdout,
            notices,
            ticket.token(),
        ));

        Ok(ticket)
    }
}

/// Feed the job to the builder and relay its progress until it exits or
/// the build is cancelled.
async fn monitor_build(
    new_image_id: String,
    mut child: Child,
    mut stdin: ChildStdin,
    payload: String,
    stdout: ChildStdout,
    notices: NoticeSender,
    cancel: CancellationToken,
) {
    let written = async {
        stdin.write_all(payload.as_bytes()).await?;
        stdin.shutdown().await
    }
    .await;
    if let Err(e) = written {
        warn!(image_id = %new_image_id, error = %e, "Failed to send job to builder");
    }
    drop(stdin);

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(image_id = %new_image_id, "Cancelling builder process");
                if let Err(e) = child.kill().await {
                    warn!(image_id = %new_image_id, error = %e, "Failed to kill builder");
                }
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_progress_line(&line) {
                    Some(kind) => {
                        let notice = BuildNotice { new_image_id: new_image_id.clone(), kind };
                        if notices.send(notice).is_err() {
                            debug!(image_id = %new_image_id, "Notice channel closed");
                        }
                    }
                    None => debug!(image_id = %new_image_id, line = %line, "Ignoring builder output"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(image_id = %new_image_id, error = %e, "Error reading builder output");
                    break;
                }
            }
        }
    }

    let success = match child.wait().await {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(image_id = %new_image_id, error = %e, "Failed to wait for builder");
            false
        }
    };

    debug!(image_id = %new_image_id, success, "Builder exited");
    let _ = notices.send(BuildNotice {
        new_image_id,
        kind: NoticeKind::Exited { success },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("STATUS COMPLETED"),
            Some(NoticeKind::Status(BuildStatus::Completed))
        );
        assert_eq!(parse_progress_line("PERCENT 40"), Some(NoticeKind::Percent(40)));
        assert_eq!(parse_progress_line("PERCENT 250"), Some(NoticeKind::Percent(100)));
        assert_eq!(
            parse_progress_line("FAILED ImageBuildError installer exited 1"),
            Some(NoticeKind::Failed {
                error_type: "ImageBuildError".to_string(),
                info: "installer exited 1".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_progress_line_ignores_noise() {
        assert_eq!(parse_progress_line(""), None);
        assert_eq!(parse_progress_line("downloading packages..."), None);
        assert_eq!(parse_progress_line("STATUS DANCING"), None);
        assert_eq!(parse_progress_line("PERCENT lots"), None);
        assert_eq!(parse_progress_line("FAILED"), None);
    }

    #[test]
    fn test_credentials_never_printed() {
        let job = BuildJob {
            operation: BuildOperation::PushImage,
            new_image_id: "n".to_string(),
            image: "i".to_string(),
            build: "b".to_string(),
            template: None,
            target: None,
            provider: Some("ec2-us-east-1".to_string()),
            credentials: Some(Credentials::new("AKIA-secret")),
        };

        let printed = format!("{:?}", job);
        assert!(!printed.contains("AKIA-secret"));
        assert!(printed.contains(REDACTED));

        // The builder itself still receives them
        let payload = serde_json::to_value(&job).unwrap();
        assert_eq!(payload["credentials"], "AKIA-secret");
        assert!(payload.get("template").is_none());
    }

    #[test]
    fn test_operation_active_status() {
        assert_eq!(BuildOperation::Image.active_status(), BuildStatus::Building);
        assert_eq!(BuildOperation::PushImage.active_status(), BuildStatus::Pushing);
        assert_eq!(BuildOperation::ProviderImage.method_name(), "provider_image");
    }

    #[test]
    fn test_missing_builder_executable() {
        let launcher = CommandLauncher::new(BuilderConfig {
            command: "definitely-not-a-real-builder-12345".to_string(),
            ..BuilderConfig::default()
        });
        let (tx, _rx) = notice_channel();
        let job = BuildJob {
            operation: BuildOperation::Image,
            new_image_id: "n".to_string(),
            image: "i".to_string(),
            build: "b".to_string(),
            template: Some("<template/>".to_string()),
            target: Some("ec2".to_string()),
            provider: None,
            credentials: None,
        };

        let err = launcher.launch(job, tx).unwrap_err();
        assert!(err.to_string().contains("Builder executable not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_launcher_relays_progress() {
        let launcher = CommandLauncher::new(BuilderConfig {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "cat > /dev/null; echo 'STATUS BUILDING'; echo 'PERCENT 50'; echo noise; echo 'STATUS COMPLETED'".to_string(),
            ],
            ..BuilderConfig::default()
        });
        let (tx, mut rx) = notice_channel();
        let job = BuildJob {
            operation: BuildOperation::Image,
            new_image_id: "img-1".to_string(),
            image: "i".to_string(),
            build: "b".to_string(),
            template: Some("<template/>".to_string()),
            target: Some("ec2".to_string()),
            provider: None,
            credentials: None,
        };

        launcher.launch(job, tx).unwrap();

        let mut kinds = Vec::new();
        while let Some(notice) = rx.recv().await {
            assert_eq!(notice.new_image_id, "img-1");
            let done = matches!(notice.kind, NoticeKind::Exited { .. });
            kinds.push(notice.kind);
            if done {
                break;
            }
        }

        assert_eq!(
            kinds,
            vec![
                NoticeKind::Status(BuildStatus::Building),
                NoticeKind::Percent(50),
                NoticeKind::Status(BuildStatus::Completed),
                NoticeKind::Exited { success: true },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_build_is_killed() {
        let launcher = CommandLauncher::new(BuilderConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "cat > /dev/null; sleep 30".to_string()],
            ..BuilderConfig::default()
        });
        let (tx, mut rx) = notice_channel();
        let job = BuildJob {
            operation: BuildOperation::Image,
            new_image_id: "img-2".to_string(),
            image: "i".to_string(),
            build: "b".to_string(),
            template: None,
            target: None,
            provider: None,
            credentials: None,
        };

        let ticket = launcher.launch(job, tx).unwrap();
        ticket.cancel();

        let notice = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.kind, NoticeKind::Exited { success: false });
    }
}
