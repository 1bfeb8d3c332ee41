use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::app::adb::runner::{CommandInvocation, CommandRunner};
use crate::app::config::PipelineConfig;
use crate::app::error::AppError;

const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub success: bool,
    pub artifact_path: PathBuf,
    pub detail: String,
}

/// Produces the installable artifact. The pipeline only looks at the outcome.
pub trait BuildProvider: Send + Sync {
    fn build(&self, trace_id: &str) -> Result<BuildOutput, AppError>;

    fn describe(&self) -> String;
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Runs an external build tool and expects the artifact afterwards.
pub struct CommandBuildProvider {
    runner: Arc<dyn CommandRunner>,
    invocation: CommandInvocation,
    artifact: PathBuf,
    timeout: Duration,
}

impl CommandBuildProvider {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        invocation: CommandInvocation,
        artifact: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            invocation,
            artifact: artifact.into(),
            timeout,
        }
    }
}

impl BuildProvider for CommandBuildProvider {
    fn build(&self, trace_id: &str) -> Result<BuildOutput, AppError> {
        info!(trace_id = %trace_id, command = %self.invocation, "running build");
        let output = self.runner.run(&self.invocation, self.timeout, trace_id)?;
        let tail = tail_lines(&output.combined(), OUTPUT_TAIL_LINES);
        if !output.success() {
            return Ok(BuildOutput {
                success: false,
                artifact_path: self.artifact.clone(),
                detail: format!("build exited with {:?}: {tail}", output.exit_code),
            });
        }
        if !self.artifact.is_file() {
            return Ok(BuildOutput {
                success: false,
                artifact_path: self.artifact.clone(),
                detail: format!("build finished but {} is missing", self.artifact.display()),
            });
        }
        Ok(BuildOutput {
            success: true,
            artifact_path: self.artifact.clone(),
            detail: format!("built {} in {}s", self.artifact.display(), output.duration.as_secs()),
        })
    }

    fn describe(&self) -> String {
        self.invocation.to_string()
    }
}

/// Uses an artifact built elsewhere.
pub struct PrebuiltArtifact {
    artifact: PathBuf,
    require_exists: bool,
}

impl PrebuiltArtifact {
    pub fn new(artifact: impl Into<PathBuf>, require_exists: bool) -> Self {
        Self {
            artifact: artifact.into(),
            require_exists,
        }
    }
}

impl BuildProvider for PrebuiltArtifact {
    fn build(&self, _trace_id: &str) -> Result<BuildOutput, AppError> {
        if self.require_exists && !self.artifact.is_file() {
            return Ok(BuildOutput {
                success: false,
                artifact_path: self.artifact.clone(),
                detail: format!("prebuilt artifact not found: {}", self.artifact.display()),
            });
        }
        Ok(BuildOutput {
            success: true,
            artifact_path: self.artifact.clone(),
            detail: format!("using prebuilt {}", self.artifact.display()),
        })
    }

    fn describe(&self) -> String {
        format!("prebuilt {}", self.artifact.display())
    }
}

/// A configured build command unless `skip_build` is set or no command exists.
/// The artifact only has to exist when something will install it.
pub fn provider_from_config(config: &PipelineConfig, runner: Arc<dyn CommandRunner>) -> Arc<dyn BuildProvider> {
    let artifact = PathBuf::from(config.app.artifact_path.trim());
    let command = config.build.command.trim();
    if config.stages.skip_build || command.is_empty() {
        return Arc::new(PrebuiltArtifact::new(artifact, !config.stages.skip_install));
    }
    let mut invocation = CommandInvocation::new(command, config.build.args.iter().cloned());
    let working_dir = config.build.working_dir.trim();
    if !working_dir.is_empty() {
        invocation = invocation.with_working_dir(Path::new(working_dir));
    }
    Arc::new(CommandBuildProvider::new(
        runner,
        invocation,
        artifact,
        Duration::from_secs(config.stages.timeouts.build_secs.max(1)),
    ))
}
