//! Archiver -> compressor process chain.

use crate::archive::ProcessStage;
use crate::error::{BuildError, Result};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

/// The three inputs shipped to the build agent.
#[derive(Debug, Clone)]
pub struct Workspace {
    project_dir: PathBuf,
    info_file: PathBuf,
    resources_dir: PathBuf,
    /// Resources already covered by the project tree
    resources_inside_project: bool,
    resources_exist: bool,
}

impl Workspace {
    /// Validate the layout before anything touches the network.
    ///
    /// The build-resources directory must not be the project root.
    pub fn new(
        project_dir: impl Into<PathBuf>,
        info_file: impl Into<PathBuf>,
        resources_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let project_dir = project_dir.into();
        let info_file = info_file.into();
        let resources_dir = resources_dir.into();

        let project_dir = std::fs::canonicalize(&project_dir).map_err(|e| {
            BuildError::Configuration(format!(
                "project directory {} is not accessible: {}",
                project_dir.display(),
                e
            ))
        })?;

        let (resources_dir, resources_exist) = match std::fs::canonicalize(&resources_dir) {
            Ok(path) => (path, true),
            Err(_) => (absolutize(&project_dir, &resources_dir), false),
        };

        if resources_dir == project_dir {
            return Err(BuildError::Configuration(format!(
                "build resources directory {} must not be the project root",
                resources_dir.display()
            )));
        }

        if !info_file.is_file() {
            return Err(BuildError::Configuration(format!(
                "project info file {} does not exist",
                info_file.display()
            )));
        }
        let info_file = std::fs::canonicalize(&info_file)
            .map_err(|e| BuildError::file_io(&info_file, e))?;

        let resources_inside_project = resources_dir.starts_with(&project_dir);

        Ok(Self {
            project_dir,
            info_file,
            resources_dir,
            resources_inside_project,
            resources_exist,
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn info_file(&self) -> &Path {
        &self.info_file
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    /// Arguments appended to the archiver stage: write the archive to
    /// stdout, project tree at the root, info file and resources beside it.
    pub fn archive_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-c".into(),
            "-f".into(),
            "-".into(),
            "--exclude=./.git".into(),
            "-C".into(),
            self.project_dir.clone().into(),
            ".".into(),
        ];

        if let (Some(dir), Some(name)) = (self.info_file.parent(), self.info_file.file_name()) {
            args.push("-C".into());
            args.push(dir.into());
            args.push(name.into());
        }

        if self.resources_exist && !self.resources_inside_project {
            if let (Some(dir), Some(name)) =
                (self.resources_dir.parent(), self.resources_dir.file_name())
            {
                args.push("-C".into());
                args.push(dir.into());
                args.push(name.into());
            }
        }

        args
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Archiver and compressor definitions; spawned per upload.
#[derive(Debug, Clone)]
pub struct CompressionPipeline {
    archiver: ProcessStage,
    compressor: ProcessStage,
}

impl CompressionPipeline {
    pub fn new(archiver: ProcessStage, compressor: ProcessStage) -> Self {
        Self {
            archiver,
            compressor,
        }
    }

    /// Start both processes. The archiver writes straight into the
    /// compressor's stdin; the compressor's stdout is returned as a reader.
    pub fn spawn(&self, workspace: &Workspace) -> Result<CompressedArchive> {
        let mut archiver = Command::new(&self.archiver.program)
            .args(&self.archiver.args)
            .args(workspace.archive_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.archiver, e))?;

        let archive_out: Stdio = archiver
            .stdout
            .take()
            .ok_or_else(|| BuildError::Upload("archiver stdout not captured".to_string()))?
            .try_into()
            .map_err(|e: io::Error| {
                BuildError::Upload(format!("cannot pipe archiver output: {}", e))
            })?;

        // archiver is dropped (and killed) if the compressor fails to start
        let mut compressor = Command::new(&self.compressor.program)
            .args(&self.compressor.args)
            .stdin(archive_out)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.compressor, e))?;

        let output = compressor
            .stdout
            .take()
            .ok_or_else(|| BuildError::Upload("compressor stdout not captured".to_string()))?;

        tracing::debug!(
            "Spawned {} | {} for {}",
            self.archiver.name(),
            self.compressor.name(),
            workspace.project_dir().display()
        );

        Ok(CompressedArchive {
            archiver,
            archiver_name: self.archiver.name(),
            compressor,
            compressor_name: self.compressor.name(),
            output,
        })
    }
}

fn spawn_error(stage: &ProcessStage, err: io::Error) -> BuildError {
    BuildError::Upload(format!("failed to start {}: {}", stage.name(), err))
}

/// Running pipeline; read it to EOF, then call [`CompressedArchive::finish`].
///
/// Dropping it kills both processes.
#[derive(Debug)]
pub struct CompressedArchive {
    archiver: Child,
    archiver_name: String,
    compressor: Child,
    compressor_name: String,
    output: ChildStdout,
}

impl CompressedArchive {
    /// Reap both processes. Any non-zero exit is an upload failure; the
    /// archiver is checked first since a dead archiver makes the compressor
    /// exit cleanly on a truncated stream.
    pub async fn finish(mut self) -> Result<()> {
        let archiver_status = self
            .archiver
            .wait()
            .await
            .map_err(|e| BuildError::Upload(format!("waiting for {}: {}", self.archiver_name, e)))?;
        let compressor_status = self.compressor.wait().await.map_err(|e| {
            BuildError::Upload(format!("waiting for {}: {}", self.compressor_name, e))
        })?;

        check_status(&self.archiver_name, archiver_status)?;
        check_status(&self.compressor_name, compressor_status)
    }
}

fn check_status(name: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(BuildError::Upload(format!("{} exited with {}", name, status)))
    }
}

impl AsyncRead for CompressedArchive {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.output).poll_read(cx, buf)
    }
}
