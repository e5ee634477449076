//! Workspace compression pipeline.
//!
//! Two external processes are chained so the workspace never exists as a
//! complete archive on disk or in memory:
//!
//! ```text
//! +-----------+  pipe  +-------------+  ChildStdout  +--------------+
//! | tar -cf - | -----> | zstd --long | ------------> | upload body  |
//! +-----------+        +-------------+               +--------------+
//! ```

pub mod pipeline;

pub use pipeline::{CompressedArchive, CompressionPipeline, Workspace};

use std::ffi::OsString;

/// One external transform process: program plus fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStage {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ProcessStage {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `zstd -<level> --long -T0 -c` (levels above 19 need `--ultra`).
    pub fn zstd(level: u8) -> Self {
        let mut stage = Self::new("zstd");
        if level > 19 {
            stage = stage.arg("--ultra");
        }
        stage
            .arg(format!("-{}", level))
            .arg("--long")
            .arg("-T0")
            .arg("-c")
    }

    /// Display name for errors and logs.
    pub fn name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}
