//! Build, flash, and serial-monitor pipeline for embedded targets.
//!
//! A run takes a firmware source tree and a platform id through four stages:
//! 1. **Compile:** cross-compile with the profile's toolchain and verify the artifact
//! 2. **Deploy:** flash real hardware or boot an emulator
//! 3. **Monitor:** read the device console until a success keyword, a failure
//!    keyword, the end of the stream, or the timeout
//! 4. **Teardown:** stop the emulator and release the device
//!
//! Every run ends in a [`RunReport`] carrying a [`Verdict`].

pub mod artifact;
pub mod compile;
pub mod console;
pub mod deploy;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod process;
pub mod report;
mod session;
pub mod source;

pub use artifact::BuildArtifact;
pub use compile::{compile, CompileOutput, CompilePlan};
pub use deploy::{DeployBackend, DeviceLease, DeviceLeases, RunningTarget, Teardown};
pub use error::{CompileError, DeployError, Diagnostics, PipelineError};
pub use monitor::{Monitor, MonitorConfig, MonitorOutcome, MonitorState};
pub use pipeline::{Pipeline, PipelineConfig, RunHandle};
pub use report::{LogEntry, LogSource, RunReport, Stage, StageTiming, Verdict};
pub use session::RunProgress;
pub use source::SourceTree;

/// Whether serial ports are opened with baud-rate control (`serial` feature).
pub const SERIAL_AVAILABLE: bool = cfg!(feature = "serial");
