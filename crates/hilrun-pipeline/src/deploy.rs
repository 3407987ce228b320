//! Deploy stage: get a firmware image running and hand back its console.
//!
//! Two backends, picked from the profile's deploy mode:
//! - **Hardware:** lease the serial device, run the flash tool to completion,
//!   then open the device at the configured baud rate.
//! - **Emulate:** start the emulator, wait for it to show signs of life
//!   (console output or surviving the startup grace period), and attach to its
//!   console over stdio or TCP.
//!
//! Every failure path stops whatever this stage started before returning.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use hilrun_profiles::{ConsoleSpec, DeployMode, PlatformProfile, Vars};
use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifact::BuildArtifact;
use crate::console::{console_reader, ConsoleReader, ConsoleStream};
use crate::error::DeployError;
use crate::monitor::deadline_after;
use crate::process::{read_all, run_captured, CaptureError, SupervisedChild};

/// Pause between TCP console connection attempts.
const CONNECT_RETRY: Duration = Duration::from_millis(100);
/// Upper bound on a single TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long to wait for an emulator's stderr pipe to drain after it stops.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Exclusive claims on serial devices and emulator console endpoints.
///
/// Shared by every run of a pipeline; a second claim on a held key fails fast
/// with [`DeployError::DeviceBusy`].
#[derive(Debug, Clone, Default)]
pub struct DeviceLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> Result<DeviceLease, DeployError> {
        if !self.held.lock().insert(key.to_string()) {
            return Err(DeployError::DeviceBusy {
                device: key.to_string(),
            });
        }
        tracing::debug!(device = key, "device leased");
        Ok(DeviceLease {
            key: key.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
        tracing::debug!(device = %self.key, "device released");
    }
}

/// What shutting a target down left behind.
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    pub exit_code: Option<i32>,
    /// Emulator stderr collected over the run.
    pub stderr: String,
}

/// A deployed, running firmware image and the resources it holds.
pub struct RunningTarget {
    console: ConsoleReader,
    process: Option<SupervisedChild>,
    stderr: Option<JoinHandle<String>>,
    lease: Option<DeviceLease>,
    artifact: BuildArtifact,
    deploy_output: String,
    mode: DeployMode,
}

impl std::fmt::Debug for RunningTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTarget")
            .field("mode", &self.mode)
            .field("pid", &self.pid())
            .field("lease", &self.lease.as_ref().map(DeviceLease::key))
            .field("artifact", &self.artifact.path)
            .finish_non_exhaustive()
    }
}

impl RunningTarget {
    pub fn console(&mut self) -> &mut ConsoleReader {
        &mut self.console
    }

    pub fn artifact(&self) -> &BuildArtifact {
        &self.artifact
    }

    /// Flash tool output (hardware mode only).
    pub fn deploy_output(&self) -> &str {
        &self.deploy_output
    }

    pub fn mode(&self) -> DeployMode {
        self.mode
    }

    /// Emulator process id, if an emulator is running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(SupervisedChild::id)
    }

    /// Close the console, stop the emulator, and release the device.
    pub async fn shutdown(self) -> Teardown {
        let RunningTarget {
            console,
            process,
            stderr,
            lease,
            ..
        } = self;
        drop(console);
        let status = match process {
            Some(child) => child.terminate().await,
            None => None,
        };
        let stderr = collect_stderr(stderr).await;
        drop(lease);
        Teardown {
            exit_code: status.and_then(|s| s.code()),
            stderr,
        }
    }
}

async fn collect_stderr(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_DRAIN, &mut handle).await {
        Ok(Ok(text)) => text,
        _ => {
            handle.abort();
            String::new()
        }
    }
}

/// Deploy strategy, one per deploy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployBackend {
    Hardware,
    Emulator,
}

impl DeployBackend {
    pub fn for_profile(profile: &PlatformProfile) -> Self {
        match profile.deploy.mode {
            DeployMode::Hardware => DeployBackend::Hardware,
            DeployMode::Emulate => DeployBackend::Emulator,
        }
    }

    /// Deploy `artifact`, taking ownership of it for the rest of the run.
    pub async fn deploy(
        self,
        profile: &PlatformProfile,
        artifact: BuildArtifact,
        build_dir: &Path,
        leases: &DeviceLeases,
        cancel: &CancellationToken,
    ) -> Result<RunningTarget, DeployError> {
        let vars = deploy_vars(profile, &artifact, build_dir);
        let args = vars.expand_all(&profile.deploy.args)?;
        match self {
            DeployBackend::Hardware => {
                deploy_hardware(profile, artifact, args, build_dir, leases, cancel).await
            }
            DeployBackend::Emulator => {
                deploy_emulator(profile, artifact, args, build_dir, leases, cancel).await
            }
        }
    }
}

fn deploy_vars(profile: &PlatformProfile, artifact: &BuildArtifact, build_dir: &Path) -> Vars {
    let mut vars = Vars::new()
        .with("artifact", artifact.path.display().to_string())
        .with("serial_port", &profile.serial.device)
        .with("baud", profile.serial.baud.to_string())
        .with("build_dir", build_dir.display().to_string())
        .with("platform", &profile.id);
    vars.extend_missing(&profile.vars);
    vars
}

fn spawn_error(program: &str, e: io::Error) -> DeployError {
    if e.kind() == io::ErrorKind::NotFound {
        DeployError::ToolMissing {
            program: program.to_string(),
        }
    } else {
        DeployError::Spawn {
            program: program.to_string(),
            source: e,
        }
    }
}

fn device_present(device: &str) -> bool {
    if cfg!(windows) {
        return true;
    }
    Path::new(device).exists()
}

/// Lease key for a serial device: its canonical path, so two names for one port collide.
async fn device_key(device: &str) -> String {
    match tokio::fs::canonicalize(device).await {
        Ok(path) => path.display().to_string(),
        Err(_) => device.to_string(),
    }
}

async fn deploy_hardware(
    profile: &PlatformProfile,
    artifact: BuildArtifact,
    args: Vec<String>,
    build_dir: &Path,
    leases: &DeviceLeases,
    cancel: &CancellationToken,
) -> Result<RunningTarget, DeployError> {
    let device = &profile.serial.device;
    let lease = leases.acquire(&device_key(device).await)?;
    if !device_present(device) {
        return Err(DeployError::DeviceMissing {
            device: device.clone(),
        });
    }

    let program = &profile.deploy.program;
    tracing::info!(program = %program, device = %device, "flashing");
    let mut cmd = Command::new(program);
    cmd.args(&args).current_dir(build_dir);
    let captured = run_captured(cmd, program, cancel)
        .await
        .map_err(|e| match e {
            CaptureError::Spawn(e) | CaptureError::Wait(e) => spawn_error(program, e),
            CaptureError::Cancelled => DeployError::Cancelled,
        })?;

    let mut output = captured.stdout;
    output.push_str(&captured.stderr);
    if !captured.status.success() {
        return Err(DeployError::FlashFailed {
            code: captured.status.code(),
            output,
        });
    }

    let stream = open_serial(device, profile.serial.baud).await?;
    tracing::info!(device = %device, baud = profile.serial.baud, "serial console open");
    Ok(RunningTarget {
        console: console_reader(stream),
        process: None,
        stderr: None,
        lease: Some(lease),
        artifact,
        deploy_output: output,
        mode: DeployMode::Hardware,
    })
}

#[cfg(feature = "serial")]
async fn open_serial(device: &str, baud: u32) -> Result<ConsoleStream, DeployError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(device, baud)
        .open_native_async()
        .map_err(|e| DeployError::DeviceOpen {
            device: device.to_string(),
            detail: e.to_string(),
        })?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(device: &str, baud: u32) -> Result<ConsoleStream, DeployError> {
    tracing::warn!(
        device,
        baud,
        "built without the `serial` feature; opening device as a plain file (baud rate not applied)"
    );
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .open(device)
        .await
        .map_err(|e| DeployError::DeviceOpen {
            device: device.to_string(),
            detail: e.to_string(),
        })?;
    Ok(Box::new(file))
}

async fn deploy_emulator(
    profile: &PlatformProfile,
    artifact: BuildArtifact,
    args: Vec<String>,
    build_dir: &Path,
    leases: &DeviceLeases,
    cancel: &CancellationToken,
) -> Result<RunningTarget, DeployError> {
    let lease = match &profile.deploy.console {
        ConsoleSpec::Tcp { address } => Some(leases.acquire(address)?),
        ConsoleSpec::Stdio => None,
    };

    let program = &profile.deploy.program;
    let mut cmd = Command::new(program);
    cmd.args(&args)
        .current_dir(build_dir)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());
    match profile.deploy.console {
        ConsoleSpec::Stdio => cmd.stdout(Stdio::piped()),
        ConsoleSpec::Tcp { .. } => cmd.stdout(Stdio::null()),
    };

    let mut child = SupervisedChild::spawn(cmd, program).map_err(|e| spawn_error(program, e))?;
    tracing::info!(program = %program, pid = ?child.id(), "emulator started");
    let stderr = child.take_stderr().map(|s| tokio::spawn(read_all(Some(s))));

    match boot(profile, &mut child, cancel).await {
        Ok(console) => Ok(RunningTarget {
            console,
            process: Some(child),
            stderr,
            lease,
            artifact,
            deploy_output: String::new(),
            mode: DeployMode::Emulate,
        }),
        Err(mut err) => {
            child.terminate().await;
            let tail = collect_stderr(stderr).await;
            if let DeployError::EmulatorExited { stderr, .. } = &mut err {
                *stderr = tail;
            }
            tracing::warn!(program = %program, error = %err, "emulator failed to start");
            Err(err)
        }
    }
}

enum BootSignal {
    Output,
    Eof,
    GraceElapsed,
    ReadFailed(io::Error),
}

fn exited(status: Option<std::process::ExitStatus>) -> DeployError {
    DeployError::EmulatorExited {
        code: status.and_then(|s| s.code()),
        stderr: String::new(),
    }
}

/// Wait for the emulator to come alive and return its console.
async fn boot(
    profile: &PlatformProfile,
    child: &mut SupervisedChild,
    cancel: &CancellationToken,
) -> Result<ConsoleReader, DeployError> {
    let grace = profile.startup_grace();
    match &profile.deploy.console {
        ConsoleSpec::Stdio => {
            let stdout = child
                .take_stdout()
                .ok_or_else(|| DeployError::ConsoleUnavailable {
                    address: "stdio".into(),
                    detail: "emulator stdout was not captured".into(),
                })?;
            let mut reader = console_reader(Box::new(stdout));

            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                r = reader.fill_buf() => match r {
                    Ok(buf) if !buf.is_empty() => BootSignal::Output,
                    Ok(_) => BootSignal::Eof,
                    Err(e) => BootSignal::ReadFailed(e),
                },
                _ = tokio::time::sleep(grace) => BootSignal::GraceElapsed,
            };

            match signal {
                BootSignal::Output => Ok(reader),
                BootSignal::GraceElapsed => match child.try_exit() {
                    Ok(Some(status)) => Err(exited(Some(status))),
                    _ => Ok(reader),
                },
                BootSignal::Eof => match child.wait_for(Duration::from_secs(1)).await {
                    Some(status) => Err(exited(Some(status))),
                    None => Err(DeployError::ConsoleUnavailable {
                        address: "stdio".into(),
                        detail: "emulator closed its console".into(),
                    }),
                },
                BootSignal::ReadFailed(e) => Err(DeployError::ConsoleUnavailable {
                    address: "stdio".into(),
                    detail: e.to_string(),
                }),
            }
        }
        ConsoleSpec::Tcp { address } => {
            let deadline = deadline_after(Instant::now(), grace);
            loop {
                if let Ok(Some(status)) = child.try_exit() {
                    return Err(exited(Some(status)));
                }
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                    r = tokio::time::timeout(
                        CONNECT_TIMEOUT,
                        TcpStream::connect(address.as_str()),
                    ) => r,
                };
                let detail = match attempt {
                    Ok(Ok(stream)) => {
                        tracing::debug!(address = %address, "connected to emulator console");
                        let stream: ConsoleStream = Box::new(stream);
                        return Ok(console_reader(stream));
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "connect timed out".to_string(),
                };
                if Instant::now() >= deadline {
                    return Err(DeployError::ConsoleUnavailable {
                        address: address.clone(),
                        detail,
                    });
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                    _ = tokio::time::sleep(CONNECT_RETRY) => {}
                }
            }
        }
    }
}
