//! Platform profiles for the hilrun build-flash-test pipeline.
//!
//! A profile describes one microcontroller target end to end:
//! - **Compiler:** cross-compiler, flags, linker script or memory map
//! - **Deploy:** flash tool (hardware) or emulator (emulate), with argument templates
//! - **Console:** serial device and baud rate, or the emulator's virtual console
//! - **Verdict rules:** timeout, success keywords, failure keywords
//!
//! Profiles are loaded from `.profile.toml` files into a [`Registry`] that hands
//! out immutable snapshots, so reloading never disturbs a run in flight.

pub mod error;
pub mod layout;
pub mod parse;
pub mod profile;
pub mod registry;
pub mod template;

pub use error::{ProfileError, Result};
pub use layout::MemoryRegion;
pub use parse::{Severity, ValidationIssue};
pub use profile::{
    ArtifactFormat, ArtifactSpec, CompileStyle, CompilerSpec, ConsoleSpec, DeployMode,
    DeploySpec, LinkerSpec, PlatformProfile, SerialSpec,
};
pub use registry::{Registry, RegistrySnapshot};
pub use template::Vars;
