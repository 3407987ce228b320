//! Platform profile model.
//!
//! A profile is the declarative description of one microcontroller target:
//! how to cross-compile for it, how to put the image on it (flash tool or
//! emulator), where its console lives, and which console output means the
//! firmware passed or failed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::{stm32f1_layout, MemoryRegion};

/// How the compiler is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileStyle {
    /// GCC-like driver: `flags -T <script> -o <output> <sources...>`.
    #[default]
    Gcc,
    /// Vendor SDK build (e.g. `idf.py build`): `flags` only, run inside the source root.
    Sdk,
}

/// Cross-compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompilerSpec {
    /// Executable name or path.
    pub program: String,
    /// Flags; may contain `{placeholders}`.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub style: CompileStyle,
    /// Working directory, relative to the source root. Defaults to the build
    /// directory for `gcc` style and the source root for `sdk` style.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Linker script source. At most one of `script` and `memory` is set;
/// with neither, the toolchain's default script is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LinkerSpec {
    /// Hand-written linker script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Memory map to render a linker script from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory: Vec<MemoryRegion>,
    /// Stack reservation for generated scripts.
    #[serde(default = "default_stack_bytes")]
    pub stack_bytes: u64,
}

impl Default for LinkerSpec {
    fn default() -> Self {
        Self {
            script: None,
            memory: Vec::new(),
            stack_bytes: default_stack_bytes(),
        }
    }
}

fn default_stack_bytes() -> u64 {
    0x1000
}

/// Output artifact container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Elf,
    Bin,
    Hex,
}

impl ArtifactFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Elf => "elf",
            ArtifactFormat::Bin => "bin",
            ArtifactFormat::Hex => "hex",
        }
    }
}

/// Where the compiler leaves its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArtifactSpec {
    /// Output path; relative paths are resolved against the run's build directory.
    /// May reference `{build_dir}`, `{source_dir}` and `{platform}`.
    pub path: String,
    pub format: ArtifactFormat,
}

/// Whether the image goes to real hardware or into an emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Hardware,
    Emulate,
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            DeployMode::Hardware => "hardware",
            DeployMode::Emulate => "emulate",
        })
    }
}

/// How an emulator exposes the device console.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConsoleSpec {
    /// The emulator's standard output is the console (`-serial stdio`).
    #[default]
    Stdio,
    /// The emulator serves the console on a TCP socket (`-serial tcp::PORT,server`).
    Tcp { address: String },
}

/// Flash tool or emulator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeploySpec {
    pub mode: DeployMode,
    /// Flash tool or emulator executable.
    pub program: String,
    /// Arguments; may contain `{placeholders}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// How long an emulator may take to show signs of life.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Emulator console wiring. Ignored in hardware mode.
    #[serde(default)]
    pub console: ConsoleSpec,
}

fn default_startup_grace_ms() -> u64 {
    2000
}

/// Physical serial port parameters (hardware mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SerialSpec {
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for SerialSpec {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud: default_baud(),
        }
    }
}

fn default_baud() -> u32 {
    115_200
}

fn default_timeout_secs() -> u64 {
    30
}

/// Declarative configuration for one target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformProfile {
    /// Registry key (e.g., "stm32-qemu").
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Architecture family (e.g., "arm", "avr", "xtensa").
    pub arch: String,
    /// Overall deadline for the monitor, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Substrings that mean the firmware passed.
    pub success_keywords: Vec<String>,
    /// Substrings that mean the firmware failed. Checked before success keywords.
    pub failure_keywords: Vec<String>,
    /// Optional line the firmware prints when it is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_marker: Option<String>,
    pub compiler: CompilerSpec,
    #[serde(default)]
    pub linker: LinkerSpec,
    pub artifact: ArtifactSpec,
    pub deploy: DeploySpec,
    #[serde(default)]
    pub serial: SerialSpec,
    /// Board-specific placeholder values (flash offsets, programmer configs, ...).
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PlatformProfile {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.deploy.startup_grace_ms)
    }

    pub fn is_emulated(&self) -> bool {
        self.deploy.mode == DeployMode::Emulate
    }

    /// STM32F1 value line, ARM GCC + `qemu-system-arm`.
    pub fn stm32_qemu() -> Self {
        Self {
            id: "stm32-qemu".into(),
            display_name: "STM32 (ARM Cortex-M3, QEMU)".into(),
            description: "STM32VLDISCOVERY emulated by qemu-system-arm".into(),
            arch: "arm".into(),
            timeout_secs: 30,
            success_keywords: strings(&["PASS", "SUCCESS", "STM32 Ready"]),
            failure_keywords: strings(&["FAIL", "ERROR", "HALT"]),
            end_marker: None,
            compiler: CompilerSpec {
                program: "arm-none-eabi-gcc".into(),
                flags: strings(&["-mcpu=cortex-m3", "-mthumb", "-nostdlib"]),
                style: CompileStyle::Gcc,
                working_dir: None,
            },
            linker: LinkerSpec {
                memory: stm32f1_layout(),
                ..LinkerSpec::default()
            },
            artifact: ArtifactSpec {
                path: "firmware.elf".into(),
                format: ArtifactFormat::Elf,
            },
            deploy: DeploySpec {
                mode: DeployMode::Emulate,
                program: "qemu-system-arm".into(),
                args: strings(&[
                    "-M",
                    "stm32vldiscovery",
                    "-kernel",
                    "{artifact}",
                    "-serial",
                    "stdio",
                    "-nographic",
                    "-monitor",
                    "null",
                ]),
                startup_grace_ms: default_startup_grace_ms(),
                console: ConsoleSpec::Stdio,
            },
            serial: SerialSpec::default(),
            vars: BTreeMap::new(),
        }
    }

    /// ATmega328P (Arduino Uno), AVR GCC + `qemu-system-avr`.
    pub fn avr_qemu() -> Self {
        Self {
            id: "avr-qemu".into(),
            display_name: "AVR (Arduino Uno, QEMU)".into(),
            description: "ATmega328P emulated by qemu-system-avr".into(),
            arch: "avr".into(),
            timeout_secs: 30,
            success_keywords: strings(&["PASS", "SUCCESS", "AVR Ready"]),
            failure_keywords: strings(&["FAIL", "ERROR"]),
            end_marker: None,
            compiler: CompilerSpec {
                program: "avr-gcc".into(),
                flags: strings(&["-mmcu=atmega328p", "-O2", "-DF_CPU=16000000UL"]),
                style: CompileStyle::Gcc,
                working_dir: None,
            },
            linker: LinkerSpec::default(),
            artifact: ArtifactSpec {
                path: "firmware.elf".into(),
                format: ArtifactFormat::Elf,
            },
            deploy: DeploySpec {
                mode: DeployMode::Emulate,
                program: "qemu-system-avr".into(),
                args: strings(&[
                    "-M",
                    "arduino-uno",
                    "-bios",
                    "{artifact}",
                    "-serial",
                    "stdio",
                    "-nographic",
                ]),
                startup_grace_ms: default_startup_grace_ms(),
                console: ConsoleSpec::Stdio,
            },
            serial: SerialSpec::default(),
            vars: BTreeMap::new(),
        }
    }

    /// STM32F1 board flashed through an ST-Link with OpenOCD.
    pub fn stm32_stlink() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("interface_cfg".into(), "interface/stlink.cfg".into());
        vars.insert("target_cfg".into(), "target/stm32f1x.cfg".into());
        Self {
            id: "stm32-stlink".into(),
            display_name: "STM32 (ARM Cortex-M, ST-Link)".into(),
            description: "STM32 board flashed with OpenOCD over ST-Link".into(),
            arch: "arm".into(),
            serial: SerialSpec {
                device: "/dev/ttyACM0".into(),
                baud: 115_200,
            },
            deploy: DeploySpec {
                mode: DeployMode::Hardware,
                program: "openocd".into(),
                args: strings(&[
                    "-f",
                    "{interface_cfg}",
                    "-f",
                    "{target_cfg}",
                    "-c",
                    "program {artifact} verify reset exit",
                ]),
                startup_grace_ms: default_startup_grace_ms(),
                console: ConsoleSpec::Stdio,
            },
            vars,
            ..Self::stm32_qemu()
        }
    }

    /// ATmega328P flashed through a USBasp programmer with avrdude.
    pub fn avr_usbasp() -> Self {
        Self {
            id: "avr-usbasp".into(),
            display_name: "AVR (Arduino, USBasp)".into(),
            description: "ATmega328P flashed with avrdude over USBasp".into(),
            serial: SerialSpec {
                device: "/dev/ttyUSB0".into(),
                baud: 9600,
            },
            deploy: DeploySpec {
                mode: DeployMode::Hardware,
                program: "avrdude".into(),
                args: strings(&["-c", "usbasp", "-p", "atmega328p", "-U", "flash:w:{artifact}:e"]),
                startup_grace_ms: default_startup_grace_ms(),
                console: ConsoleSpec::Stdio,
            },
            ..Self::avr_qemu()
        }
    }

    /// ESP32 built with ESP-IDF and flashed with esptool.
    pub fn esp32_idf() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("flash_address".into(), "0x1000".into());
        Self {
            id: "esp32-idf".into(),
            display_name: "ESP32 (ESP-IDF)".into(),
            description: "ESP32 built with idf.py and flashed with esptool.py".into(),
            arch: "xtensa".into(),
            timeout_secs: 30,
            success_keywords: strings(&["PASS", "SUCCESS", "ESP32 Ready"]),
            failure_keywords: strings(&["FAIL", "ERROR", "PANIC"]),
            end_marker: None,
            compiler: CompilerSpec {
                program: "idf.py".into(),
                flags: strings(&["build"]),
                style: CompileStyle::Sdk,
                working_dir: None,
            },
            linker: LinkerSpec::default(),
            artifact: ArtifactSpec {
                path: "{source_dir}/build/app.bin".into(),
                format: ArtifactFormat::Bin,
            },
            deploy: DeploySpec {
                mode: DeployMode::Hardware,
                program: "esptool.py".into(),
                args: strings(&[
                    "--chip",
                    "esp32",
                    "--port",
                    "{serial_port}",
                    "--baud",
                    "{baud}",
                    "write_flash",
                    "{flash_address}",
                    "{artifact}",
                ]),
                startup_grace_ms: default_startup_grace_ms(),
                console: ConsoleSpec::Stdio,
            },
            serial: SerialSpec {
                device: "/dev/ttyUSB0".into(),
                baud: 115_200,
            },
            vars,
        }
    }

    /// All built-in profiles.
    pub fn builtins() -> Vec<Self> {
        vec![
            Self::stm32_qemu(),
            Self::avr_qemu(),
            Self::stm32_stlink(),
            Self::avr_usbasp(),
            Self::esp32_idf(),
        ]
    }
}
