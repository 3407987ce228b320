//! TOML parsing, serialization, validation, and discovery for platform profiles.
//!
//! Profiles are stored as `<id>.profile.toml` files in a registry directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{ProfileError, Result};
use crate::profile::{CompileStyle, ConsoleSpec, DeployMode, PlatformProfile};
use crate::template::{placeholders, COMPILE_PLACEHOLDERS, DEPLOY_PLACEHOLDERS};

/// File suffix for profile definitions.
pub const PROFILE_SUFFIX: &str = ".profile.toml";

/// Baud rates accepted without a warning.
const STANDARD_BAUDS: &[u32] = &[
    300, 1200, 2400, 4800, 9600, 19_200, 38_400, 57_600, 74_880, 115_200, 230_400, 460_800,
    921_600, 1_000_000, 2_000_000,
];

/// Longest accepted run timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;
/// Longest accepted emulator startup grace: ten minutes.
pub const MAX_STARTUP_GRACE_MS: u64 = 10 * 60 * 1000;

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A validation issue found in a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{tag}: {}", self.message)
    }
}

/// Load a profile from a `.profile.toml` file.
///
/// A relative `linker.script` is resolved against the file's directory.
pub fn load_profile_toml(path: &Path) -> Result<PlatformProfile> {
    if !path.exists() {
        return Err(ProfileError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path)?;
    let mut profile = parse_profile_toml(&content)?;
    if let (Some(script), Some(dir)) = (profile.linker.script.as_mut(), path.parent()) {
        if script.is_relative() {
            *script = dir.join(&*script);
        }
    }
    Ok(profile)
}

/// Parse a profile from a TOML string.
pub fn parse_profile_toml(toml_str: &str) -> Result<PlatformProfile> {
    let profile: PlatformProfile = toml::from_str(toml_str)?;
    Ok(profile)
}

/// Serialize a profile to pretty TOML.
pub fn profile_to_toml(profile: &PlatformProfile) -> Result<String> {
    let toml_str = toml::to_string_pretty(profile)?;
    Ok(toml_str)
}

/// Whether an executable can be started: an existing path, or a name found on `PATH`.
pub fn tool_resolvable(program: &str) -> bool {
    if program.contains('/') || program.contains('\\') {
        Path::new(program).is_file()
    } else {
        which::which(program).is_ok()
    }
}

/// Whether a serial device path is syntactically plausible.
///
/// Accepts absolute Unix paths (`/dev/ttyUSB0`) and Windows `COMn` / `\\.\COMn` names.
pub fn is_well_formed_device(device: &str) -> bool {
    if device.is_empty() || device.chars().any(|c| c.is_whitespace() || c == '\0') {
        return false;
    }
    let com = device.strip_prefix(r"\\.\").unwrap_or(device);
    if let Some(num) = com.strip_prefix("COM") {
        return !num.is_empty() && num.chars().all(|c| c.is_ascii_digit());
    }
    device.starts_with('/') && device.len() > 1 && !device.ends_with('/')
}

fn check_placeholders(
    what: &str,
    args: &[String],
    builtin: &[&str],
    profile: &PlatformProfile,
    issues: &mut Vec<ValidationIssue>,
) {
    for arg in args {
        match placeholders(arg) {
            Ok(names) => {
                for name in names {
                    if !builtin.contains(&name) && !profile.vars.contains_key(name) {
                        issues.push(ValidationIssue::error(format!(
                            "{what} argument '{arg}' references undeclared placeholder '{{{name}}}'"
                        )));
                    }
                }
            }
            Err(e) => issues.push(ValidationIssue::error(format!("{what}: {e}"))),
        }
    }
}

/// Validate a profile for structural correctness and tool availability.
///
/// Returns `Ok(())` if there are no error-level issues; otherwise every issue
/// (warnings included) in a stable order.
pub fn validate_profile(
    profile: &PlatformProfile,
) -> std::result::Result<(), Vec<ValidationIssue>> {
    let issues = check_profile(profile);
    if issues.iter().any(ValidationIssue::is_error) {
        Err(issues)
    } else {
        for w in &issues {
            tracing::warn!(platform = %profile.id, "{}", w.message);
        }
        Ok(())
    }
}

/// Every issue found in a profile, errors and warnings, in a stable order.
pub fn check_profile(profile: &PlatformProfile) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    // 1. Compiler is resolvable
    if profile.compiler.program.trim().is_empty() {
        issues.push(ValidationIssue::error("compiler program is empty"));
    } else if !tool_resolvable(&profile.compiler.program) {
        issues.push(ValidationIssue::error(format!(
            "compiler '{}' is not resolvable on PATH",
            profile.compiler.program
        )));
    }

    // 2. Linker script or memory map, not both
    let linker = &profile.linker;
    if linker.script.is_some() && !linker.memory.is_empty() {
        issues.push(ValidationIssue::error(
            "linker declares both a script and a memory map",
        ));
    }
    if let Some(script) = &linker.script {
        if !script.is_file() {
            issues.push(ValidationIssue::error(format!(
                "linker script '{}' does not exist",
                script.display()
            )));
        }
    }
    if profile.compiler.style == CompileStyle::Sdk && linker.script.is_some() {
        issues.push(ValidationIssue::warning(
            "linker script is ignored for sdk-style builds",
        ));
    }

    // 3. Memory regions are non-empty and don't overlap (pairwise check)
    let regions = &linker.memory;
    for r in regions {
        if r.length == 0 {
            issues.push(ValidationIssue::error(format!(
                "memory region '{}' has length 0",
                r.name
            )));
        }
    }
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            let (a, b) = (&regions[i], &regions[j]);
            if a.overlaps(b) {
                issues.push(ValidationIssue::error(format!(
                    "memory regions '{}' (0x{:X}..0x{:X}) and '{}' (0x{:X}..0x{:X}) overlap",
                    a.name,
                    a.origin,
                    a.end(),
                    b.name,
                    b.origin,
                    b.end()
                )));
            }
        }
    }
    if !regions.is_empty() && crate::layout::render_linker_script(regions, 0).is_none() {
        issues.push(ValidationIssue::error(
            "memory map needs an executable region and a separate writable region",
        ));
    }

    // 4. Templates only reference declared placeholders
    check_placeholders(
        "compiler",
        &profile.compiler.flags,
        COMPILE_PLACEHOLDERS,
        profile,
        &mut issues,
    );
    check_placeholders(
        "artifact",
        std::slice::from_ref(&profile.artifact.path),
        &["build_dir", "source_dir", "platform"],
        profile,
        &mut issues,
    );
    check_placeholders(
        "deploy",
        &profile.deploy.args,
        DEPLOY_PLACEHOLDERS,
        profile,
        &mut issues,
    );
    if profile.artifact.path.trim().is_empty() {
        issues.push(ValidationIssue::error("artifact path is empty"));
    }

    // 5. Deploy tool and console wiring
    if profile.deploy.program.trim().is_empty() {
        issues.push(ValidationIssue::error("deploy program is empty"));
    } else if !tool_resolvable(&profile.deploy.program) {
        issues.push(ValidationIssue::warning(format!(
            "deploy tool '{}' is not resolvable on PATH",
            profile.deploy.program
        )));
    }
    if profile.deploy.startup_grace_ms > MAX_STARTUP_GRACE_MS {
        issues.push(ValidationIssue::error(format!(
            "startup grace {} ms exceeds the {MAX_STARTUP_GRACE_MS} ms limit",
            profile.deploy.startup_grace_ms
        )));
    }
    if let (DeployMode::Emulate, ConsoleSpec::Tcp { address }) =
        (profile.deploy.mode, &profile.deploy.console)
    {
        let well_formed = address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !well_formed {
            issues.push(ValidationIssue::error(format!(
                "console address '{address}' is not host:port"
            )));
        }
    }

    // 6. Serial parameters
    if profile.deploy.mode == DeployMode::Hardware
        && !is_well_formed_device(&profile.serial.device)
    {
        issues.push(ValidationIssue::error(format!(
            "serial device path '{}' is not well-formed",
            profile.serial.device
        )));
    }
    if profile.serial.baud == 0 {
        issues.push(ValidationIssue::error("baud rate is 0"));
    } else if !STANDARD_BAUDS.contains(&profile.serial.baud) {
        issues.push(ValidationIssue::warning(format!(
            "baud rate {} is non-standard",
            profile.serial.baud
        )));
    }

    // 7. Timeout
    if profile.timeout_secs == 0 {
        issues.push(ValidationIssue::error("timeout must be greater than 0"));
    } else if profile.timeout_secs > MAX_TIMEOUT_SECS {
        issues.push(ValidationIssue::error(format!(
            "timeout {} s exceeds the {MAX_TIMEOUT_SECS} s limit",
            profile.timeout_secs
        )));
    }

    // 8. Keyword sets: non-empty, no empty strings, disjoint
    for (what, list) in [
        ("success", &profile.success_keywords),
        ("failure", &profile.failure_keywords),
    ] {
        if list.is_empty() {
            issues.push(ValidationIssue::error(format!("{what} keyword list is empty")));
        }
        if list.iter().any(|k| k.is_empty()) {
            issues.push(ValidationIssue::error(format!(
                "{what} keyword list contains an empty keyword"
            )));
        }
    }
    let success: BTreeSet<&str> = profile.success_keywords.iter().map(String::as_str).collect();
    for k in &profile.failure_keywords {
        if success.contains(k.as_str()) {
            issues.push(ValidationIssue::error(format!(
                "keyword '{k}' appears in both success and failure lists"
            )));
        }
    }
    if let Some(marker) = &profile.end_marker {
        if marker.is_empty() {
            issues.push(ValidationIssue::error("end marker is empty"));
        } else if success.contains(marker.as_str())
            || profile.failure_keywords.iter().any(|k| k == marker)
        {
            issues.push(ValidationIssue::warning(format!(
                "end marker '{marker}' is also a keyword and will never be reached"
            )));
        }
    }

    issues
}

/// Generate a template `.profile.toml` for a new platform.
///
/// Seeds from the STM32 QEMU profile with the given id.
pub fn generate_template(id: &str) -> Result<String> {
    let mut profile = PlatformProfile::stm32_qemu();
    profile.id = id.into();
    profile.display_name = id.into();
    profile.description = String::new();
    profile_to_toml(&profile)
}

/// Discover all `.profile.toml` files in a directory.
///
/// Returns a list of (profile_id, file_path) pairs sorted by id.
pub fn discover_profiles(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut profiles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(PROFILE_SUFFIX))
            .map(str::to_string);
        if let Some(id) = id {
            profiles.push((id, path));
        }
    }
    profiles.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MemoryRegion;

    /// A profile whose tools exist on any Unix test machine.
    fn runnable_profile() -> PlatformProfile {
        let mut p = PlatformProfile::stm32_qemu();
        p.id = "local".into();
        p.compiler.program = "sh".into();
        p.deploy.program = "sh".into();
        p
    }

    #[test]
    fn round_trip_builtins() {
        for original in PlatformProfile::builtins() {
            let toml_str = profile_to_toml(&original).unwrap();
            let parsed = parse_profile_toml(&toml_str).unwrap();
            assert_eq!(original, parsed, "{}", original.id);
        }
    }

    #[test]
    fn parse_minimal_toml() {
        let toml_str = r#"
id = "mini"
display-name = "Minimal"
arch = "arm"
success-keywords = ["PASS"]
failure-keywords = ["FAIL"]

[compiler]
program = "arm-none-eabi-gcc"

[artifact]
path = "out.elf"
format = "elf"

[deploy]
mode = "emulate"
program = "qemu-system-arm"
args = ["-kernel", "{artifact}"]
console = { kind = "tcp", address = "127.0.0.1:4555" }
"#;
        let p = parse_profile_toml(toml_str).unwrap();
        assert_eq!(p.id, "mini");
        assert_eq!(p.timeout_secs, 30);
        assert_eq!(p.serial.baud, 115_200);
        assert_eq!(p.compiler.style, CompileStyle::Gcc);
        assert_eq!(
            p.deploy.console,
            ConsoleSpec::Tcp {
                address: "127.0.0.1:4555".into()
            }
        );
        assert!(p.linker.script.is_none());
    }

    #[test]
    fn parse_invalid_returns_error() {
        assert!(parse_profile_toml("this is not valid toml [[[").is_err());
        assert!(parse_profile_toml("id = \"incomplete\"").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn validate_runnable_profile() {
        assert!(validate_profile(&runnable_profile()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn warnings_do_not_invalidate() {
        let mut p = runnable_profile();
        p.serial.baud = 12_345;
        let issues = check_profile(&p);
        assert!(issues
            .iter()
            .any(|i| !i.is_error() && i.message.contains("12345")));
        assert!(validate_profile(&p).is_ok());
    }

    #[test]
    fn validate_is_idempotent() {
        for p in PlatformProfile::builtins() {
            assert_eq!(validate_profile(&p), validate_profile(&p));
        }
    }

    #[test]
    fn overlapping_keywords_fail() {
        let mut p = runnable_profile();
        p.failure_keywords.push("PASS".into());
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues
            .iter()
            .any(|i| i.is_error() && i.message.contains("both success and failure")));
    }

    #[test]
    fn empty_keywords_fail() {
        let mut p = runnable_profile();
        p.success_keywords.clear();
        p.failure_keywords = vec![String::new()];
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("success keyword list is empty")));
        assert!(issues.iter().any(|i| i.message.contains("empty keyword")));
    }

    #[test]
    fn zero_timeout_fails() {
        let mut p = runnable_profile();
        p.timeout_secs = 0;
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("timeout")));
    }

    #[test]
    fn oversized_durations_fail() {
        let mut p = runnable_profile();
        p.timeout_secs = u64::MAX;
        p.deploy.startup_grace_ms = u64::MAX;
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("timeout") && i.is_error()));
        assert!(issues.iter().any(|i| i.message.contains("startup grace") && i.is_error()));

        p.timeout_secs = MAX_TIMEOUT_SECS;
        p.deploy.startup_grace_ms = MAX_STARTUP_GRACE_MS;
        assert!(check_profile(&p).iter().all(|i| !i.is_error()));
    }

    #[test]
    fn missing_compiler_fails() {
        let mut p = runnable_profile();
        p.compiler.program = "definitely-not-a-real-compiler-xyz".into();
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("not resolvable")));
    }

    #[test]
    fn missing_linker_script_fails() {
        let mut p = runnable_profile();
        p.linker.memory.clear();
        p.linker.script = Some(PathBuf::from("/nonexistent/board.ld"));
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("does not exist")));
    }

    #[test]
    fn overlapping_memory_fails() {
        let mut p = runnable_profile();
        p.linker.memory[1].origin = p.linker.memory[0].origin;
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("overlap")));
    }

    #[test]
    fn code_only_memory_map_fails() {
        let mut p = runnable_profile();
        p.linker.memory = vec![MemoryRegion::new("FLASH", 0, 1024, "rx")];
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("separate writable region")));
    }

    #[cfg(unix)]
    #[test]
    fn undeclared_placeholder_fails() {
        let mut p = runnable_profile();
        p.deploy.args.push("{flash_offset}".into());
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("flash_offset")));

        p.vars.insert("flash_offset".into(), "0x0".into());
        assert!(validate_profile(&p).is_ok());
    }

    #[test]
    fn malformed_serial_device_fails_in_hardware_mode() {
        let mut p = runnable_profile();
        p.deploy.mode = DeployMode::Hardware;
        p.serial.device = "ttyUSB 0".into();
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("not well-formed")));
    }

    #[test]
    fn bad_tcp_console_fails() {
        let mut p = runnable_profile();
        p.deploy.console = ConsoleSpec::Tcp {
            address: "localhost".into(),
        };
        let issues = validate_profile(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("host:port")));
    }

    #[test]
    fn device_syntax() {
        assert!(is_well_formed_device("/dev/ttyUSB0"));
        assert!(is_well_formed_device("COM3"));
        assert!(is_well_formed_device(r"\\.\COM12"));
        assert!(!is_well_formed_device(""));
        assert!(!is_well_formed_device("/dev/"));
        assert!(!is_well_formed_device("ttyUSB0"));
        assert!(!is_well_formed_device("COM"));
    }

    #[test]
    fn generate_template_parses() {
        let toml_str = generate_template("my-board").unwrap();
        let p = parse_profile_toml(&toml_str).unwrap();
        assert_eq!(p.id, "my-board");
        assert!(p.is_emulated());
    }

    #[test]
    fn discover_profiles_finds_files() {
        let dir = tempfile::tempdir().unwrap();
        let template = generate_template("board-a").unwrap();
        std::fs::write(dir.path().join("board-a.profile.toml"), &template).unwrap();
        std::fs::write(dir.path().join("board-b.profile.toml"), &template).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let found = discover_profiles(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "board-a");
        assert_eq!(found[1].0, "board-b");
    }

    #[test]
    fn discover_missing_dir() {
        let found = discover_profiles(Path::new("/nonexistent/profiles")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn load_not_found() {
        let result = load_profile_toml(Path::new("/nonexistent/x.profile.toml"));
        assert!(matches!(result.unwrap_err(), ProfileError::NotFound { .. }));
    }

    #[test]
    fn load_resolves_relative_linker_script() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = runnable_profile();
        p.linker.memory.clear();
        p.linker.script = Some(PathBuf::from("board.ld"));
        let path = dir.path().join("local.profile.toml");
        std::fs::write(&path, profile_to_toml(&p).unwrap()).unwrap();

        let loaded = load_profile_toml(&path).unwrap();
        assert_eq!(loaded.linker.script, Some(dir.path().join("board.ld")));
    }
}
