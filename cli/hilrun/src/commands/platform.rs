//! `hilrun platform`: listing, description, validation, and templates.

use anyhow::{bail, Result};
use hilrun_profiles::parse::{check_profile, generate_template, profile_to_toml};
use hilrun_profiles::{ConsoleSpec, DeployMode, PlatformProfile, Registry};

use crate::commands::load_registry;
use crate::config::Project;

/// List every registered platform.
pub fn list(project: &Project) -> Result<()> {
    let registry = load_registry(project)?;
    let snapshot = registry.snapshot();

    println!("Platforms:");
    println!();
    for profile in snapshot.profiles() {
        println!(
            "  {:<16} {:<9} {}",
            profile.id, profile.deploy.mode, profile.display_name
        );
    }
    println!();
    println!("Use 'hilrun platform describe <id>' for details.");
    Ok(())
}

fn resolve(registry: &Registry, id: &str) -> Result<std::sync::Arc<PlatformProfile>> {
    match registry.snapshot().get(id) {
        Some(p) => Ok(p),
        None => bail!(
            "unknown platform: '{id}'. Use 'hilrun platform list' to see available platforms."
        ),
    }
}

/// Describe a platform in detail.
pub fn describe(project: &Project, id: &str, format: Option<&str>) -> Result<()> {
    let registry = load_registry(project)?;
    let profile = resolve(&registry, id)?;

    match format {
        Some("toml") => {
            print!("{}", profile_to_toml(&profile)?);
            return Ok(());
        }
        Some(other) => bail!("unknown format '{other}' (expected 'toml')"),
        None => {}
    }

    print!("{}", render(&profile));
    Ok(())
}

fn render(profile: &PlatformProfile) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line(format!("=== Platform: {} ===", profile.id));
    line(format!("Name: {}", profile.display_name));
    if !profile.description.is_empty() {
        line(format!("Description: {}", profile.description));
    }
    line(format!("Arch: {}", profile.arch));
    line(String::new());

    line("--- Compiler ---".into());
    line(format!("  Program: {}", profile.compiler.program));
    line(format!("  Style:   {:?}", profile.compiler.style));
    if !profile.compiler.flags.is_empty() {
        line(format!("  Flags:   {}", profile.compiler.flags.join(" ")));
    }
    if let Some(dir) = &profile.compiler.working_dir {
        line(format!("  Working dir: {}", dir.display()));
    }
    if let Some(script) = &profile.linker.script {
        line(format!("  Linker script: {}", script.display()));
    } else if !profile.linker.memory.is_empty() {
        line("  Memory map:".into());
        for region in &profile.linker.memory {
            line(format!(
                "    {}: 0x{:08X} - 0x{:08X} ({} bytes) [{}]",
                region.name,
                region.origin,
                region.end(),
                region.length,
                region.attrs,
            ));
        }
    }
    line(format!(
        "  Artifact: {} ({})",
        profile.artifact.path,
        profile.artifact.format.extension()
    ));
    line(String::new());

    line("--- Deploy ---".into());
    line(format!("  Mode:    {}", profile.deploy.mode));
    line(format!("  Program: {}", profile.deploy.program));
    if !profile.deploy.args.is_empty() {
        line(format!("  Args:    {}", profile.deploy.args.join(" ")));
    }
    match profile.deploy.mode {
        DeployMode::Hardware => {
            line(format!(
                "  Serial:  {} @ {} baud",
                profile.serial.device, profile.serial.baud
            ));
        }
        DeployMode::Emulate => {
            let console = match &profile.deploy.console {
                ConsoleSpec::Stdio => "stdio".to_string(),
                ConsoleSpec::Tcp { address } => format!("tcp {address}"),
            };
            line(format!("  Console: {console}"));
            line(format!("  Startup grace: {} ms", profile.deploy.startup_grace_ms));
        }
    }
    line(String::new());

    line("--- Verdict ---".into());
    line(format!("  Timeout: {} s", profile.timeout_secs));
    line(format!("  Success: {}", quoted(&profile.success_keywords)));
    line(format!("  Failure: {}", quoted(&profile.failure_keywords)));
    if let Some(marker) = &profile.end_marker {
        line(format!("  End marker: '{marker}'"));
    }

    if !profile.vars.is_empty() {
        line(String::new());
        line("--- Vars ---".into());
        for (k, v) in &profile.vars {
            line(format!("  {k} = {v}"));
        }
    }
    out
}

fn quoted(items: &[String]) -> String {
    items
        .iter()
        .map(|k| format!("'{k}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate one platform, or every registered platform.
///
/// Returns the process exit code: 0 when everything checked is valid.
pub fn validate(project: &Project, id: Option<&str>) -> Result<i32> {
    let registry = load_registry(project)?;
    let profiles = match id {
        Some(id) => vec![resolve(&registry, id)?],
        None => registry.snapshot().profiles().cloned().collect(),
    };

    let mut invalid = 0;
    for profile in &profiles {
        let issues = check_profile(profile);
        let errors = issues.iter().filter(|i| i.is_error()).count();
        if errors == 0 {
            println!("{}: ok", profile.id);
        } else {
            invalid += 1;
            println!("{}: {} error(s)", profile.id, errors);
        }
        for issue in &issues {
            println!("  {issue}");
        }
    }

    if profiles.len() > 1 {
        println!();
        println!("{} of {} platform(s) valid", profiles.len() - invalid, profiles.len());
    }
    Ok(if invalid == 0 { 0 } else { 1 })
}

/// Print a template `.profile.toml`.
pub fn template(id: &str) -> Result<()> {
    print!("{}", generate_template(id)?);
    Ok(())
}
