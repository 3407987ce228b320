//! `hilrun doctor`: toolchain and flash-tool diagnostics.

use std::collections::BTreeSet;
use std::process::Command;

use anyhow::Result;
use hilrun_profiles::parse::tool_resolvable;
use hilrun_profiles::DeployMode;

use crate::commands::load_registry;
use crate::config::Project;

/// Print tool availability for every profile, or just `platform`.
pub fn run(project: &Project, platform: Option<&str>) -> Result<()> {
    println!("=== hilrun Doctor ===");
    println!();

    println!("hilrun version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("--- Feature Support ---");
    println!(
        "  Serial baud control: {}",
        if hilrun_pipeline::SERIAL_AVAILABLE {
            "available"
        } else {
            "not compiled (rebuild with --features serial)"
        }
    );
    println!();

    println!("--- Project Status ---");
    if project.found {
        println!("  hilrun.toml: found at {}", project.root.display());
        if let Some(p) = &project.config.project {
            println!("  Project:     {}", p.name);
        }
    } else {
        println!("  hilrun.toml: not found");
    }
    let dir = project.registry_dir();
    println!(
        "  Profiles:    {} ({})",
        dir.display(),
        if dir.is_dir() { "present" } else { "absent, built-ins only" }
    );
    println!();

    let registry = load_registry(project)?;
    let snapshot = registry.snapshot();
    let profiles: Vec<_> = match platform {
        Some(id) => match snapshot.get(id) {
            Some(p) => vec![p],
            None => anyhow::bail!("unknown platform: '{id}'"),
        },
        None => snapshot.profiles().cloned().collect(),
    };

    println!("--- Platforms ---");
    let mut tools = BTreeSet::new();
    for profile in &profiles {
        let compiler = &profile.compiler.program;
        let deploy = &profile.deploy.program;
        println!(
            "  {:<16} compiler {:<24} {}",
            profile.id,
            compiler,
            status(compiler)
        );
        let role = match profile.deploy.mode {
            DeployMode::Hardware => "flasher ",
            DeployMode::Emulate => "emulator",
        };
        println!("  {:<16} {role} {:<24} {}", "", deploy, status(deploy));
        if profile.deploy.mode == DeployMode::Hardware {
            let device = &profile.serial.device;
            let present = std::path::Path::new(device).exists();
            println!(
                "  {:<16} serial   {:<24} {}",
                "",
                device,
                if present { "present" } else { "not connected" }
            );
        }
        tools.insert(compiler.clone());
        tools.insert(deploy.clone());
    }
    println!();

    println!("--- Tool Versions ---");
    for tool in &tools {
        print_tool_status(tool, &["--version"]);
    }

    Ok(())
}

fn status(program: &str) -> &'static str {
    if tool_resolvable(program) {
        "ok"
    } else {
        "not found"
    }
}

fn print_tool_status(name: &str, args: &[&str]) {
    if !tool_resolvable(name) {
        println!("  {name}: not found");
        return;
    }
    match Command::new(name).args(args).output() {
        Ok(output) => {
            let text = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr)
            } else {
                String::from_utf8_lossy(&output.stdout)
            };
            let first_line = text.lines().next().unwrap_or("(unknown version)");
            println!("  {name}: {first_line}");
        }
        Err(_) => {
            println!("  {name}: not found");
        }
    }
}
