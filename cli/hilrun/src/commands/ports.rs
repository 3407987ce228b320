//! `hilrun ports`: candidate serial devices.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Device-name prefixes used by USB serial adapters and on-board debuggers.
const PORT_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "tty.usb", "cu.usb"];

pub fn run() -> Result<()> {
    if let Some(ports) = enumerated() {
        print_ports(&ports);
        return Ok(());
    }

    let dev = Path::new("/dev");
    if !dev.is_dir() {
        println!("No /dev directory on this system; pass COM ports by name.");
        return Ok(());
    }
    let ports: Vec<String> = candidates(dev)?
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    print_ports(&ports);
    Ok(())
}

/// Ports reported by the operating system, when it can be asked.
#[cfg(feature = "serial")]
fn enumerated() -> Option<Vec<String>> {
    match tokio_serial::available_ports() {
        Ok(found) => Some(found.into_iter().map(|p| p.port_name).collect()),
        Err(e) => {
            tracing::warn!(error = %e, "serial port enumeration failed; scanning /dev");
            None
        }
    }
}

#[cfg(not(feature = "serial"))]
fn enumerated() -> Option<Vec<String>> {
    None
}

fn print_ports(ports: &[String]) {
    if ports.is_empty() {
        println!("No serial devices found.");
    } else {
        println!("Serial devices:");
        for port in ports {
            println!("  {port}");
        }
    }
}

/// Entries of `dir` whose names start with a known serial prefix, sorted.
pub fn candidates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut ports = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if PORT_PREFIXES.iter().any(|p| name.starts_with(p)) {
            ports.push(entry.path());
        }
    }
    ports.sort();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_serial_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB1", "ttyACM0", "ttyS0", "null", "cu.usbmodem14101", "ttyUSB0"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let names: Vec<String> = candidates(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cu.usbmodem14101", "ttyACM0", "ttyUSB0", "ttyUSB1"]);
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn without_serial_support_dev_is_scanned() {
        assert!(enumerated().is_none());
    }

    #[cfg(feature = "serial")]
    #[test]
    fn serial_enumeration_lists_port_names() {
        if let Some(ports) = enumerated() {
            assert!(ports.iter().all(|p| !p.is_empty()));
        }
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(candidates(&dir.path().join("nope")).is_err());
    }
}
