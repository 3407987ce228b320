//! Build artifacts and firmware image inspection.

use std::io;
use std::path::{Path, PathBuf};

use hilrun_profiles::ArtifactFormat;
use object::elf::{self, FileHeader32, FileHeader64};
use object::read::elf::{ElfFile, FileHeader};
use object::{Endianness, FileKind, Object};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A firmware image produced by the compiler stage.
///
/// Created by compile, then handed by value to deploy, which owns it for the
/// rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the image.
    pub sha256: String,
    /// Architecture read from the ELF header, else the profile's declared arch.
    pub arch: String,
    /// ELF entry point, when the image is an ELF.
    pub entry_point: Option<u64>,
    /// Whether an interrupt vector table section is present (ELF only).
    pub has_vector_table: Option<bool>,
}

impl BuildArtifact {
    /// Read and fingerprint the image at `path`.
    pub async fn inspect(
        path: &Path,
        format: ArtifactFormat,
        declared_arch: &str,
    ) -> io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(path, &bytes, format, declared_arch))
    }

    /// Fingerprint an image already in memory.
    pub fn from_bytes(
        path: &Path,
        bytes: &[u8],
        format: ArtifactFormat,
        declared_arch: &str,
    ) -> Self {
        let sha256 = hex(&Sha256::digest(bytes));
        let elf = match format {
            ArtifactFormat::Elf => ElfInfo::parse(bytes),
            _ => None,
        };
        if format == ArtifactFormat::Elf {
            match &elf {
                None => tracing::warn!(
                    path = %path.display(),
                    "artifact declared as ELF has no valid ELF header"
                ),
                Some(info) if info.has_vector_table.is_none() => tracing::warn!(
                    path = %path.display(),
                    "ELF section table is unreadable"
                ),
                Some(_) => {}
            }
        }

        let arch = elf
            .as_ref()
            .and_then(|e| machine_name(e.machine))
            .unwrap_or(declared_arch)
            .to_string();
        Self {
            path: path.to_path_buf(),
            format,
            size_bytes: bytes.len() as u64,
            sha256,
            arch,
            entry_point: elf.as_ref().map(|e| e.entry),
            has_vector_table: elf.as_ref().and_then(|e| e.has_vector_table),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Architecture name for an ELF `e_machine` value.
pub fn machine_name(machine: u16) -> Option<&'static str> {
    Some(match machine {
        elf::EM_386 => "x86",
        elf::EM_MIPS => "mips",
        elf::EM_ARM => "arm",
        elf::EM_X86_64 => "x86_64",
        elf::EM_AVR => "avr",
        elf::EM_XTENSA => "xtensa",
        elf::EM_MSP430 => "msp430",
        elf::EM_AARCH64 => "aarch64",
        elf::EM_RISCV => "riscv",
        _ => return None,
    })
}

const VECTOR_SECTIONS: &[&str] = &[".isr_vector", ".vectors", ".vector_table"];

/// The few ELF fields the pipeline reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfInfo {
    pub machine: u16,
    pub entry: u64,
    /// `None` when the header is valid but the section table is not.
    pub has_vector_table: Option<bool>,
}

impl ElfInfo {
    /// `None` if `data` does not start with a valid ELF header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        match FileKind::parse(data).ok()? {
            FileKind::Elf32 => Self::parse_as::<FileHeader32<Endianness>>(data),
            FileKind::Elf64 => Self::parse_as::<FileHeader64<Endianness>>(data),
            _ => None,
        }
    }

    fn parse_as<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Option<Self> {
        let header = Elf::parse(data).ok()?;
        let endian = header.endian().ok()?;
        let has_vector_table = ElfFile::<Elf>::parse(data).ok().map(|file| {
            VECTOR_SECTIONS
                .iter()
                .any(|name| file.section_by_name(name).is_some())
        });
        Some(Self {
            machine: header.e_machine(endian),
            entry: header.e_entry(endian).into(),
            has_vector_table,
        })
    }
}
