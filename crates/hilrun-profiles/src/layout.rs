//! Memory layout model.
//!
//! Profiles that do not ship a hand-written linker script declare their
//! memory map instead, and the compiler stage renders a GNU ld script from it.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// A named region of the target's memory map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryRegion {
    /// Region name (e.g., "FLASH", "RAM").
    pub name: String,
    /// Base address.
    pub origin: u64,
    /// Size in bytes.
    pub length: u64,
    /// ld attribute string (`r`, `w`, `x` combinations, e.g. "rx", "rwx").
    pub attrs: String,
}

impl MemoryRegion {
    pub fn new(name: &str, origin: u64, length: u64, attrs: &str) -> Self {
        Self {
            name: name.into(),
            origin,
            length,
            attrs: attrs.into(),
        }
    }

    /// Exclusive end address (saturating).
    pub fn end(&self) -> u64 {
        self.origin.saturating_add(self.length)
    }

    pub fn executable(&self) -> bool {
        self.attrs.contains('x')
    }

    pub fn writable(&self) -> bool {
        self.attrs.contains('w')
    }

    /// Whether two regions share any address.
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.origin < other.end() && other.origin < self.end()
    }
}

/// Pick the region that hosts code: the first executable, non-writable one,
/// falling back to the first executable one.
pub fn code_region(regions: &[MemoryRegion]) -> Option<&MemoryRegion> {
    regions
        .iter()
        .find(|r| r.executable() && !r.writable())
        .or_else(|| regions.iter().find(|r| r.executable()))
}

/// Pick the region that hosts data, bss and the stack: the first writable one
/// that is not the code region.
pub fn data_region(regions: &[MemoryRegion]) -> Option<&MemoryRegion> {
    let code = code_region(regions).map(|r| r.name.as_str());
    regions
        .iter()
        .find(|r| r.writable() && Some(r.name.as_str()) != code)
}

/// Render a GNU ld linker script for a bare-metal image.
///
/// Returns `None` if the layout has no code region or no data region.
pub fn render_linker_script(regions: &[MemoryRegion], stack_bytes: u64) -> Option<String> {
    let code = code_region(regions)?;
    let data = data_region(regions)?;

    let mut out = String::new();
    out.push_str("/* generated by hilrun */\n");
    out.push_str("MEMORY\n{\n");
    for r in regions {
        let _ = writeln!(
            out,
            "    {} ({}) : ORIGIN = 0x{:08X}, LENGTH = {}",
            r.name,
            r.attrs,
            r.origin,
            format_length(r.length)
        );
    }
    out.push_str("}\n\n");

    let (c, d) = (&code.name, &data.name);
    let _ = write!(
        out,
        "SECTIONS
{{
    .isr_vector : {{
        . = ALIGN(4);
        KEEP(*(.isr_vector))
        . = ALIGN(4);
    }} > {c}

    .text : {{
        . = ALIGN(4);
        *(.text*)
        *(.rodata*)
        . = ALIGN(4);
    }} > {c}

    .data : {{
        . = ALIGN(4);
        _sdata = .;
        *(.data*)
        . = ALIGN(4);
        _edata = .;
    }} > {d} AT > {c}

    .bss : {{
        . = ALIGN(4);
        _sbss = .;
        *(.bss*)
        *(COMMON)
        . = ALIGN(4);
        _ebss = .;
    }} > {d}

    .stack : {{
        . = ALIGN(8);
        . = . + 0x{stack_bytes:X};
        . = ALIGN(8);
        _estack = .;
    }} > {d}
}}
"
    );
    Some(out)
}

fn format_length(len: u64) -> String {
    const KIB: u64 = 1024;
    if len >= KIB * KIB && len % (KIB * KIB) == 0 {
        format!("{}M", len / (KIB * KIB))
    } else if len >= KIB && len % KIB == 0 {
        format!("{}K", len / KIB)
    } else {
        len.to_string()
    }
}

/// STM32F1 value-line layout (128 KiB flash, 20 KiB RAM).
pub fn stm32f1_layout() -> Vec<MemoryRegion> {
    vec![
        MemoryRegion::new("FLASH", 0x0800_0000, 128 * 1024, "rx"),
        MemoryRegion::new("RAM", 0x2000_0000, 20 * 1024, "rwx"),
    ]
}
