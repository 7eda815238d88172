// Architecture table
//
// pc/sp register aliases and capstone (arch, mode) per supported architecture

use std::fmt;
use std::str::FromStr;

use crate::error::{AdaptorError, AdaptorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Armv6,
    Armv7,
    Armv7s,
    Arm64,
    Arm64e,
    PowerPc,
}

/// Which capstone decoder to build for an architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    X86_32,
    X86_64,
    Arm,
    Arm64,
    Ppc32,
}

impl Arch {
    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Armv6 => "armv6",
            Arch::Armv7 => "armv7",
            Arch::Armv7s => "armv7s",
            Arch::Arm64 => "arm64",
            Arch::Arm64e => "arm64e",
            Arch::PowerPc => "powerpc",
        }
    }

    /// Architecture-specific name of the program counter
    pub fn pc_name(&self) -> &'static str {
        match self {
            Arch::X86 => "eip",
            Arch::X86_64 => "rip",
            _ => "pc",
        }
    }

    /// Architecture-specific name of the stack pointer
    pub fn sp_name(&self) -> &'static str {
        match self {
            Arch::X86 => "esp",
            Arch::X86_64 => "rsp",
            Arch::PowerPc => "r1",
            _ => "sp",
        }
    }

    pub fn decoder(&self) -> DecoderKind {
        match self {
            Arch::X86 => DecoderKind::X86_32,
            Arch::X86_64 => DecoderKind::X86_64,
            Arch::Arm | Arch::Armv6 | Arch::Armv7 | Arch::Armv7s => DecoderKind::Arm,
            Arch::Arm64 | Arch::Arm64e => DecoderKind::Arm64,
            Arch::PowerPc => DecoderKind::Ppc32,
        }
    }

    /// Rewrite the "pc" and "sp" aliases in a register name list to this
    /// architecture's register names. Other names pass through untouched.
    pub fn normalize_registers(&self, names: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            let real = match name.as_str() {
                "pc" => self.pc_name(),
                "sp" => self.sp_name(),
                other => other,
            };
            if !out.iter().any(|n| n == real) {
                out.push(real.to_string());
            }
        }
        out
    }
}

impl FromStr for Arch {
    type Err = AdaptorError;

    fn from_str(s: &str) -> AdaptorResult<Self> {
        // Hosts report a few aliases for the same ISA
        match s {
            "x86" | "i386" | "i686" => Ok(Arch::X86),
            "x86_64" | "x86_64h" | "amd64" => Ok(Arch::X86_64),
            "arm" => Ok(Arch::Arm),
            "armv6" => Ok(Arch::Armv6),
            "armv7" => Ok(Arch::Armv7),
            "armv7s" => Ok(Arch::Armv7s),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "arm64e" => Ok(Arch::Arm64e),
            "powerpc" | "ppc" => Ok(Arch::PowerPc),
            other => Err(AdaptorError::UnknownArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
