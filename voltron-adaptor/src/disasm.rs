// Capstone fallback disassembler
//
// Used by adaptors whose host has no native disassembler. The decoder is
// picked from the architecture table; output is one instruction per line in
// the form `0x<address>:\t<mnemonic>\t<operands>`.

use capstone::prelude::*;

use crate::arch::{Arch, DecoderKind};
use crate::error::{AdaptorError, AdaptorResult};
use crate::types::ByteOrder;

/// Longest instruction encoding across the supported architectures
pub const MAX_INSN_LEN: u64 = 16;

fn build(target_arch: Arch, byte_order: ByteOrder) -> AdaptorResult<Capstone> {
    let endian = match byte_order {
        ByteOrder::Little => capstone::Endian::Little,
        ByteOrder::Big => capstone::Endian::Big,
    };

    let cs = match target_arch.decoder() {
        DecoderKind::X86_32 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .build(),
        DecoderKind::X86_64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .build(),
        DecoderKind::Arm => Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Arm)
            .endian(endian)
            .build(),
        DecoderKind::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build(),
        DecoderKind::Ppc32 => Capstone::new()
            .ppc()
            .mode(arch::ppc::ArchMode::Mode32)
            .endian(endian)
            .build(),
    };

    cs.map_err(|e| AdaptorError::host(format!("Failed to create Capstone: {}", e)))
}

/// Disassemble at most `count` instructions from `code`, which was read
/// from `address`.
pub fn disassemble(
    target_arch: Arch,
    byte_order: ByteOrder,
    code: &[u8],
    address: u64,
    count: usize,
) -> AdaptorResult<String> {
    let cs = build(target_arch, byte_order)?;

    let insns = cs
        .disasm_count(code, address, count)
        .map_err(|e| AdaptorError::host(format!("Failed to disassemble: {}", e)))?;

    let lines: Vec<String> = insns
        .as_ref()
        .iter()
        .take(count)
        .map(|insn| {
            format!(
                "0x{:x}:\t{}\t{}",
                insn.address(),
                insn.mnemonic().unwrap_or(""),
                insn.op_str().unwrap_or("")
            )
        })
        .collect();

    Ok(lines.join("\n"))
}
