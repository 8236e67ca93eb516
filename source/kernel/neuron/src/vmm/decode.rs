// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fetch and decode of the trapping instruction.

use crate::{mm::PageTable, types::VirtAddr};

use super::error::{Violation, VmmFault};

/// Major opcode of ECALL/xRET and the Zicsr instructions.
pub const OPCODE_SYSTEM: u8 = 0b111_0011;

const IMM_ECALL: u16 = 0x000;
const IMM_SRET: u16 = 0x102;
const IMM_MRET: u16 = 0x302;

/// Raw fields of a 32-bit instruction word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fields {
    pub word: u32,
    /// Bits 6:0.
    pub opcode: u8,
    /// Bits 11:7.
    pub rd: u8,
    /// Bits 14:12.
    pub funct3: u8,
    /// Bits 19:15; a register index or a 5-bit immediate.
    pub rs1: u8,
    /// Bits 31:20; the CSR number for Zicsr forms.
    pub imm: u16,
}

impl Fields {
    pub const fn parse(word: u32) -> Self {
        Self {
            word,
            opcode: (word & 0x7f) as u8,
            rd: ((word >> 7) & 0x1f) as u8,
            funct3: ((word >> 12) & 0x7) as u8,
            rs1: ((word >> 15) & 0x1f) as u8,
            imm: ((word >> 20) & 0xfff) as u16,
        }
    }
}

/// Read-modify-write flavour of a Zicsr instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrOp {
    /// CSRRW / CSRRWI.
    Swap,
    /// CSRRS / CSRRSI.
    Set,
    /// CSRRC / CSRRCI.
    Clear,
}

/// Where the value written by a Zicsr instruction comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(u8),
    Immediate(u8),
}

/// A privileged instruction the emulator models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Ecall,
    Sret,
    Mret,
    Csr { op: CsrOp, csr: u16, rd: u8, src: Operand },
}

impl Instruction {
    /// `csrw csr, rs` is `csrrw x0, csr, rs`.
    pub fn is_plain_write(&self) -> bool {
        matches!(self, Self::Csr { op: CsrOp::Swap, rd: 0, src: Operand::Register(_), .. })
    }

    /// `csrr rd, csr` is `csrrs rd, csr, x0`.
    pub fn is_plain_read(&self) -> bool {
        matches!(self, Self::Csr { op: CsrOp::Set, src: Operand::Register(0), .. })
    }
}

/// Classifies decoded fields; anything outside ECALL/SRET/MRET/Zicsr is unsupported.
pub fn classify(fields: Fields) -> Result<Instruction, Violation> {
    let unsupported = Violation::UnsupportedInstruction { word: fields.word };
    if fields.opcode != OPCODE_SYSTEM {
        return Err(unsupported);
    }
    let (op, src) = match fields.funct3 {
        0 => {
            if fields.rd != 0 || fields.rs1 != 0 {
                return Err(unsupported);
            }
            return match fields.imm {
                IMM_ECALL => Ok(Instruction::Ecall),
                IMM_SRET => Ok(Instruction::Sret),
                IMM_MRET => Ok(Instruction::Mret),
                _ => Err(unsupported),
            };
        }
        1 => (CsrOp::Swap, Operand::Register(fields.rs1)),
        2 => (CsrOp::Set, Operand::Register(fields.rs1)),
        3 => (CsrOp::Clear, Operand::Register(fields.rs1)),
        5 => (CsrOp::Swap, Operand::Immediate(fields.rs1)),
        6 => (CsrOp::Set, Operand::Immediate(fields.rs1)),
        7 => (CsrOp::Clear, Operand::Immediate(fields.rs1)),
        _ => return Err(unsupported),
    };
    Ok(Instruction::Csr { op, csr: fields.imm, rd: fields.rd, src })
}

/// Reads the instruction word at guest address `pc` through `table`.
pub fn fetch(table: &PageTable, pc: usize) -> Result<u32, VmmFault> {
    let va = VirtAddr::instr_aligned(pc).ok_or(VmmFault::MisalignedFetch { pc })?;
    let pa = table.translate(va.raw()).ok_or(VmmFault::InconsistentMapping { va: pc })?;
    // SAFETY: kernel memory is identity mapped and `pa` comes from a valid leaf
    // entry; 4-byte alignment keeps the read inside that page.
    Ok(unsafe { core::ptr::read_volatile(pa as *const u32) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_csrrw() {
        // csrrw x0, pmpcfg0, a1
        let fields = Fields::parse(0x3a05_9073);
        assert_eq!(fields.opcode, OPCODE_SYSTEM);
        assert_eq!(fields.rd, 0);
        assert_eq!(fields.funct3, 1);
        assert_eq!(fields.rs1, 11);
        assert_eq!(fields.imm, 0x3a0);
        let insn = classify(fields).unwrap();
        assert!(insn.is_plain_write());
        assert!(!insn.is_plain_read());
    }

    #[test]
    fn recognises_returns_and_ecall() {
        assert_eq!(classify(Fields::parse(0x0000_0073)), Ok(Instruction::Ecall));
        assert_eq!(classify(Fields::parse(0x1020_0073)), Ok(Instruction::Sret));
        assert_eq!(classify(Fields::parse(0x3020_0073)), Ok(Instruction::Mret));
    }

    #[test]
    fn csrr_is_plain_read() {
        // csrr a0, mvendorid
        let insn = classify(Fields::parse(0xf110_2573)).unwrap();
        assert_eq!(
            insn,
            Instruction::Csr { op: CsrOp::Set, csr: 0xf11, rd: 10, src: Operand::Register(0) }
        );
        assert!(insn.is_plain_read());
    }

    #[test]
    fn immediate_forms() {
        // csrrsi x0, sstatus, 2
        let insn = classify(Fields::parse(0x1001_6073)).unwrap();
        assert_eq!(
            insn,
            Instruction::Csr { op: CsrOp::Set, csr: 0x100, rd: 0, src: Operand::Immediate(2) }
        );
    }

    #[test]
    fn rejects_other_system_encodings() {
        for word in [0x0010_0073u32 /* ebreak */, 0x1050_0073 /* wfi */, 0x1200_0073 /* sfence.vma */] {
            assert_eq!(
                classify(Fields::parse(word)),
                Err(Violation::UnsupportedInstruction { word })
            );
        }
        // funct3 4 and a non-SYSTEM opcode (addi a0, a0, 1)
        assert!(classify(Fields::parse(0x0000_4073)).is_err());
        assert!(classify(Fields::parse(0x0015_0513)).is_err());
    }

    #[test]
    fn fetch_requires_alignment_and_mapping() {
        let table = PageTable::new();
        assert_eq!(fetch(&table, 0x1002), Err(VmmFault::MisalignedFetch { pc: 0x1002 }));
        assert_eq!(fetch(&table, 0x1000), Err(VmmFault::InconsistentMapping { va: 0x1000 }));
    }
}
