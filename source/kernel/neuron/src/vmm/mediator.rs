// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CSR access mediation.
//!
//! Every guest access to a virtual CSR goes through [`read`] or [`write`],
//! which enforce the register's minimum mode. The Zicsr read-modify-write
//! forms are composed from the two after a single up-front check, so a
//! rejected instruction leaves both the CSR and the guest registers untouched.

use crate::trap::TrapFrame;

use super::{
    context::VmContext,
    csr::{self, VirtualRegister},
    decode::{CsrOp, Operand},
    error::Violation,
};

fn check(ctx: &VmContext, code: u16) -> Result<VirtualRegister, Violation> {
    let reg = *ctx.registers.get(code).ok_or(Violation::UnknownRegister { csr: code })?;
    if !reg.accessible_from(ctx.mode) {
        return Err(Violation::InsufficientPrivilege {
            csr: code,
            required: reg.min_mode,
            current: ctx.mode,
        });
    }
    Ok(reg)
}

/// Reads `code` on behalf of the guest.
pub fn read(ctx: &VmContext, code: u16) -> Result<u64, Violation> {
    check(ctx, code).map(|reg| reg.value)
}

/// Writes `code` on behalf of the guest; PMP registers arm the restricted table.
pub fn write(ctx: &mut VmContext, code: u16, value: u64) -> Result<(), Violation> {
    check(ctx, code)?;
    if let Some(reg) = ctx.registers.lookup(code) {
        reg.value = value;
    }
    if csr::is_pmp(code) {
        ctx.pmp_configured = true;
    }
    Ok(())
}

/// `csrw code, x[rs1]`.
pub fn write_from(ctx: &mut VmContext, frame: &TrapFrame, code: u16, rs1: u8) -> Result<(), Violation> {
    write(ctx, code, frame.reg(rs1.into()) as u64)
}

/// `csrr x[rd], code`.
pub fn read_into(ctx: &VmContext, frame: &mut TrapFrame, code: u16, rd: u8) -> Result<(), Violation> {
    let value = read(ctx, code)?;
    frame.set_x(rd.into(), value as usize);
    Ok(())
}

/// Executes a full Zicsr instruction.
///
/// CSRRW always writes and reads only for `rd != x0`; CSRRS/CSRRC always read
/// and write only for a non-zero source.
pub fn execute(
    ctx: &mut VmContext,
    frame: &mut TrapFrame,
    op: CsrOp,
    code: u16,
    rd: u8,
    src: Operand,
) -> Result<(), Violation> {
    let old = check(ctx, code)?.value;
    let (operand, source_is_zero) = match src {
        Operand::Register(index) => (frame.reg(index.into()) as u64, index == 0),
        Operand::Immediate(imm) => (u64::from(imm), imm == 0),
    };
    let new = match op {
        CsrOp::Swap => Some(operand),
        CsrOp::Set if !source_is_zero => Some(old | operand),
        CsrOp::Clear if !source_is_zero => Some(old & !operand),
        CsrOp::Set | CsrOp::Clear => None,
    };
    if let Some(value) = new {
        write(ctx, code, value)?;
    }
    if op != CsrOp::Swap || rd != 0 {
        frame.set_x(rd.into(), old as usize);
    }
    Ok(())
}
