use softfloat_wrapper::{F32, F64};

use crate::cpu::core::{
    CpuState, LOAD_RES_NONE, MSTATUS_TSR, MSTATUS_TVM,
};
use crate::cpu::csr::CsrEffect;
use crate::cpu::decode::{self, FmaKind, Op};
use crate::cpu::fpu;
use crate::cpu::types::{Access, CtfInfo, Exception, Priv};

/// Loop directive produced by a committed instruction.
enum LoopCtl {
    Continue,
    /// XLEN changed; the interpretation loop must be re-entered.
    Restart,
}

const SIGN32: u32 = 0x8000_0000;
const SIGN64: u64 = 0x8000_0000_0000_0000;

impl CpuState {
    /// Run up to `n_cycles` loop iterations. Returns the number of
    /// instructions actually committed. The loop exits early on
    /// termination or when WFI puts the hart to sleep.
    pub fn interp(&mut self, n_cycles: u64) -> u64 {
        let start = self.insn_counter;
        let mut budget = n_cycles;
        while budget > 0 && !self.signals.terminated() && !self.signals.power_down() {
            budget -= 1;

            if self.raise_interrupt() {
                continue;
            }

            match self.exec_one() {
                Ok(LoopCtl::Continue) => {}
                Ok(LoopCtl::Restart) => {
                    // Only RV64 interpretation is implemented; a toggled
                    // MXL has no interpreter to restart into.
                    assert!(self.cur_xlen == 64, "unsupported XLEN {}", self.cur_xlen);
                }
                Err(e) => {
                    log::trace!("exception {:?} at pc={:#x}", e, self.pc);
                    self.raise_trap(e.cause(), e.tval());
                }
            }
        }
        self.insn_counter - start
    }

    /// Fetch, decode and execute one instruction. On `Err` no architectural
    /// state has been committed beyond what the faulting access itself
    /// performed, and `self.pc` still addresses the faulting instruction.
    fn exec_one(&mut self) -> Result<LoopCtl, Exception> {
        let pc = self.pc;

        if self.trigger_matches(pc) {
            return Err(Exception::Breakpoint(pc));
        }

        let raw = self.fetch_insn(pc)?;
        let (insn, len) = if raw & 3 == 3 {
            (raw, 4u64)
        } else {
            (decode::expand_compressed(raw as u16)?, 2u64)
        };
        let op = decode::decode(insn)?;

        let mut next_pc = pc.wrapping_add(len);
        self.info = CtfInfo::Nop;
        let mut ctl = LoopCtl::Continue;
        let illegal = || Exception::IllegalInstruction(insn as u64);

        match op {
            Op::Lui { rd, imm } => {
                if rd != 0 {
                    self.write_reg(rd, imm as i64 as u64);
                }
            }
            Op::Auipc { rd, imm } => {
                if rd != 0 {
                    self.write_reg(rd, pc.wrapping_add(imm as i64 as u64));
                }
            }
            Op::Jal { rd, imm } => {
                if rd != 0 {
                    self.write_reg(rd, next_pc);
                }
                next_pc = pc.wrapping_add(imm as i64 as u64);
                self.info = CtfInfo::TakenJump;
                self.next_addr = next_pc;
            }
            Op::Jalr { rd, rs1, imm } => {
                let target = self.read_reg(rs1).wrapping_add(imm as i64 as u64) & !1;
                if rd != 0 {
                    self.write_reg(rd, next_pc);
                }
                next_pc = target;
                self.info = CtfInfo::jalr_hint(rd, rs1);
                self.next_addr = target;
            }
            Op::Branch { rs1, rs2, imm, funct3 } => {
                let a = self.read_reg(rs1);
                let b = self.read_reg(rs2);
                let taken = match funct3 {
                    0 => a == b,
                    1 => a != b,
                    4 => (a as i64) < (b as i64),
                    5 => (a as i64) >= (b as i64),
                    6 => a < b,
                    7 => a >= b,
                    _ => return Err(illegal()),
                };
                if taken {
                    next_pc = pc.wrapping_add(imm as i64 as u64);
                    self.info = CtfInfo::TakenBranch;
                } else {
                    self.info = CtfInfo::UntakenBranch;
                }
                self.next_addr = next_pc;
            }
            Op::Load { rd, rs1, imm, funct3 } => {
                let addr = self.read_reg(rs1).wrapping_add(imm as i64 as u64);
                let val = match funct3 {
                    0 => self.read_u8(addr)? as i8 as i64 as u64,
                    1 => self.read_u16(addr)? as i16 as i64 as u64,
                    2 => self.read_u32(addr)? as i32 as i64 as u64,
                    3 => self.read_u64(addr)?,
                    4 => self.read_u8(addr)? as u64,
                    5 => self.read_u16(addr)? as u64,
                    6 => self.read_u32(addr)? as u64,
                    _ => return Err(illegal()),
                };
                if rd != 0 {
                    self.write_reg(rd, val);
                }
            }
            Op::Store { rs1, rs2, imm, funct3 } => {
                let addr = self.read_reg(rs1).wrapping_add(imm as i64 as u64);
                let val = self.read_reg(rs2);
                match funct3 {
                    0 => self.write_u8(addr, val as u8)?,
                    1 => self.write_u16(addr, val as u16)?,
                    2 => self.write_u32(addr, val as u32)?,
                    3 => self.write_u64(addr, val)?,
                    _ => return Err(illegal()),
                }
                self.clear_reservation_if_conflict(addr);
            }
            Op::OpImm { rd, rs1, imm, funct3, .. } => {
                let a = self.read_reg(rs1);
                let imm64 = imm as i64 as u64;
                let res = match funct3 {
                    0 => a.wrapping_add(imm64),
                    1 => {
                        if (imm >> 6) & 0x3f != 0 {
                            return Err(illegal());
                        }
                        a << (imm & 0x3f)
                    }
                    2 => ((a as i64) < imm as i64) as u64,
                    3 => (a < imm64) as u64,
                    4 => a ^ imm64,
                    5 => match (imm >> 6) & 0x3f {
                        0x00 => a >> (imm & 0x3f),
                        0x10 => ((a as i64) >> (imm & 0x3f)) as u64,
                        _ => return Err(illegal()),
                    },
                    6 => a | imm64,
                    7 => a & imm64,
                    _ => unreachable!(),
                };
                if rd != 0 {
                    self.write_reg(rd, res);
                }
            }
            Op::OpImm32 { rd, rs1, imm, funct3, .. } => {
                let a = self.read_reg(rs1);
                let res = match funct3 {
                    0 => a.wrapping_add(imm as i64 as u64) as i32 as i64 as u64,
                    1 => {
                        if (imm >> 5) & 0x7f != 0 {
                            return Err(illegal());
                        }
                        ((a as u32) << (imm & 0x1f)) as i32 as i64 as u64
                    }
                    5 => match (imm >> 5) & 0x7f {
                        0x00 => ((a as u32) >> (imm & 0x1f)) as i32 as i64 as u64,
                        0x20 => ((a as i32) >> (imm & 0x1f)) as i64 as u64,
                        _ => return Err(illegal()),
                    },
                    _ => return Err(illegal()),
                };
                if rd != 0 {
                    self.write_reg(rd, res);
                }
            }
            Op::OpReg { rd, rs1, rs2, funct3, funct7 } => {
                let a = self.read_reg(rs1);
                let b = self.read_reg(rs2);
                let res = match (funct3, funct7) {
                    (0, 0x00) => a.wrapping_add(b),
                    (0, 0x20) => a.wrapping_sub(b),
                    (1, 0x00) => a << (b & 0x3f),
                    (2, 0x00) => (((a as i64) < (b as i64)) as u64),
                    (3, 0x00) => ((a < b) as u64),
                    (4, 0x00) => a ^ b,
                    (5, 0x00) => a >> (b & 0x3f),
                    (5, 0x20) => ((a as i64) >> (b & 0x3f)) as u64,
                    (6, 0x00) => a | b,
                    (7, 0x00) => a & b,
                    // M extension.
                    (0, 0x01) => {
                        ((a as i64 as i128).wrapping_mul(b as i64 as i128) as i64) as u64
                    }
                    (1, 0x01) => {
                        (((a as i64 as i128).wrapping_mul(b as i64 as i128) >> 64) as i64) as u64
                    }
                    (2, 0x01) => {
                        (((a as i64 as i128).wrapping_mul(b as u128 as i128) >> 64) as i64) as u64
                    }
                    (3, 0x01) => ((a as u128).wrapping_mul(b as u128) >> 64) as u64,
                    (4, 0x01) => {
                        let (a, b) = (a as i64, b as i64);
                        if b == 0 {
                            -1i64 as u64
                        } else if a == i64::MIN && b == -1 {
                            i64::MIN as u64
                        } else {
                            (a / b) as u64
                        }
                    }
                    (5, 0x01) => {
                        if b == 0 {
                            u64::MAX
                        } else {
                            a / b
                        }
                    }
                    (6, 0x01) => {
                        let (a, b) = (a as i64, b as i64);
                        if b == 0 {
                            a as u64
                        } else if a == i64::MIN && b == -1 {
                            0
                        } else {
                            (a % b) as u64
                        }
                    }
                    (7, 0x01) => {
                        if b == 0 {
                            a
                        } else {
                            a % b
                        }
                    }
                    _ => return Err(illegal()),
                };
                if rd != 0 {
                    self.write_reg(rd, res);
                }
            }
            Op::OpReg32 { rd, rs1, rs2, funct3, funct7 } => {
                let a = self.read_reg(rs1);
                let b = self.read_reg(rs2);
                let res = match (funct3, funct7) {
                    (0, 0x00) => a.wrapping_add(b) as i32 as i64 as u64,
                    (0, 0x20) => a.wrapping_sub(b) as i32 as i64 as u64,
                    (1, 0x00) => ((a as u32) << (b & 0x1f)) as i32 as i64 as u64,
                    (5, 0x00) => ((a as u32) >> (b & 0x1f)) as i32 as i64 as u64,
                    (5, 0x20) => ((a as i32) >> (b & 0x1f)) as i64 as u64,
                    (0, 0x01) => {
                        ((a as i32 as i64).wrapping_mul(b as i32 as i64) as i32) as i64 as u64
                    }
                    (4, 0x01) => {
                        let (a, b) = (a as i32, b as i32);
                        let q = if b == 0 {
                            -1i32
                        } else if a == i32::MIN && b == -1 {
                            i32::MIN
                        } else {
                            a / b
                        };
                        q as i64 as u64
                    }
                    (5, 0x01) => {
                        let (a, b) = (a as u32, b as u32);
                        let q = if b == 0 { u32::MAX } else { a / b };
                        q as i32 as i64 as u64
                    }
                    (6, 0x01) => {
                        let (a, b) = (a as i32, b as i32);
                        let r = if b == 0 {
                            a
                        } else if a == i32::MIN && b == -1 {
                            0
                        } else {
                            a % b
                        };
                        r as i64 as u64
                    }
                    (7, 0x01) => {
                        let (a, b) = (a as u32, b as u32);
                        let r = if b == 0 { a } else { a % b };
                        r as i32 as i64 as u64
                    }
                    _ => return Err(illegal()),
                };
                if rd != 0 {
                    self.write_reg(rd, res);
                }
            }
            Op::Amo { rd, rs1, rs2, funct3, funct5 } => {
                self.exec_amo(insn, rd, rs1, rs2, funct3, funct5)?;
            }
            Op::System { rd, rs1, funct3, imm } => match funct3 {
                0 => match imm {
                    0x000 => {
                        return Err(match self.priv_ {
                            Priv::User => Exception::EcallFromU,
                            Priv::Supervisor => Exception::EcallFromS,
                            Priv::Machine => Exception::EcallFromM,
                        });
                    }
                    0x001 => return Err(Exception::Breakpoint(0)),
                    0x102 => {
                        // SRET
                        if self.priv_ < Priv::Supervisor
                            || (self.priv_ == Priv::Supervisor
                                && self.mstatus & MSTATUS_TSR != 0)
                        {
                            return Err(illegal());
                        }
                        self.handle_sret();
                        next_pc = self.pc;
                    }
                    0x302 => {
                        // MRET
                        if self.priv_ != Priv::Machine {
                            return Err(illegal());
                        }
                        self.handle_mret();
                        next_pc = self.pc;
                    }
                    0x7b2 => {
                        // DRET
                        if self.priv_ != Priv::Machine {
                            return Err(illegal());
                        }
                        self.handle_dret();
                        next_pc = self.pc;
                    }
                    0x105 => {
                        // WFI goes to sleep unless an interrupt is already
                        // pending; it retires either way.
                        if self.priv_ == Priv::User {
                            return Err(illegal());
                        }
                        if self.signals.mip() & self.signals.mie() == 0 {
                            self.signals.set_power_down(true);
                        }
                    }
                    _ => {
                        if imm >> 5 == 0x09 {
                            // SFENCE.VMA
                            if self.priv_ == Priv::User
                                || (self.priv_ == Priv::Supervisor
                                    && self.mstatus & MSTATUS_TVM != 0)
                            {
                                return Err(illegal());
                            }
                            if rs1 == 0 {
                                self.tlb_flush_all();
                            } else {
                                let va = self.read_reg(rs1);
                                self.tlb_flush_vaddr(va);
                            }
                        } else {
                            return Err(illegal());
                        }
                    }
                },
                1 | 2 | 3 | 5 | 6 | 7 => {
                    ctl = self.exec_csr(insn, rd, rs1, funct3, imm)?;
                }
                _ => return Err(illegal()),
            },
            Op::MiscMem { funct3 } => match funct3 {
                0 | 1 => {
                    // FENCE / FENCE.I: single hart, nothing to order.
                }
                _ => return Err(illegal()),
            },
            Op::LoadFp { rd, rs1, imm, funct3 } => {
                if self.fs == 0 {
                    return Err(illegal());
                }
                let addr = self.read_reg(rs1).wrapping_add(imm as i64 as u64);
                let val = match funct3 {
                    2 => fpu::nanbox32(self.read_u32(addr)?),
                    3 => self.read_u64(addr)?,
                    _ => return Err(illegal()),
                };
                self.write_fp_reg(rd, val);
            }
            Op::StoreFp { rs1, rs2, imm, funct3 } => {
                if self.fs == 0 {
                    return Err(illegal());
                }
                let addr = self.read_reg(rs1).wrapping_add(imm as i64 as u64);
                let val = self.read_fp_reg(rs2);
                match funct3 {
                    2 => self.write_u32(addr, val as u32)?,
                    3 => self.write_u64(addr, val)?,
                    _ => return Err(illegal()),
                }
                self.clear_reservation_if_conflict(addr);
            }
            Op::OpFp { rd, rs1, rs2, rm, funct7 } => {
                self.exec_op_fp(insn, rd, rs1, rs2, rm, funct7)?;
            }
            Op::Fma { rd, rs1, rs2, rs3, rm, fmt, kind } => {
                if self.fs == 0 {
                    return Err(illegal());
                }
                let rm = self.get_insn_rm(rm as u32).ok_or_else(illegal)?;
                let rnd = fpu::rounding_mode(rm);
                match fmt {
                    0 => {
                        let a = fpu::unbox32(self.read_fp_reg(rs1));
                        let b = fpu::unbox32(self.read_fp_reg(rs2));
                        let c = fpu::unbox32(self.read_fp_reg(rs3));
                        let (a, c) = match kind {
                            FmaKind::Madd => (a, c),
                            FmaKind::Msub => (a, c ^ SIGN32),
                            FmaKind::Nmsub => (a ^ SIGN32, c),
                            FmaKind::Nmadd => (a ^ SIGN32, c ^ SIGN32),
                        };
                        let (r, fl) = fpu::fma::<F32>(a, b, c, rnd);
                        self.accrue_fflags(fl);
                        self.write_fp_reg(rd, fpu::nanbox32(r));
                    }
                    1 => {
                        let a = self.read_fp_reg(rs1);
                        let b = self.read_fp_reg(rs2);
                        let c = self.read_fp_reg(rs3);
                        let (a, c) = match kind {
                            FmaKind::Madd => (a, c),
                            FmaKind::Msub => (a, c ^ SIGN64),
                            FmaKind::Nmsub => (a ^ SIGN64, c),
                            FmaKind::Nmadd => (a ^ SIGN64, c ^ SIGN64),
                        };
                        let (r, fl) = fpu::fma::<F64>(a, b, c, rnd);
                        self.accrue_fflags(fl);
                        self.write_fp_reg(rd, r);
                    }
                    _ => return Err(illegal()),
                }
            }
        }

        self.pc = next_pc;
        self.insn_counter += 1;
        if !self.stop_the_counter {
            self.minstret += 1;
            self.mcycle += 1;
            self.signals.publish_cycles(self.mcycle);
        }
        Ok(ctl)
    }

    fn exec_amo(
        &mut self,
        insn: u32,
        rd: u8,
        rs1: u8,
        rs2: u8,
        funct3: u8,
        funct5: u8,
    ) -> Result<(), Exception> {
        let addr = self.read_reg(rs1);
        let wide = match funct3 {
            2 => false,
            3 => true,
            _ => return Err(Exception::IllegalInstruction(insn as u64)),
        };
        let size = if wide { 8 } else { 4 };

        match funct5 {
            0b00010 => {
                // LR
                if addr & (size - 1) != 0 {
                    return Err(Exception::MisalignedLoad(addr));
                }
                let paddr = self.translate_addr(addr, Access::Read)?;
                let val = if wide {
                    self.read_u64(addr)?
                } else {
                    self.read_u32(addr)? as i32 as i64 as u64
                };
                if rd != 0 {
                    self.write_reg(rd, val);
                }
                self.load_res = paddr;
            }
            0b00011 => {
                // SC: succeeds only against the exact reserved paddr, and
                // any SC consumes the reservation.
                if addr & (size - 1) != 0 {
                    return Err(Exception::MisalignedStore(addr));
                }
                let paddr = self.translate_addr(addr, Access::Write)?;
                let ok = self.load_res != LOAD_RES_NONE && self.load_res == paddr;
                if ok {
                    let val = self.read_reg(rs2);
                    if wide {
                        self.write_u64(addr, val)?;
                    } else {
                        self.write_u32(addr, val as u32)?;
                    }
                }
                self.load_res = LOAD_RES_NONE;
                if rd != 0 {
                    self.write_reg(rd, (!ok) as u64);
                }
            }
            _ => {
                // AMOs follow the store fault policy for both halves.
                if addr & (size - 1) != 0 {
                    return Err(Exception::MisalignedStore(addr));
                }
                self.translate_addr(addr, Access::Write)?;
                let old = if wide {
                    self.read_u64(addr)?
                } else {
                    self.read_u32(addr)? as i32 as i64 as u64
                };
                let b = self.read_reg(rs2);
                let new = if wide {
                    match funct5 {
                        0b00001 => b,
                        0b00000 => old.wrapping_add(b),
                        0b00100 => old ^ b,
                        0b01100 => old & b,
                        0b01000 => old | b,
                        0b10000 => (old as i64).min(b as i64) as u64,
                        0b10100 => (old as i64).max(b as i64) as u64,
                        0b11000 => old.min(b),
                        0b11100 => old.max(b),
                        _ => return Err(Exception::IllegalInstruction(insn as u64)),
                    }
                } else {
                    let old32 = old as u32;
                    let b32 = b as u32;
                    (match funct5 {
                        0b00001 => b32,
                        0b00000 => old32.wrapping_add(b32),
                        0b00100 => old32 ^ b32,
                        0b01100 => old32 & b32,
                        0b01000 => old32 | b32,
                        0b10000 => (old32 as i32).min(b32 as i32) as u32,
                        0b10100 => (old32 as i32).max(b32 as i32) as u32,
                        0b11000 => old32.min(b32),
                        0b11100 => old32.max(b32),
                        _ => return Err(Exception::IllegalInstruction(insn as u64)),
                    }) as u64
                };
                if wide {
                    self.write_u64(addr, new)?;
                } else {
                    self.write_u32(addr, new as u32)?;
                }
                self.clear_reservation_if_conflict(addr);
                if rd != 0 {
                    self.write_reg(rd, old);
                }
            }
        }
        Ok(())
    }

    fn exec_csr(
        &mut self,
        insn: u32,
        rd: u8,
        rs1: u8,
        funct3: u8,
        imm: u32,
    ) -> Result<LoopCtl, Exception> {
        let csr = imm & 0xfff;
        let illegal = || Exception::IllegalInstruction(insn as u64);

        // Immediate forms carry the operand in the rs1 field.
        let src = if funct3 >= 5 {
            rs1 as u64
        } else {
            self.read_reg(rs1)
        };

        let (will_write, compute): (bool, fn(u64, u64) -> u64) = match funct3 & 3 {
            1 => (true, |_, src| src),
            2 => (rs1 != 0, |old, src| old | src),
            _ => (rs1 != 0, |old, src| old & !src),
        };

        let old = self.csr_read(csr, will_write).ok_or_else(illegal)?;

        let mut ctl = LoopCtl::Continue;
        if will_write {
            match self.csr_write(csr, compute(old, src)).ok_or_else(illegal)? {
                CsrEffect::None => {}
                CsrEffect::RestartLoop => ctl = LoopCtl::Restart,
                CsrEffect::TlbFlushed => {
                    // Nothing cached across instructions; the flush itself
                    // is enough.
                }
            }
        }
        if rd != 0 {
            self.write_reg(rd, old);
        }
        Ok(ctl)
    }

    fn exec_op_fp(
        &mut self,
        insn: u32,
        rd: u8,
        rs1: u8,
        rs2: u8,
        rm: u8,
        funct7: u8,
    ) -> Result<(), Exception> {
        if self.fs == 0 {
            return Err(Exception::IllegalInstruction(insn as u64));
        }
        let illegal = || Exception::IllegalInstruction(insn as u64);

        macro_rules! dyn_rm {
            () => {
                fpu::rounding_mode(self.get_insn_rm(rm as u32).ok_or_else(illegal)?)
            };
        }

        match funct7 {
            // ── Single precision ───────────────────────────────────────
            0x00 | 0x04 | 0x08 | 0x0c => {
                let rnd = dyn_rm!();
                let a = fpu::unbox32(self.read_fp_reg(rs1));
                let b = fpu::unbox32(self.read_fp_reg(rs2));
                let (r, fl) = match funct7 {
                    0x00 => fpu::fadd::<F32>(a, b, rnd),
                    0x04 => fpu::fsub::<F32>(a, b, rnd),
                    0x08 => fpu::fmul::<F32>(a, b, rnd),
                    _ => fpu::fdiv::<F32>(a, b, rnd),
                };
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, fpu::nanbox32(r));
            }
            0x2c => {
                if rs2 != 0 {
                    return Err(illegal());
                }
                let rnd = dyn_rm!();
                let a = fpu::unbox32(self.read_fp_reg(rs1));
                let (r, fl) = fpu::fsqrt::<F32>(a, rnd);
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, fpu::nanbox32(r));
            }
            0x10 => {
                let a = fpu::unbox32(self.read_fp_reg(rs1));
                let b = fpu::unbox32(self.read_fp_reg(rs2));
                let r = match rm {
                    0 => (a & !SIGN32) | (b & SIGN32),
                    1 => (a & !SIGN32) | (!b & SIGN32),
                    2 => a ^ (b & SIGN32),
                    _ => return Err(illegal()),
                };
                self.write_fp_reg(rd, fpu::nanbox32(r));
            }
            0x14 => {
                let a = fpu::unbox32(self.read_fp_reg(rs1));
                let b = fpu::unbox32(self.read_fp_reg(rs2));
                let (r, fl) = match rm {
                    0 => fpu::fmin_s(a, b),
                    1 => fpu::fmax_s(a, b),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, fpu::nanbox32(r));
            }
            0x50 => {
                let a = fpu::unbox32(self.read_fp_reg(rs1));
                let b = fpu::unbox32(self.read_fp_reg(rs2));
                let (r, fl) = match rm {
                    2 => fpu::feq::<F32>(a, b),
                    1 => fpu::flt::<F32>(a, b),
                    0 => fpu::fle::<F32>(a, b),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                if rd != 0 {
                    self.write_reg(rd, r as u64);
                }
            }
            0x60 => {
                let rnd = dyn_rm!();
                let a = fpu::unbox32(self.read_fp_reg(rs1));
                let (r, fl) = match rs2 {
                    0 => fpu::fcvt_w::<F32>(a, rnd),
                    1 => fpu::fcvt_wu::<F32>(a, rnd),
                    2 => fpu::fcvt_l::<F32>(a, rnd),
                    3 => fpu::fcvt_lu::<F32>(a, rnd),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                if rd != 0 {
                    self.write_reg(rd, r);
                }
            }
            0x68 => {
                let rnd = dyn_rm!();
                let v = self.read_reg(rs1);
                let (r, fl) = match rs2 {
                    0 => fpu::fcvt_from_w::<F32>(v as i32, rnd),
                    1 => fpu::fcvt_from_wu::<F32>(v as u32, rnd),
                    2 => fpu::fcvt_from_l::<F32>(v as i64, rnd),
                    3 => fpu::fcvt_from_lu::<F32>(v, rnd),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, fpu::nanbox32(r));
            }
            0x70 => {
                if rs2 != 0 {
                    return Err(illegal());
                }
                match rm {
                    0 => {
                        // FMV.X.W moves the raw low bits, unboxed or not.
                        let r = self.read_fp_reg(rs1) as u32 as i32 as i64 as u64;
                        if rd != 0 {
                            self.write_reg(rd, r);
                        }
                    }
                    1 => {
                        let r = fpu::fclass_s(fpu::unbox32(self.read_fp_reg(rs1)));
                        if rd != 0 {
                            self.write_reg(rd, r);
                        }
                    }
                    _ => return Err(illegal()),
                }
            }
            0x78 => {
                if rs2 != 0 || rm != 0 {
                    return Err(illegal());
                }
                let v = self.read_reg(rs1) as u32;
                self.write_fp_reg(rd, fpu::nanbox32(v));
            }

            // ── Double precision ───────────────────────────────────────
            0x01 | 0x05 | 0x09 | 0x0d => {
                let rnd = dyn_rm!();
                let a = self.read_fp_reg(rs1);
                let b = self.read_fp_reg(rs2);
                let (r, fl) = match funct7 {
                    0x01 => fpu::fadd::<F64>(a, b, rnd),
                    0x05 => fpu::fsub::<F64>(a, b, rnd),
                    0x09 => fpu::fmul::<F64>(a, b, rnd),
                    _ => fpu::fdiv::<F64>(a, b, rnd),
                };
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, r);
            }
            0x2d => {
                if rs2 != 0 {
                    return Err(illegal());
                }
                let rnd = dyn_rm!();
                let (r, fl) = fpu::fsqrt::<F64>(self.read_fp_reg(rs1), rnd);
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, r);
            }
            0x11 => {
                let a = self.read_fp_reg(rs1);
                let b = self.read_fp_reg(rs2);
                let r = match rm {
                    0 => (a & !SIGN64) | (b & SIGN64),
                    1 => (a & !SIGN64) | (!b & SIGN64),
                    2 => a ^ (b & SIGN64),
                    _ => return Err(illegal()),
                };
                self.write_fp_reg(rd, r);
            }
            0x15 => {
                let a = self.read_fp_reg(rs1);
                let b = self.read_fp_reg(rs2);
                let (r, fl) = match rm {
                    0 => fpu::fmin_d(a, b),
                    1 => fpu::fmax_d(a, b),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, r);
            }
            0x51 => {
                let a = self.read_fp_reg(rs1);
                let b = self.read_fp_reg(rs2);
                let (r, fl) = match rm {
                    2 => fpu::feq::<F64>(a, b),
                    1 => fpu::flt::<F64>(a, b),
                    0 => fpu::fle::<F64>(a, b),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                if rd != 0 {
                    self.write_reg(rd, r as u64);
                }
            }
            0x61 => {
                let rnd = dyn_rm!();
                let a = self.read_fp_reg(rs1);
                let (r, fl) = match rs2 {
                    0 => fpu::fcvt_w::<F64>(a, rnd),
                    1 => fpu::fcvt_wu::<F64>(a, rnd),
                    2 => fpu::fcvt_l::<F64>(a, rnd),
                    3 => fpu::fcvt_lu::<F64>(a, rnd),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                if rd != 0 {
                    self.write_reg(rd, r);
                }
            }
            0x69 => {
                let rnd = dyn_rm!();
                let v = self.read_reg(rs1);
                let (r, fl) = match rs2 {
                    0 => fpu::fcvt_from_w::<F64>(v as i32, rnd),
                    1 => fpu::fcvt_from_wu::<F64>(v as u32, rnd),
                    2 => fpu::fcvt_from_l::<F64>(v as i64, rnd),
                    3 => fpu::fcvt_from_lu::<F64>(v, rnd),
                    _ => return Err(illegal()),
                };
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, r);
            }
            0x20 => {
                // FCVT.S.D
                if rs2 != 1 {
                    return Err(illegal());
                }
                let rnd = dyn_rm!();
                let (r, fl) = fpu::fcvt_s_d(self.read_fp_reg(rs1), rnd);
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, fpu::nanbox32(r));
            }
            0x21 => {
                // FCVT.D.S
                if rs2 != 0 {
                    return Err(illegal());
                }
                let rnd = dyn_rm!();
                let (r, fl) = fpu::fcvt_d_s(fpu::unbox32(self.read_fp_reg(rs1)), rnd);
                self.accrue_fflags(fl);
                self.write_fp_reg(rd, r);
            }
            0x71 => {
                if rs2 != 0 {
                    return Err(illegal());
                }
                match rm {
                    0 => {
                        let r = self.read_fp_reg(rs1);
                        if rd != 0 {
                            self.write_reg(rd, r);
                        }
                    }
                    1 => {
                        let r = fpu::fclass_d(self.read_fp_reg(rs1));
                        if rd != 0 {
                            self.write_reg(rd, r);
                        }
                    }
                    _ => return Err(illegal()),
                }
            }
            0x79 => {
                if rs2 != 0 || rm != 0 {
                    return Err(illegal());
                }
                let v = self.read_reg(rs1);
                self.write_fp_reg(rd, v);
            }
            _ => return Err(illegal()),
        }
        Ok(())
    }

    pub(crate) fn accrue_fflags(&mut self, fl: u32) {
        if fl != 0 {
            self.fflags |= fl;
            self.fs = 3;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::core::MSTATUS_MIE;
    use crate::cpu::types::{MIP_MSIP, MIP_MTIP};
    use crate::machine::{Machine, MachineConfig, RAM_BASE_ADDR};

    fn machine() -> Machine {
        Machine::new(MachineConfig::for_tests()).unwrap()
    }

    fn load_program(m: &Machine, insns: &[u32]) {
        for (i, insn) in insns.iter().enumerate() {
            m.cpu.mem_map().phys_write_u32(RAM_BASE_ADDR + 4 * i as u64, *insn);
        }
    }

    #[test]
    fn bare_arithmetic_and_ecall() {
        let mut m = machine();
        load_program(
            &m,
            &[
                0x0070_0093, // addi x1, x0, 7
                0xffd0_8113, // addi x2, x1, -3
                0x0000_0073, // ecall
            ],
        );
        let s = &mut m.cpu;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.pc = RAM_BASE_ADDR;

        assert_eq!(s.interp(2), 2);
        assert_eq!(s.read_reg(1), 7);
        assert_eq!(s.read_reg(2), 4);

        s.interp(1);
        assert_eq!(s.mcause, 11);
        assert_eq!(s.mepc, RAM_BASE_ADDR + 8);
        assert_eq!(s.mtval, 0);
        assert_eq!(s.pc, RAM_BASE_ADDR + 0x1000);
        // The ecall did not retire.
        assert_eq!(s.minstret(), 2);
    }

    #[test]
    fn misaligned_load_traps() {
        let mut m = machine();
        load_program(&m, &[0x0001_3083]); // ld x1, 0(x2)
        let s = &mut m.cpu;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.pc = RAM_BASE_ADDR;
        s.set_reg(2, RAM_BASE_ADDR + 1);

        s.interp(1);
        assert_eq!(s.mcause, 4);
        assert_eq!(s.mtval, RAM_BASE_ADDR + 1);
        assert_eq!(s.mepc, RAM_BASE_ADDR);
    }

    #[test]
    fn lr_sc_pair_succeeds() {
        let mut m = machine();
        load_program(
            &m,
            &[
                0x1001_22af, // lr.w x5, (x2)
                0x1841_21af, // sc.w x3, x4, (x2)
            ],
        );
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.set_reg(2, RAM_BASE_ADDR + 0x100);
        s.set_reg(4, 42);

        assert_eq!(s.interp(2), 2);
        assert_eq!(s.read_reg(3), 0);
        assert_eq!(s.mem_map().phys_read_u32(RAM_BASE_ADDR + 0x100), 42);
    }

    #[test]
    fn sc_fails_after_trap() {
        let mut m = machine();
        load_program(&m, &[0x1001_22af]); // lr.w x5, (x2)
        m.cpu.mem_map().phys_write_u32(RAM_BASE_ADDR + 4, 0x1841_21af); // sc.w
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.set_reg(2, RAM_BASE_ADDR + 0x100);
        s.set_reg(4, 42);

        s.interp(1); // lr
        // Any trap invalidates the reservation.
        s.raise_trap(2, 0);
        s.pc = RAM_BASE_ADDR + 4;
        s.set_priv(Priv::Machine);
        s.interp(1); // sc
        assert_eq!(s.read_reg(3), 1);
        assert_eq!(s.mem_map().phys_read_u32(RAM_BASE_ADDR + 0x100), 0);
    }

    #[test]
    fn sc_fails_after_store_to_reserved_line() {
        let mut m = machine();
        load_program(
            &m,
            &[
                0x1001_22af, // lr.w x5, (x2)
                0x0061_2023, // sw x6, 0(x2)
                0x1841_21af, // sc.w x3, x4, (x2)
            ],
        );
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.set_reg(2, RAM_BASE_ADDR + 0x100);
        s.set_reg(4, 42);
        s.set_reg(6, 9);

        assert_eq!(s.interp(3), 3);
        assert_eq!(s.read_reg(3), 1);
        assert_eq!(s.mem_map().phys_read_u32(RAM_BASE_ADDR + 0x100), 9);
    }

    #[test]
    fn amoadd_word() {
        let mut m = machine();
        // amoadd.w x5, x4, (x2): funct5=0, f3=2
        load_program(&m, &[(4 << 20) | (2 << 15) | (2 << 12) | (5 << 7) | 0x2f]);
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.set_reg(2, RAM_BASE_ADDR + 0x100);
        s.set_reg(4, 5);
        s.mem_map().phys_write_u32(RAM_BASE_ADDR + 0x100, 37);
        s.interp(1);
        assert_eq!(s.read_reg(5), 37);
        assert_eq!(s.mem_map().phys_read_u32(RAM_BASE_ADDR + 0x100), 42);
    }

    #[test]
    fn compressed_addi_executes() {
        let mut m = machine();
        // c.addi x10, -1 twice
        m.cpu.mem_map().phys_write_u32(RAM_BASE_ADDR, 0x157d_157d);
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.set_reg(10, 10);
        assert_eq!(s.interp(2), 2);
        assert_eq!(s.read_reg(10), 8);
        assert_eq!(s.pc, RAM_BASE_ADDR + 4);
    }

    #[test]
    fn branch_ctf_taxonomy() {
        let mut m = machine();
        load_program(
            &m,
            &[
                0x0000_0463, // beq x0, x0, +8
            ],
        );
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.interp(1);
        let (info, target) = s.ctf_info();
        assert_eq!(info, CtfInfo::TakenBranch);
        assert_eq!(target, RAM_BASE_ADDR + 8);
        assert_eq!(s.pc, RAM_BASE_ADDR + 8);
    }

    #[test]
    fn jalr_ctf_hint_push() {
        let mut m = machine();
        // jalr x1, 0(x3)
        load_program(&m, &[(3 << 15) | (1 << 7) | 0x67]);
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.set_reg(3, RAM_BASE_ADDR + 0x40);
        s.interp(1);
        let (info, target) = s.ctf_info();
        assert_eq!(info, CtfInfo::TakenJalrPush);
        assert_eq!(target, RAM_BASE_ADDR + 0x40);
        assert_eq!(s.read_reg(1), RAM_BASE_ADDR + 4);
    }

    #[test]
    fn wfi_powers_down_until_interrupt() {
        let mut m = machine();
        load_program(&m, &[0x1050_0073, 0x0000_0013]); // wfi; nop
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        assert_eq!(s.interp(10), 1);
        assert!(s.power_down());
        assert_eq!(s.pc, RAM_BASE_ADDR + 4);

        // An enabled pending interrupt wakes the hart.
        s.signals.write_mie(MIP_MTIP);
        s.signals.set_mip(MIP_MTIP);
        assert!(!s.power_down());
    }

    #[test]
    fn timer_interrupt_taken_between_instructions() {
        let mut m = machine();
        load_program(&m, &[0x0000_0013, 0x0000_0013]); // nops
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.mstatus |= MSTATUS_MIE;
        s.signals.write_mie(MIP_MTIP);
        s.signals.set_mip(MIP_MTIP);

        s.interp(1);
        assert_eq!(s.mcause, (1 << 63) | 7);
        assert_eq!(s.pc, RAM_BASE_ADDR + 0x1000);
    }

    #[test]
    fn lowest_pending_interrupt_wins() {
        let mut m = machine();
        let s = &mut m.cpu;
        s.mstatus |= MSTATUS_MIE;
        s.signals.write_mie(MIP_MTIP | MIP_MSIP);
        s.signals.set_mip(MIP_MTIP | MIP_MSIP);
        assert!(s.raise_interrupt());
        assert_eq!(s.mcause, (1 << 63) | 3); // MSIP (bit 3) before MTIP (bit 7)
    }

    #[test]
    fn csrrw_roundtrip_and_counters() {
        let mut m = machine();
        // csrrw x5, mscratch, x6
        load_program(&m, &[(0x340 << 20) | (6 << 15) | (1 << 12) | (5 << 7) | 0x73]);
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.mscratch = 0x111;
        s.set_reg(6, 0x222);
        s.interp(1);
        assert_eq!(s.read_reg(5), 0x111);
        assert_eq!(s.mscratch, 0x222);
        assert_eq!(s.minstret(), 1);
        assert_eq!(s.cycles(), 1);
    }

    #[test]
    fn illegal_csr_traps() {
        let mut m = machine();
        // csrrw x0, 0xfff, x0 -> illegal
        load_program(&m, &[(0xfffu32 << 20) | (1 << 12) | 0x73]);
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.interp(1);
        assert_eq!(s.mcause, 2);
    }

    #[test]
    fn mret_returns_to_mepc() {
        let mut m = machine();
        load_program(&m, &[0x3020_0073]); // mret
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.mepc = RAM_BASE_ADDR + 0x80;
        s.mstatus |= 3 << 11; // MPP = M
        s.interp(1);
        assert_eq!(s.pc, RAM_BASE_ADDR + 0x80);
        assert_eq!(s.minstret(), 1);
    }

    #[test]
    fn fp_move_add_roundtrip() {
        let mut m = machine();
        load_program(
            &m,
            &[
                0xf002_80d3, // fmv.w.x f1, x5
                0x0010_8153, // fadd.s f2, f1, f1
                0xe001_0353, // fmv.x.w x6, f2
            ],
        );
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.fs = 1;
        s.set_reg(5, 0x3f80_0000); // 1.0f
        assert_eq!(s.interp(3), 3);
        assert_eq!(s.read_reg(6), 0x4000_0000); // 2.0f
        assert_eq!(s.fs, 3);
    }

    #[test]
    fn fp_ops_illegal_when_fs_off() {
        let mut m = machine();
        load_program(&m, &[0x0010_8153]); // fadd.s
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.fs = 0;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.interp(1);
        assert_eq!(s.mcause, 2);
    }

    #[test]
    fn interrupt_cause_is_marked() {
        let mut m = machine();
        let s = &mut m.cpu;
        s.mstatus |= MSTATUS_MIE;
        s.signals.write_mie(MIP_MTIP);
        s.signals.set_mip(MIP_MTIP);
        s.raise_interrupt();
        assert_eq!(s.mcause & (1 << 63), 1 << 63);
        assert_eq!(s.mcause & 0x1f, 7);
    }
}
