use std::cell::Cell;
use std::rc::Rc;

use crate::cpu::mmu::{TlbEntry, TLB_SIZE};
use crate::cpu::types::{CtfInfo, Priv};
use crate::memmap::PhysMemoryMap;

pub const MAX_TRIGGERS: usize = 1;

// mstatus fields.
pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE_SHIFT: u32 = 5;
pub const MSTATUS_SPIE: u64 = 1 << MSTATUS_SPIE_SHIFT;
pub const MSTATUS_MPIE_SHIFT: u32 = 7;
pub const MSTATUS_MPIE: u64 = 1 << MSTATUS_MPIE_SHIFT;
pub const MSTATUS_SPP_SHIFT: u32 = 8;
pub const MSTATUS_SPP: u64 = 1 << MSTATUS_SPP_SHIFT;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_MPP: u64 = 3 << MSTATUS_MPP_SHIFT;
pub const MSTATUS_FS_SHIFT: u32 = 13;
pub const MSTATUS_FS: u64 = 3 << MSTATUS_FS_SHIFT;
pub const MSTATUS_XS: u64 = 3 << 15;
pub const MSTATUS_MPRV: u64 = 1 << 17;
pub const MSTATUS_SUM: u64 = 1 << 18;
pub const MSTATUS_MXR: u64 = 1 << 19;
pub const MSTATUS_TVM: u64 = 1 << 20;
pub const MSTATUS_TW: u64 = 1 << 21;
pub const MSTATUS_TSR: u64 = 1 << 22;
pub const MSTATUS_UXL_SHIFT: u32 = 32;
pub const MSTATUS_SXL_SHIFT: u32 = 34;
pub const MSTATUS_UXL_MASK: u64 = 3 << MSTATUS_UXL_SHIFT;
pub const MSTATUS_SXL_MASK: u64 = 3 << MSTATUS_SXL_SHIFT;

pub const SSTATUS_MASK: u64 = MSTATUS_SIE
    | MSTATUS_SPIE
    | MSTATUS_SPP
    | MSTATUS_FS
    | MSTATUS_SUM
    | MSTATUS_MXR
    | MSTATUS_UXL_MASK;

pub const MSTATUS_MASK: u64 = MSTATUS_SIE
    | MSTATUS_MIE
    | MSTATUS_SPIE
    | MSTATUS_MPIE
    | MSTATUS_SPP
    | MSTATUS_MPP
    | MSTATUS_FS
    | MSTATUS_MPRV
    | MSTATUS_SUM
    | MSTATUS_MXR
    | MSTATUS_TVM
    | MSTATUS_TW
    | MSTATUS_TSR
    | MSTATUS_UXL_MASK
    | MSTATUS_SXL_MASK;

// misa extension letters.
pub const MCPUID_A: u32 = 1 << 0;
pub const MCPUID_C: u32 = 1 << 2;
pub const MCPUID_D: u32 = 1 << 3;
pub const MCPUID_F: u32 = 1 << 5;
pub const MCPUID_I: u32 = 1 << 8;
pub const MCPUID_M: u32 = 1 << 12;
pub const MCPUID_SUPER: u32 = 1 << 18;
pub const MCPUID_USER: u32 = 1 << 20;

pub const CAUSE_MASK: u64 = 0x1f;
/// Flag OR'd into a raw cause to mark an interrupt; converted to the
/// xlen-relative MSB when the cause register is written.
pub const CAUSE_INTERRUPT: u32 = 1 << 31;

/// Invalid reservation marker for `load_res`.
pub const LOAD_RES_NONE: u64 = u64::MAX;

/// Interrupt and termination lines shared between the CPU core, the device
/// models and the machine. Devices assert or clear mip bits through this;
/// the retired-cycle counter is published here for the cycle-derived RTC.
pub struct CoreSignals {
    mip: Cell<u32>,
    mie: Cell<u32>,
    power_down: Cell<bool>,
    terminate: Cell<bool>,
    cycles: Cell<u64>,
}

impl CoreSignals {
    pub fn new() -> Rc<CoreSignals> {
        Rc::new(CoreSignals {
            mip: Cell::new(0),
            mie: Cell::new(0),
            power_down: Cell::new(false),
            terminate: Cell::new(false),
            cycles: Cell::new(0),
        })
    }

    #[inline]
    pub fn mip(&self) -> u32 {
        self.mip.get()
    }

    /// Assert mip bits. Exits power-down as soon as any enabled interrupt
    /// becomes pending.
    pub fn set_mip(&self, mask: u32) {
        self.mip.set(self.mip.get() | mask);
        if self.power_down.get() && (self.mip.get() & self.mie.get()) != 0 {
            self.power_down.set(false);
        }
    }

    pub fn reset_mip(&self, mask: u32) {
        self.mip.set(self.mip.get() & !mask);
    }

    pub fn write_mip(&self, val: u32) {
        self.mip.set(val);
        if self.power_down.get() && (self.mip.get() & self.mie.get()) != 0 {
            self.power_down.set(false);
        }
    }

    #[inline]
    pub fn mie(&self) -> u32 {
        self.mie.get()
    }

    pub fn write_mie(&self, val: u32) {
        self.mie.set(val);
        if self.power_down.get() && (self.mip.get() & self.mie.get()) != 0 {
            self.power_down.set(false);
        }
    }

    pub fn power_down(&self) -> bool {
        self.power_down.get()
    }

    pub fn set_power_down(&self, v: bool) {
        self.power_down.set(v);
    }

    pub fn terminated(&self) -> bool {
        self.terminate.get()
    }

    pub fn request_terminate(&self) {
        self.terminate.set(true);
    }

    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }

    #[inline]
    pub fn publish_cycles(&self, v: u64) {
        self.cycles.set(v);
    }
}

/// Complete architectural and simulator state of the single hart.
///
/// Everything the interpreter touches lives here; there is no process-wide
/// state. The physical memory map is shared with the machine through `Rc`
/// but RAM is only reached through map queries or TLB addends installed by
/// map queries.
pub struct CpuState {
    pub pc: u64,
    pub(crate) reg: [u64; 32],
    /// Value each register held before its most recent write, for one-step
    /// rollback by an external checker. Written before the new value.
    pub(crate) reg_prior: [u64; 32],
    /// Timestamp (in committed instructions) of each register's most recent
    /// definition.
    pub(crate) reg_ts: [u64; 32],
    pub(crate) most_recently_written_reg: Option<usize>,

    pub(crate) fp_reg: [u64; 32],
    pub(crate) fp_reg_ts: [u64; 32],
    pub(crate) most_recently_written_fp_reg: Option<usize>,
    pub(crate) fflags: u32,
    pub(crate) frm: u8,

    pub(crate) cur_xlen: u32,
    pub(crate) priv_: Priv,
    /// mstatus.FS, kept out of the stored mstatus image.
    pub(crate) fs: u8,
    pub(crate) mxl: u8,

    pub(crate) insn_counter: u64,
    pub(crate) minstret: u64,
    pub(crate) mcycle: u64,
    pub(crate) stop_the_counter: bool,

    pub(crate) signals: Rc<CoreSignals>,

    // CSRs. mip/mie live in `signals` so devices can reach them.
    pub(crate) mstatus: u64,
    pub(crate) mtvec: u64,
    pub(crate) mscratch: u64,
    pub(crate) mepc: u64,
    pub(crate) mcause: u64,
    pub(crate) mtval: u64,
    pub(crate) mvendorid: u64,
    pub(crate) marchid: u64,
    pub(crate) mimpid: u64,
    pub(crate) mhartid: u64,
    pub(crate) misa: u32,
    pub(crate) medeleg: u32,
    pub(crate) mideleg: u32,
    pub(crate) mcounteren: u32,
    pub(crate) tselect: u32,
    pub(crate) tdata1: [u64; MAX_TRIGGERS],
    pub(crate) tdata2: [u64; MAX_TRIGGERS],
    pub(crate) tdata3: [u64; MAX_TRIGGERS],
    pub(crate) mhpmevent: [u64; 32],

    pub(crate) stvec: u64,
    pub(crate) sscratch: u64,
    pub(crate) sepc: u64,
    pub(crate) scause: u64,
    pub(crate) stval: u64,
    pub(crate) satp: u64,
    pub(crate) scounteren: u32,

    pub(crate) dcsr: u64,
    pub(crate) dpc: u64,
    pub(crate) dscratch: u64,

    /// Reservation physical address for LR/SC, `LOAD_RES_NONE` when empty.
    pub(crate) load_res: u64,
    /// Shadow of the memory a store is about to clobber, for
    /// checkpoint-driven replay.
    pub(crate) store_repair_val32: u32,
    pub(crate) store_repair_val64: u64,
    pub(crate) store_repair_addr: u64,
    /// Most recent guest memory address touched (feeds load repair).
    pub(crate) last_addr: u64,

    pub(crate) mem_map: Rc<PhysMemoryMap>,

    pub(crate) tlb_read: [TlbEntry; TLB_SIZE],
    pub(crate) tlb_write: [TlbEntry; TLB_SIZE],
    pub(crate) tlb_code: [TlbEntry; TLB_SIZE],

    /// Named validation event that ends the simulation, if configured.
    pub(crate) terminating_event: Option<String>,

    pub(crate) info: CtfInfo,
    pub(crate) next_addr: u64,
}

impl CpuState {
    pub fn new(
        mem_map: Rc<PhysMemoryMap>,
        signals: Rc<CoreSignals>,
        terminating_event: Option<String>,
    ) -> CpuState {
        let mxl = 2u8; // RV64
        let mut s = CpuState {
            pc: crate::machine::BOOT_BASE_ADDR,
            reg: [0; 32],
            reg_prior: [0; 32],
            reg_ts: [0; 32],
            most_recently_written_reg: None,
            fp_reg: [0; 32],
            fp_reg_ts: [0; 32],
            most_recently_written_fp_reg: None,
            fflags: 0,
            frm: 0,
            cur_xlen: 64,
            priv_: Priv::Machine,
            fs: 0,
            mxl,
            insn_counter: 0,
            minstret: 0,
            mcycle: 0,
            stop_the_counter: false,
            signals,
            mstatus: ((mxl as u64) << MSTATUS_UXL_SHIFT)
                | ((mxl as u64) << MSTATUS_SXL_SHIFT)
                | (3 << MSTATUS_MPP_SHIFT),
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            // Esperanto JEDEC number 101 in bank 11.
            mvendorid: 11 * 128 + 101,
            marchid: (1 << 63) | 2,
            mimpid: 1,
            mhartid: 0,
            misa: MCPUID_SUPER
                | MCPUID_USER
                | MCPUID_I
                | MCPUID_M
                | MCPUID_A
                | MCPUID_F
                | MCPUID_D
                | MCPUID_C,
            medeleg: 0,
            mideleg: 0,
            mcounteren: 0,
            tselect: 0,
            tdata1: [!0; MAX_TRIGGERS],
            tdata2: [!0; MAX_TRIGGERS],
            tdata3: [0; MAX_TRIGGERS],
            mhpmevent: [0; 32],
            stvec: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            satp: 0,
            scounteren: 0,
            dcsr: 0,
            dpc: 0,
            dscratch: 0,
            load_res: LOAD_RES_NONE,
            store_repair_val32: 0,
            store_repair_val64: 0,
            store_repair_addr: !0,
            last_addr: 0,
            mem_map,
            tlb_read: [TlbEntry::INVALID; TLB_SIZE],
            tlb_write: [TlbEntry::INVALID; TLB_SIZE],
            tlb_code: [TlbEntry::INVALID; TLB_SIZE],
            terminating_event,
            info: CtfInfo::None,
            next_addr: 0,
        };
        s.tlb_flush_all();
        s
    }

    // ── Register file ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn read_reg(&self, rn: u8) -> u64 {
        self.reg[rn as usize]
    }

    /// Write an integer register, recording the previous value and the
    /// write timestamp first. Writes to x0 are discarded by the decoder, so
    /// this is only reached for rn != 0.
    #[inline(always)]
    pub(crate) fn write_reg(&mut self, rn: u8, val: u64) {
        let rn = rn as usize;
        self.most_recently_written_reg = Some(rn);
        self.reg_ts[rn] = self.insn_counter;
        self.reg_prior[rn] = self.reg[rn];
        self.reg[rn] = val;
    }

    #[inline(always)]
    pub fn read_fp_reg(&self, rn: u8) -> u64 {
        self.fp_reg[rn as usize]
    }

    #[inline(always)]
    pub(crate) fn write_fp_reg(&mut self, rn: u8, val: u64) {
        let rn = rn as usize;
        self.most_recently_written_fp_reg = Some(rn);
        self.fp_reg_ts[rn] = self.insn_counter;
        self.fp_reg[rn] = val;
        self.fs = 3;
    }

    /// Host-side register poke (loader, snapshot restore, repair).
    pub fn set_reg(&mut self, rn: u8, val: u64) {
        assert!(rn != 0 && rn < 32);
        self.reg[rn as usize] = val;
    }

    pub fn set_fp_reg(&mut self, rn: u8, val: u64) {
        self.fp_reg[rn as usize] = val;
    }

    pub fn set_pc(&mut self, val: u64) {
        let mask = if self.misa & MCPUID_C != 0 { !1 } else { !3 };
        self.pc = val & mask;
    }

    /// Sync the rollback shadows after the checker accepts a step.
    pub fn sync_regs(&mut self) {
        self.reg_prior[1..].copy_from_slice(&self.reg[1..]);
    }

    pub fn most_recently_written_reg(&self) -> Option<(usize, u64)> {
        self.most_recently_written_reg.map(|rn| (rn, self.reg_ts[rn]))
    }

    pub fn most_recently_written_fp_reg(&self) -> Option<(usize, u64)> {
        self.most_recently_written_fp_reg
            .map(|rn| (rn, self.fp_reg_ts[rn]))
    }

    // ── mstatus ────────────────────────────────────────────────────────

    /// Assemble the readable mstatus: FS merged back in, SD derived from
    /// FS/XS being Dirty (never stored).
    pub fn get_mstatus(&self, mask: u64) -> u64 {
        let mut val = (self.mstatus | ((self.fs as u64) << MSTATUS_FS_SHIFT)) & mask;
        let sd =
            (val & MSTATUS_FS) == MSTATUS_FS || (val & MSTATUS_XS) == MSTATUS_XS;
        if sd {
            val |= 1u64 << (self.cur_xlen - 1);
        }
        val
    }

    pub(crate) fn set_mstatus(&mut self, val: u64) {
        // Flush the TLBs on any change of MMU-relevant configuration.
        let mods = self.mstatus ^ val;
        if (mods & (MSTATUS_MPRV | MSTATUS_SUM | MSTATUS_MXR)) != 0
            || ((self.mstatus & MSTATUS_MPRV) != 0 && (mods & MSTATUS_MPP) != 0)
        {
            self.tlb_flush_all();
        }
        self.fs = ((val >> MSTATUS_FS_SHIFT) & 3) as u8;

        let mask = MSTATUS_MASK & !MSTATUS_FS;
        self.mstatus = (self.mstatus & !mask) | (val & mask);

        // UXL and SXL are pinned to RV64 on this target.
        self.mstatus |= (2u64 << MSTATUS_UXL_SHIFT) | (2u64 << MSTATUS_SXL_SHIFT);
    }

    pub fn priv_level(&self) -> Priv {
        self.priv_
    }

    pub(crate) fn set_priv(&mut self, p: Priv) {
        if self.priv_ != p {
            self.tlb_flush_all();
            let mxl = match p {
                Priv::Supervisor => (self.mstatus >> MSTATUS_SXL_SHIFT) & 3,
                Priv::User => (self.mstatus >> MSTATUS_UXL_SHIFT) & 3,
                Priv::Machine => self.mxl as u64,
            };
            self.cur_xlen = 1 << (4 + mxl);
            self.priv_ = p;
        }
    }

    // ── Trap machine ───────────────────────────────────────────────────

    /// Deliver an exception or interrupt at the current PC. `cause` carries
    /// `CAUSE_INTERRUPT` in bit 31 for interrupts; the stored cause gets the
    /// xlen-relative MSB instead.
    pub(crate) fn raise_trap(&mut self, cause: u32, tval: u64) {
        let interrupt = cause & CAUSE_INTERRUPT != 0;
        let raw = (cause & 0x3f) as u64;

        // Delegation only applies to traps originating at or below S.
        let deleg = if self.priv_ <= Priv::Supervisor {
            if interrupt {
                (self.mideleg >> raw) & 1 != 0
            } else {
                (self.medeleg >> raw) & 1 != 0
            }
        } else {
            false
        };

        let mut causel = raw & CAUSE_MASK;
        if interrupt {
            causel |= 1u64 << (self.cur_xlen - 1);
        }

        // Any trap defeats an outstanding LR reservation.
        self.load_res = LOAD_RES_NONE;

        if deleg {
            self.scause = causel;
            self.sepc = self.pc;
            self.stval = tval;
            let sie = (self.mstatus & MSTATUS_SIE) != 0;
            self.mstatus = (self.mstatus & !MSTATUS_SPIE)
                | ((sie as u64) << MSTATUS_SPIE_SHIFT);
            self.mstatus = (self.mstatus & !MSTATUS_SPP)
                | (self.priv_.to_bits() << MSTATUS_SPP_SHIFT);
            self.mstatus &= !MSTATUS_SIE;
            self.set_priv(Priv::Supervisor);
            if self.stvec & 1 != 0 && interrupt {
                self.pc = (self.stvec - 1).wrapping_add(self.scause.wrapping_mul(4));
            } else {
                self.pc = self.stvec;
            }
        } else {
            self.mcause = causel;
            self.mepc = self.pc;
            self.mtval = tval;
            // xPIE <= xIE; xIE <= 0; xPP <= previous privilege, with x = M.
            let mie = (self.mstatus & MSTATUS_MIE) != 0;
            self.mstatus = (self.mstatus & !MSTATUS_MPIE)
                | ((mie as u64) << MSTATUS_MPIE_SHIFT);
            self.mstatus = (self.mstatus & !MSTATUS_MPP)
                | (self.priv_.to_bits() << MSTATUS_MPP_SHIFT);
            self.mstatus &= !MSTATUS_MIE;
            self.set_priv(Priv::Machine);
            if self.mtvec & 1 != 0 && interrupt {
                self.pc = (self.mtvec - 1).wrapping_add(self.mcause.wrapping_mul(4));
            } else {
                self.pc = self.mtvec;
            }
        }
    }

    pub(crate) fn handle_sret(&mut self) {
        // Copy SPIE down into SIE, then set SPIE.
        self.mstatus &= !MSTATUS_SIE;
        self.mstatus |= (self.mstatus >> 4) & MSTATUS_SIE;
        self.mstatus |= MSTATUS_SPIE;

        let spp = (self.mstatus & MSTATUS_SPP) >> MSTATUS_SPP_SHIFT;
        self.mstatus &= !MSTATUS_SPP;

        self.set_priv(Priv::from_bits(spp));
        self.pc = self.sepc;
    }

    pub(crate) fn handle_mret(&mut self) {
        self.mstatus &= !MSTATUS_MIE;
        self.mstatus |= (self.mstatus >> 4) & MSTATUS_MIE;
        self.mstatus |= MSTATUS_MPIE;

        let mpp = (self.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT;
        self.mstatus &= !MSTATUS_MPP;

        self.set_priv(Priv::from_bits(mpp));
        self.pc = self.mepc;
    }

    pub(crate) fn handle_dret(&mut self) {
        self.stop_the_counter = false;
        self.set_priv(Priv::from_bits(self.dcsr & 3));
        self.pc = self.dpc;
    }

    /// Interrupts deliverable right now, after privilege gating.
    fn pending_irq_mask(&self) -> u32 {
        let pending = self.signals.mip() & self.signals.mie();
        if pending == 0 {
            return 0;
        }
        let enabled = match self.priv_ {
            Priv::Machine => {
                if self.mstatus & MSTATUS_MIE != 0 {
                    !self.mideleg
                } else {
                    0
                }
            }
            Priv::Supervisor => {
                let mut e = !self.mideleg;
                if self.mstatus & MSTATUS_SIE != 0 {
                    e |= self.mideleg;
                }
                e
            }
            Priv::User => !0,
        };
        pending & enabled
    }

    /// Take the lowest-numbered deliverable interrupt, if any. Returns true
    /// when a trap was taken (PC now points at the handler).
    pub(crate) fn raise_interrupt(&mut self) -> bool {
        let mask = self.pending_irq_mask();
        if mask == 0 {
            return false;
        }
        let irq = mask.trailing_zeros();
        log::trace!(
            "raise_interrupt: irq={} priv={:?} pc={:#x}",
            irq,
            self.priv_,
            self.pc
        );
        self.raise_trap(irq | CAUSE_INTERRUPT, 0);
        true
    }

    /// Drop the LR reservation when an ordinary store hits the reserved
    /// 64-byte granule. The reservation records a physical address, so the
    /// (rare) check pays for one extra translation.
    pub(crate) fn clear_reservation_if_conflict(&mut self, vaddr: u64) {
        const GRANULE: u64 = 64;
        if self.load_res == LOAD_RES_NONE {
            return;
        }
        if let Ok(pa) = self.translate_addr(vaddr, crate::cpu::types::Access::Write) {
            if pa & !(GRANULE - 1) == self.load_res & !(GRANULE - 1) {
                self.load_res = LOAD_RES_NONE;
            }
        }
    }

    // ── Simulator plumbing ─────────────────────────────────────────────

    pub fn signals(&self) -> &Rc<CoreSignals> {
        &self.signals
    }

    pub fn mem_map(&self) -> &Rc<PhysMemoryMap> {
        &self.mem_map
    }

    pub fn insn_counter(&self) -> u64 {
        self.insn_counter
    }

    pub fn minstret(&self) -> u64 {
        self.minstret
    }

    pub fn cycles(&self) -> u64 {
        self.mcycle
    }

    pub fn terminated(&self) -> bool {
        self.signals.terminated()
    }

    pub fn power_down(&self) -> bool {
        self.signals.power_down()
    }

    pub fn reg_previous(&self, rn: u8) -> u64 {
        self.reg_prior[rn as usize]
    }

    /// CTF record and target of the most recently retired instruction.
    pub fn ctf_info(&self) -> (CtfInfo, u64) {
        (self.info, self.next_addr)
    }

    /// Human-readable register dump for debugging sessions.
    pub fn dump_regs(&self) {
        const NAMES: [&str; 32] = [
            "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2",
            "a3", "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9",
            "s10", "s11", "t3", "t4", "t5", "t6",
        ];
        eprintln!("pc ={:016x}", self.pc);
        for row in 0..8 {
            let mut line = String::new();
            for col in 0..4 {
                let i = row * 4 + col;
                if i == 0 {
                    continue;
                }
                line.push_str(&format!("{:<4}={:016x} ", NAMES[i], self.reg[i]));
            }
            eprintln!("{}", line.trim_end());
        }
        eprintln!(
            "priv={} mstatus={:016x} insn_counter={} minstret={} mcycle={}",
            self.priv_.letter(),
            self.get_mstatus(!0),
            self.insn_counter,
            self.minstret,
            self.mcycle
        );
        eprintln!(
            "mideleg={:08x} mie={:08x} mip={:08x}",
            self.mideleg,
            self.signals.mie(),
            self.signals.mip()
        );
    }

    // ── Checkpoint-driven repair ───────────────────────────────────────

    /// Overwrite a counter CSR and the destination register of a replayed
    /// CSR read. Only the counters an external checker can diverge on are
    /// repairable.
    pub fn repair_csr(&mut self, reg_num: u8, csr_num: u32, csr_val: u64) {
        match csr_num & 0xfff {
            0xb00 | 0xc00 => {
                self.mcycle = csr_val;
                self.reg[reg_num as usize] = csr_val;
            }
            0xb02 | 0xc02 => {
                self.minstret = csr_val;
                self.reg[reg_num as usize] = csr_val;
            }
            _ => {
                log::warn!("repair_csr: unsupported CSR {:#x}", csr_num);
            }
        }
    }

    /// Patch a load whose value diverged because it hit the HTIF mailbox
    /// (or memory the host console protocol owns). Returns true when the
    /// load was repaired.
    pub fn repair_load(
        &mut self,
        reg_num: u8,
        reg_val: u64,
        htif_tohost_addr: u64,
        htif_tohost: &mut u64,
        htif_fromhost: &mut u64,
    ) -> bool {
        let mut repaired = false;
        if self.last_addr == htif_tohost_addr {
            *htif_tohost = reg_val;
            repaired = true;
        } else if self.last_addr == htif_tohost_addr + 64 {
            *htif_fromhost = reg_val;
            repaired = true;
        } else if *htif_tohost <= self.last_addr && self.last_addr < *htif_tohost + 32 {
            let _ = self.write_u64_slow(self.last_addr, reg_val);
            repaired = true;
        }
        if repaired {
            self.reg[reg_num as usize] = reg_val;
        }
        repaired
    }

    /// Replay the most recent store from its shadow. Returns Err when the
    /// replay itself faults.
    pub fn repair_store(&mut self, reg_num: u8, funct3: u32) -> Result<(), ()> {
        match funct3 {
            2 => {
                let (addr, val) = (self.store_repair_addr, self.store_repair_val32);
                if self.write_u32(addr, val).is_err() {
                    return Err(());
                }
                self.reg[reg_num as usize] = 1;
            }
            3 => {
                let (addr, val) = (self.store_repair_addr, self.store_repair_val64);
                if self.write_u64(addr, val).is_err() {
                    return Err(());
                }
                self.reg[reg_num as usize] = 1;
            }
            _ => {
                log::warn!("repair_store: unsupported width funct3={}", funct3);
                return Err(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::types::{MIP_MTIP, MIP_SSIP};
    use crate::machine::{Machine, MachineConfig};

    fn cpu() -> Machine {
        Machine::new(MachineConfig::for_tests()).unwrap()
    }

    #[test]
    fn reset_state() {
        let m = cpu();
        let s = &m.cpu;
        assert_eq!(s.pc, crate::machine::BOOT_BASE_ADDR);
        assert_eq!(s.priv_, Priv::Machine);
        assert_eq!(s.cur_xlen, 64);
        assert_eq!(s.misa & MCPUID_C, MCPUID_C);
        // UXL = SXL = 2 from the start.
        assert_eq!((s.mstatus >> MSTATUS_UXL_SHIFT) & 3, 2);
        assert_eq!((s.mstatus >> MSTATUS_SXL_SHIFT) & 3, 2);
    }

    #[test]
    fn mstatus_sd_is_derived() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.fs = 3;
        let v = s.get_mstatus(!0);
        assert_eq!(v >> 63, 1);
        s.fs = 1;
        let v = s.get_mstatus(!0);
        assert_eq!(v >> 63, 0);
    }

    #[test]
    fn trap_to_machine_saves_context() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.mtvec = 0x8000_1000;
        s.pc = 0x8000_0008;
        s.mstatus |= MSTATUS_MIE;
        s.raise_trap(11, 0); // ecall from M
        assert_eq!(s.mepc, 0x8000_0008);
        assert_eq!(s.mcause, 11);
        assert_eq!(s.mtval, 0);
        assert_eq!(s.pc, 0x8000_1000);
        assert_eq!(s.priv_, Priv::Machine);
        // MPIE took the old MIE, MIE cleared, MPP = M.
        assert_eq!(s.mstatus & MSTATUS_MIE, 0);
        assert_ne!(s.mstatus & MSTATUS_MPIE, 0);
        assert_eq!((s.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT, 3);
    }

    #[test]
    fn delegated_trap_goes_to_supervisor() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.medeleg = 1 << 8; // delegate ecall-from-U
        s.stvec = 0x8000_2000;
        s.set_priv(Priv::User);
        s.pc = 0x4000;
        s.raise_trap(8, 0);
        assert_eq!(s.priv_, Priv::Supervisor);
        assert_eq!(s.sepc, 0x4000);
        assert_eq!(s.scause, 8);
        assert_eq!(s.pc, 0x8000_2000);
        // SPP recorded U.
        assert_eq!(s.mstatus & MSTATUS_SPP, 0);
    }

    #[test]
    fn vectored_interrupt_dispatch() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.mtvec = 0x8000_1001; // vectored
        s.pc = 0x8000_0000;
        s.raise_trap(7 | CAUSE_INTERRUPT, 0);
        assert_eq!(s.mcause, (1 << 63) | 7);
        assert_eq!(s.pc, 0x8000_1000 + 4 * 7);
    }

    #[test]
    fn mret_restores_privilege_and_ie() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.mstatus |= MSTATUS_MIE;
        s.mepc = 0x8000_0040;
        s.pc = 0x8000_0000;
        s.raise_trap(11, 0);
        s.mepc = 0x8000_0040;
        s.handle_mret();
        assert_eq!(s.pc, 0x8000_0040);
        assert_ne!(s.mstatus & MSTATUS_MIE, 0);
        assert_ne!(s.mstatus & MSTATUS_MPIE, 0);
    }

    #[test]
    fn no_interrupt_when_mip_and_mie_disjoint() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.mstatus |= MSTATUS_MIE;
        s.signals.write_mie(MIP_MTIP);
        s.signals.set_mip(MIP_SSIP);
        assert!(!s.raise_interrupt());
        s.signals.set_mip(MIP_MTIP);
        assert!(s.raise_interrupt());
    }

    #[test]
    fn set_mip_clears_power_down() {
        let m = cpu();
        let s = &m.cpu;
        s.signals.write_mie(MIP_MTIP);
        s.signals.set_power_down(true);
        s.signals.set_mip(MIP_MTIP);
        assert!(!s.signals.power_down());
    }

    #[test]
    fn write_reg_records_shadow_before_value() {
        let mut m = cpu();
        let s = &mut m.cpu;
        s.insn_counter = 41;
        s.set_reg(5, 100);
        s.write_reg(5, 200);
        assert_eq!(s.read_reg(5), 200);
        assert_eq!(s.reg_previous(5), 100);
        assert_eq!(s.most_recently_written_reg(), Some((5, 41)));
    }
}
