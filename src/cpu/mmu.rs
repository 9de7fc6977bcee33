use crate::cpu::core::{CpuState, MSTATUS_MPP_SHIFT, MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM};
use crate::cpu::types::{Access, Exception, Priv};
use crate::memmap::{PG_MASK, PG_SHIFT};

pub const TLB_SIZE: usize = 256;

/// Compile-time misaligned-access policy. When false (the supported
/// configuration), misaligned loads/stores trap; the byte-assembly path is
/// compiled out.
pub const ALLOW_MISALIGNED_ACCESS: bool = false;

const PTE_V_MASK: u64 = 1 << 0;
const PTE_U_MASK: u64 = 1 << 4;
const PTE_A_MASK: u64 = 1 << 6;
const PTE_D_MASK: u64 = 1 << 7;

/// One direct-mapped TLB line. `mem_addend` is chosen so that
/// `mem_addend + vaddr` is the host address of the guest byte, for any vaddr
/// inside the tagged page. An all-ones tag never matches a real page.
#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub vaddr: u64,
    pub mem_addend: u64,
}

impl TlbEntry {
    pub const INVALID: TlbEntry = TlbEntry {
        vaddr: u64::MAX,
        mem_addend: 0,
    };
}

enum WalkError {
    /// Translation failed: page fault for the access type.
    Translation,
    /// The physical address is illegal: access fault.
    Access,
}

impl CpuState {
    pub(crate) fn tlb_flush_all(&mut self) {
        self.tlb_read = [TlbEntry::INVALID; TLB_SIZE];
        self.tlb_write = [TlbEntry::INVALID; TLB_SIZE];
        self.tlb_code = [TlbEntry::INVALID; TLB_SIZE];
    }

    /// SFENCE.VMA with a specific address. Flushing everything is stricter
    /// than required and keeps the three caches trivially coherent.
    pub(crate) fn tlb_flush_vaddr(&mut self, _vaddr: u64) {
        self.tlb_flush_all();
    }

    /// Invalidate write-TLB lines whose addends point into a host RAM
    /// region the host has mutated behind the CPU's back.
    pub fn flush_tlb_write_range(&mut self, ram_ptr: *const u8, ram_size: usize) {
        let start = ram_ptr as u64;
        let end = start + ram_size as u64;
        for e in self.tlb_write.iter_mut() {
            if e.vaddr != u64::MAX {
                let host = e.mem_addend.wrapping_add(e.vaddr);
                if host >= start && host < end {
                    *e = TlbEntry::INVALID;
                }
            }
        }
    }

    /// Walk the page tables (or apply M-mode / bare rules) and return the
    /// physical address for `vaddr`.
    ///
    /// A and D are software managed: the walker never writes PTEs; a clear
    /// A (or clear D on a write) is a page fault.
    fn get_phys_addr_raw(&self, vaddr: u64, access: Access) -> Result<u64, WalkError> {
        // MPRV redirects data accesses to the MPP privilege.
        let priv_ = if (self.mstatus & MSTATUS_MPRV) != 0 && access != Access::Code {
            Priv::from_bits((self.mstatus >> MSTATUS_MPP_SHIFT) & 3)
        } else {
            self.priv_
        };

        if priv_ == Priv::Machine {
            // Models the implementation's 56-bit physical address limit.
            if self.cur_xlen > 32 && vaddr >> 56 != 0 {
                return Err(WalkError::Access);
            }
            return Ok(vaddr);
        }

        let mode = (self.satp >> 60) & 0xf;
        if mode == 0 {
            return Ok(vaddr);
        }

        // Sv39 (mode 8) or Sv48 (mode 9); other modes are rejected at the
        // satp write.
        let levels = (mode - 8 + 3) as u32;
        let vaddr_shift = 64 - (PG_SHIFT as u32 + levels * 9);
        if ((vaddr as i64) << vaddr_shift >> vaddr_shift) as u64 != vaddr {
            return Err(WalkError::Translation);
        }

        let mut pte_addr = (self.satp & ((1u64 << 44) - 1)) << PG_SHIFT;
        for i in 0..levels {
            let shift = PG_SHIFT as u32 + 9 * (levels - 1 - i);
            let pte_idx = (vaddr >> shift) & 0x1ff;
            pte_addr += pte_idx << 3;
            let pte = self.mem_map.phys_read_u64(pte_addr);

            if pte & PTE_V_MASK == 0 {
                return Err(WalkError::Translation);
            }
            let paddr = (pte >> 10) << PG_SHIFT;
            let mut xwr = ((pte >> 1) & 7) as u32;
            if xwr == 0 {
                // Pointer to the next level.
                pte_addr = paddr;
                continue;
            }

            // Leaf checks, in architectural order.
            if xwr == 2 || xwr == 6 {
                return Err(WalkError::Translation);
            }
            if priv_ == Priv::Supervisor {
                if pte & PTE_U_MASK != 0 && self.mstatus & MSTATUS_SUM == 0 {
                    return Err(WalkError::Translation);
                }
            } else if pte & PTE_U_MASK == 0 {
                return Err(WalkError::Translation);
            }
            // MXR grants read where execute is permitted.
            if self.mstatus & MSTATUS_MXR != 0 {
                xwr |= xwr >> 2;
            }
            let access_bit = match access {
                Access::Read => 0,
                Access::Write => 1,
                Access::Code => 2,
            };
            if (xwr >> access_bit) & 1 == 0 {
                return Err(WalkError::Translation);
            }
            // Misaligned superpage.
            let ppn = pte >> 10;
            let low = levels - 1 - i;
            if ((1u64 << (9 * low)) - 1) & ppn != 0 {
                return Err(WalkError::Translation);
            }
            // Software-managed A/D.
            if pte & PTE_A_MASK == 0 {
                return Err(WalkError::Translation);
            }
            if access == Access::Write && pte & PTE_D_MASK == 0 {
                return Err(WalkError::Translation);
            }

            let vaddr_mask = (1u64 << shift) - 1;
            return Ok((paddr & !vaddr_mask) | (vaddr & vaddr_mask));
        }
        Err(WalkError::Translation)
    }

    /// Translate `vaddr` for `access`, mapping walk failures to the
    /// appropriate page/access fault.
    pub(crate) fn translate_addr(&self, vaddr: u64, access: Access) -> Result<u64, Exception> {
        self.get_phys_addr_raw(vaddr, access).map_err(|e| match (e, access) {
            (WalkError::Translation, Access::Read) => Exception::LoadPageFault(vaddr),
            (WalkError::Translation, Access::Write) => Exception::StorePageFault(vaddr),
            (WalkError::Translation, Access::Code) => Exception::FetchPageFault(vaddr),
            (WalkError::Access, Access::Read) => Exception::LoadFault(vaddr),
            (WalkError::Access, Access::Write) => Exception::StoreFault(vaddr),
            (WalkError::Access, Access::Code) => Exception::FetchFault(vaddr),
        })
    }
}

/// Generate the load fast path + slow path for one access width, following
/// the legacy layout: the fast path is a tag compare plus an unaligned host
/// load; everything else drops to the walker.
macro_rules! target_read {
    ($name:ident, $slow:ident, $ty:ty, $size_log2:expr) => {
        impl CpuState {
            #[inline(always)]
            pub(crate) fn $name(&mut self, addr: u64) -> Result<$ty, Exception> {
                const SIZE: u64 = 1 << $size_log2;
                if !ALLOW_MISALIGNED_ACCESS && addr & (SIZE - 1) != 0 {
                    return Err(Exception::MisalignedLoad(addr));
                }
                let idx = ((addr >> PG_SHIFT) as usize) & (TLB_SIZE - 1);
                let e = self.tlb_read[idx];
                if e.vaddr == (addr & !PG_MASK) {
                    self.last_addr = addr;
                    // SAFETY: the addend invariant guarantees the host
                    // pointer covers the whole tagged page.
                    let val = unsafe {
                        ((e.mem_addend.wrapping_add(addr)) as *const $ty).read_unaligned()
                    };
                    Ok(val)
                } else {
                    self.$slow(addr).map(|v| v as $ty)
                }
            }

            fn $slow(&mut self, addr: u64) -> Result<u64, Exception> {
                self.read_slow(addr, $size_log2)
            }
        }
    };
}

target_read!(read_u8, read_u8_slow, u8, 0);
target_read!(read_u16, read_u16_slow, u16, 1);
target_read!(read_u32, read_u32_slow, u32, 2);
target_read!(read_u64, read_u64_fallback, u64, 3);

macro_rules! target_write {
    ($name:ident, $slow:ident, $ty:ty, $size_log2:expr) => {
        impl CpuState {
            #[inline(always)]
            pub(crate) fn $name(&mut self, addr: u64, val: $ty) -> Result<(), Exception> {
                const SIZE: u64 = 1 << $size_log2;
                if !ALLOW_MISALIGNED_ACCESS && addr & (SIZE - 1) != 0 {
                    return Err(Exception::MisalignedStore(addr));
                }
                let idx = ((addr >> PG_SHIFT) as usize) & (TLB_SIZE - 1);
                let e = self.tlb_write[idx];
                if e.vaddr == (addr & !PG_MASK) {
                    self.last_addr = addr;
                    let host = e.mem_addend.wrapping_add(addr) as *mut $ty;
                    // SAFETY: addend invariant, as in the read path.
                    unsafe {
                        self.record_store_shadow(addr, host.read_unaligned() as u64, $size_log2);
                        host.write_unaligned(val);
                    }
                    Ok(())
                } else {
                    self.$slow(addr, val as u64)
                }
            }

            fn $slow(&mut self, addr: u64, val: u64) -> Result<(), Exception> {
                self.write_slow(addr, val, $size_log2)
            }
        }
    };
}

target_write!(write_u8, write_u8_slow, u8, 0);
target_write!(write_u16, write_u16_slow, u16, 1);
target_write!(write_u32, write_u32_slow, u32, 2);
target_write!(write_u64, write_u64_slow_entry, u64, 3);

impl CpuState {
    /// Remember the value a store is about to clobber, for checkpoint
    /// replay. Only the widths the repair API understands are shadowed.
    #[inline(always)]
    fn record_store_shadow(&mut self, addr: u64, old: u64, size_log2: u32) {
        match size_log2 {
            2 => {
                self.store_repair_addr = addr;
                self.store_repair_val32 = old as u32;
            }
            3 => {
                self.store_repair_addr = addr;
                self.store_repair_val64 = old;
            }
            _ => {}
        }
    }

    fn read_slow(&mut self, addr: u64, size_log2: u32) -> Result<u64, Exception> {
        let size = 1u64 << size_log2;
        let al = addr & (size - 1);
        if al != 0 {
            if !ALLOW_MISALIGNED_ACCESS {
                return Err(Exception::MisalignedLoad(addr));
            }
            // Byte-assembled misaligned read (compiled out by default).
            let mut ret = 0u64;
            for i in 0..size {
                ret |= (self.read_u8(addr + i)? as u64) << (8 * i);
            }
            return Ok(ret);
        }

        let paddr = self.translate_addr(addr, Access::Read)?;
        let Some(range) = self.mem_map.get_range(paddr) else {
            log::warn!("target_read_slow: invalid physical address {:#x}", paddr);
            return Ok(0);
        };
        self.last_addr = addr;
        if range.is_ram() {
            let ptr = range.ram_ptr(paddr - range.addr);
            let idx = ((addr >> PG_SHIFT) as usize) & (TLB_SIZE - 1);
            self.tlb_read[idx] = TlbEntry {
                vaddr: addr & !PG_MASK,
                mem_addend: (ptr as u64).wrapping_sub(addr),
            };
            // SAFETY: ptr is inside the RAM buffer; the whole access fits
            // because ranges are page-multiples and the access is aligned.
            let val = unsafe {
                match size_log2 {
                    0 => *ptr as u64,
                    1 => (ptr as *const u16).read_unaligned() as u64,
                    2 => (ptr as *const u32).read_unaligned() as u64,
                    3 => (ptr as *const u64).read_unaligned(),
                    _ => unreachable!("unsupported load width"),
                }
            };
            Ok(val)
        } else {
            Ok(range.read_device(paddr - range.addr, size_log2 as u8))
        }
    }

    fn write_slow(&mut self, addr: u64, val: u64, size_log2: u32) -> Result<(), Exception> {
        let size = 1u64 << size_log2;
        if addr & (size - 1) != 0 {
            if !ALLOW_MISALIGNED_ACCESS {
                return Err(Exception::MisalignedStore(addr));
            }
            // Pre-walk every touched page so a mid-way fault cannot leave a
            // partial store, then commit bytewise.
            let first_page = addr & !PG_MASK;
            let last_page = (addr + size - 1) & !PG_MASK;
            self.translate_addr(addr, Access::Write)?;
            if last_page != first_page {
                self.translate_addr(last_page, Access::Write)?;
            }
            for i in 0..size {
                self.write_u8(addr + i, (val >> (8 * i)) as u8)?;
            }
            return Ok(());
        }

        let paddr = self.translate_addr(addr, Access::Write)?;
        let Some(range) = self.mem_map.get_range(paddr) else {
            log::warn!("target_write_slow: invalid physical address {:#x}", paddr);
            return Ok(());
        };
        self.last_addr = addr;
        if range.is_ram() {
            range.set_dirty(paddr - range.addr);
            let ptr = range.ram_ptr(paddr - range.addr);
            let idx = ((addr >> PG_SHIFT) as usize) & (TLB_SIZE - 1);
            self.tlb_write[idx] = TlbEntry {
                vaddr: addr & !PG_MASK,
                mem_addend: (ptr as u64).wrapping_sub(addr),
            };
            // SAFETY: as in read_slow.
            unsafe {
                match size_log2 {
                    0 => *ptr = val as u8,
                    1 => (ptr as *mut u16).write_unaligned(val as u16),
                    2 => {
                        self.record_store_shadow(addr, (ptr as *const u32).read_unaligned() as u64, 2);
                        (ptr as *mut u32).write_unaligned(val as u32)
                    }
                    3 => {
                        self.record_store_shadow(addr, (ptr as *const u64).read_unaligned(), 3);
                        (ptr as *mut u64).write_unaligned(val)
                    }
                    _ => unreachable!("unsupported store width"),
                }
            }
            Ok(())
        } else {
            range.write_device(paddr - range.addr, val, size_log2 as u8);
            Ok(())
        }
    }

    /// Host-side write used by repair replay: bypasses the TLB fast path
    /// but follows the normal slow-path rules.
    pub(crate) fn write_u64_slow(&mut self, addr: u64, val: u64) -> Result<(), Exception> {
        self.write_slow(addr, val, 3)
    }

    // ── Instruction fetch ──────────────────────────────────────────────

    /// Fetch the instruction at `addr` through the code TLB. Returns the
    /// raw 32 bits (for a compressed instruction only the low 16 are
    /// meaningful; the caller inspects the length bits).
    pub(crate) fn fetch_insn(&mut self, addr: u64) -> Result<u32, Exception> {
        if addr & 1 != 0 {
            return Err(Exception::MisalignedFetch(addr));
        }
        let idx = ((addr >> PG_SHIFT) as usize) & (TLB_SIZE - 1);
        let e = self.tlb_code[idx];
        if e.vaddr == (addr & !PG_MASK) && (addr & PG_MASK) < PG_MASK - 1 {
            // Fast path: one unaligned 4-byte host load covers both the
            // compressed and the full-width case.
            // SAFETY: addend invariant; addr is 2-aligned, so the guard
            // keeps all four bytes inside the tagged page.
            let insn =
                unsafe { ((e.mem_addend.wrapping_add(addr)) as *const u32).read_unaligned() };
            return Ok(insn);
        }

        // 16-bit granular path: each half is walked independently so a
        // page-straddling instruction reports the original PC on a fault in
        // either half.
        let lo = self.fetch_u16(addr, addr)?;
        if lo & 3 != 3 {
            return Ok(lo as u32);
        }
        let hi = self.fetch_u16(addr.wrapping_add(2), addr)?;
        Ok((lo as u32) | ((hi as u32) << 16))
    }

    fn fetch_u16(&mut self, addr: u64, report_pc: u64) -> Result<u16, Exception> {
        let idx = ((addr >> PG_SHIFT) as usize) & (TLB_SIZE - 1);
        let e = self.tlb_code[idx];
        if e.vaddr == (addr & !PG_MASK) {
            // SAFETY: addend invariant.
            let half =
                unsafe { ((e.mem_addend.wrapping_add(addr)) as *const u16).read_unaligned() };
            return Ok(half);
        }

        let paddr = self
            .translate_addr(addr, Access::Code)
            .map_err(|e| match e {
                Exception::FetchPageFault(_) => Exception::FetchPageFault(report_pc),
                _ => Exception::FetchFault(report_pc),
            })?;
        let Some(range) = self.mem_map.get_range(paddr) else {
            return Err(Exception::FetchFault(report_pc));
        };
        if !range.is_ram() {
            // Code only executes from RAM.
            return Err(Exception::FetchFault(report_pc));
        }
        let ptr = range.ram_ptr(paddr - range.addr);
        self.tlb_code[idx] = TlbEntry {
            vaddr: addr & !PG_MASK,
            mem_addend: (ptr as u64).wrapping_sub(addr),
        };
        // SAFETY: ptr is in bounds and addr is 2-aligned.
        Ok(unsafe { (ptr as *const u16).read_unaligned() })
    }
}
