use std::cell::{RefCell, UnsafeCell};

use thiserror::Error;

pub const PG_SHIFT: u64 = 12;
pub const PG_MASK: u64 = (1 << PG_SHIFT) - 1;

/// Width-capability bits advertised by a device range. A bit set for
/// size_log2 = n means the device natively handles 2^n-byte accesses.
pub const DEVIO_SIZE8: u32 = 1 << 0;
pub const DEVIO_SIZE16: u32 = 1 << 1;
pub const DEVIO_SIZE32: u32 = 1 << 2;
pub const DEVIO_SIZE64: u32 = 1 << 3;

/// Device read callback: (offset, size_log2) -> value.
pub type DevRead = Box<dyn Fn(u64, u8) -> u32>;
/// Device write callback: (offset, value, size_log2).
pub type DevWrite = Box<dyn Fn(u64, u32, u8)>;

/// Errors surfaced by host-side bulk accesses (BIOS injection, snapshots).
/// Guest-visible accesses never produce these; out-of-range guest addresses
/// follow the silent legacy behavior instead.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("out-of-bounds access at {0:#x}")]
    OutOfBounds(u64),

    #[error("no memory range containing {0:#x}")]
    NoRange(u64),
}

enum Backing {
    /// Guest RAM. The buffer never grows or moves after registration, so
    /// raw pointers into it (TLB addends) stay valid for the lifetime of
    /// the map. Interior mutability follows the RISC-V memory model: plain
    /// loads/stores need no synchronization on a single-threaded driver.
    Ram {
        mem: UnsafeCell<Vec<u8>>,
        /// One bit per 4 KiB page, set on every guest store that reaches
        /// the slow path (fast-path stores hit pages already marked at TLB
        /// install time).
        dirty: RefCell<Vec<u64>>,
    },
    /// Memory-mapped device. The closures capture whatever shared state
    /// the registrar chose (the Rust form of the legacy opaque pointer).
    Device {
        read: DevRead,
        write: DevWrite,
        devio_flags: u32,
    },
}

/// One physical address range, either RAM or device I/O.
pub struct PhysMemoryRange {
    pub addr: u64,
    pub size: u64,
    backing: Backing,
}

impl PhysMemoryRange {
    pub fn is_ram(&self) -> bool {
        matches!(self.backing, Backing::Ram { .. })
    }

    pub fn devio_flags(&self) -> u32 {
        match &self.backing {
            Backing::Device { devio_flags, .. } => *devio_flags,
            Backing::Ram { .. } => 0,
        }
    }

    /// Host pointer to the RAM byte at `offset`. Panics if called on a
    /// device range (callers check `is_ram` first).
    #[inline(always)]
    pub fn ram_ptr(&self, offset: u64) -> *mut u8 {
        match &self.backing {
            Backing::Ram { mem, .. } => {
                debug_assert!(offset < self.size);
                // SAFETY: the Vec is allocated at registration with
                // capacity == size and never reallocated.
                unsafe { (*mem.get()).as_mut_ptr().add(offset as usize) }
            }
            Backing::Device { .. } => unreachable!("ram_ptr on a device range"),
        }
    }

    /// Mark the page containing `offset` dirty.
    pub fn set_dirty(&self, offset: u64) {
        if let Backing::Ram { dirty, .. } = &self.backing {
            let page = (offset >> PG_SHIFT) as usize;
            let mut bits = dirty.borrow_mut();
            if let Some(word) = bits.get_mut(page / 64) {
                *word |= 1 << (page % 64);
            }
        }
    }

    /// Snapshot of the dirty bitmap (one bit per page).
    pub fn dirty_pages(&self) -> Vec<u64> {
        match &self.backing {
            Backing::Ram { dirty, .. } => dirty.borrow().clone(),
            Backing::Device { .. } => Vec::new(),
        }
    }

    pub fn clear_dirty(&self) {
        if let Backing::Ram { dirty, .. } = &self.backing {
            for word in dirty.borrow_mut().iter_mut() {
                *word = 0;
            }
        }
    }

    fn dev_read(&self, offset: u64, size_log2: u8) -> u32 {
        match &self.backing {
            Backing::Device { read, .. } => read(offset, size_log2),
            Backing::Ram { .. } => unreachable!("dev_read on a RAM range"),
        }
    }

    fn dev_write(&self, offset: u64, val: u32, size_log2: u8) {
        match &self.backing {
            Backing::Device { write, .. } => write(offset, val, size_log2),
            Backing::Ram { .. } => unreachable!("dev_write on a RAM range"),
        }
    }

    /// Device read honoring the width mask: native widths go straight
    /// through, a 64-bit access to a 32-bit device is split low half first,
    /// anything else reads as zero (legacy behavior).
    pub fn read_device(&self, offset: u64, size_log2: u8) -> u64 {
        let flags = self.devio_flags();
        if (flags >> size_log2) & 1 != 0 {
            self.dev_read(offset, size_log2) as u64
        } else if size_log2 == 3 && (flags & DEVIO_SIZE32) != 0 {
            let lo = self.dev_read(offset, 2) as u64;
            let hi = self.dev_read(offset + 4, 2) as u64;
            lo | (hi << 32)
        } else {
            log::warn!(
                "unsupported device read access: addr={:#x} width={} bits",
                self.addr + offset,
                8u32 << size_log2
            );
            0
        }
    }

    /// Device write honoring the width mask; unsupported widths are dropped.
    pub fn write_device(&self, offset: u64, val: u64, size_log2: u8) {
        let flags = self.devio_flags();
        if (flags >> size_log2) & 1 != 0 {
            self.dev_write(offset, val as u32, size_log2);
        } else if size_log2 == 3 && (flags & DEVIO_SIZE32) != 0 {
            self.dev_write(offset, (val & 0xffff_ffff) as u32, 2);
            self.dev_write(offset + 4, (val >> 32) as u32, 2);
        } else {
            log::warn!(
                "unsupported device write access: addr={:#x} width={} bits",
                self.addr + offset,
                8u32 << size_log2
            );
        }
    }
}

/// Ordered collection of non-overlapping physical ranges. Ranges are
/// registered before the first instruction executes and live as long as the
/// map; resolution is a linear scan (the range count is small).
pub struct PhysMemoryMap {
    ranges: Vec<PhysMemoryRange>,
}

impl PhysMemoryMap {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn register_ram(&mut self, addr: u64, size: u64) {
        debug_assert!(size & PG_MASK == 0, "RAM size must be page aligned");
        let pages = (size >> PG_SHIFT) as usize;
        self.ranges.push(PhysMemoryRange {
            addr,
            size,
            backing: Backing::Ram {
                mem: UnsafeCell::new(vec![0; size as usize]),
                dirty: RefCell::new(vec![0; pages.div_ceil(64)]),
            },
        });
    }

    pub fn register_device(
        &mut self,
        addr: u64,
        size: u64,
        read: DevRead,
        write: DevWrite,
        devio_flags: u32,
    ) {
        self.ranges.push(PhysMemoryRange {
            addr,
            size,
            backing: Backing::Device {
                read,
                write,
                devio_flags,
            },
        });
    }

    /// Find the range containing `paddr`.
    #[inline]
    pub fn get_range(&self, paddr: u64) -> Option<&PhysMemoryRange> {
        self.ranges
            .iter()
            .find(|r| paddr.wrapping_sub(r.addr) < r.size)
    }

    pub fn ranges(&self) -> &[PhysMemoryRange] {
        &self.ranges
    }

    /// Raw 32-bit physical read. Only RAM is accessed; anything else reads
    /// as zero (used by the page-table walker and the boot path).
    pub fn phys_read_u32(&self, paddr: u64) -> u32 {
        match self.get_range(paddr) {
            Some(r) if r.is_ram() => {
                // SAFETY: offset bounds-checked by get_range.
                unsafe { (r.ram_ptr(paddr - r.addr) as *const u32).read_unaligned() }
            }
            _ => 0,
        }
    }

    pub fn phys_read_u64(&self, paddr: u64) -> u64 {
        match self.get_range(paddr) {
            Some(r) if r.is_ram() => {
                // SAFETY: offset bounds-checked by get_range.
                unsafe { (r.ram_ptr(paddr - r.addr) as *const u64).read_unaligned() }
            }
            _ => 0,
        }
    }

    pub fn phys_write_u32(&self, paddr: u64, val: u32) {
        if let Some(r) = self.get_range(paddr) {
            if r.is_ram() {
                r.set_dirty(paddr - r.addr);
                // SAFETY: offset bounds-checked by get_range.
                unsafe { (r.ram_ptr(paddr - r.addr) as *mut u32).write_unaligned(val) }
            }
        }
    }

    pub fn phys_write_u64(&self, paddr: u64, val: u64) {
        if let Some(r) = self.get_range(paddr) {
            if r.is_ram() {
                r.set_dirty(paddr - r.addr);
                // SAFETY: offset bounds-checked by get_range.
                unsafe { (r.ram_ptr(paddr - r.addr) as *mut u64).write_unaligned(val) }
            }
        }
    }

    /// Copy host data into a RAM range. Used for BIOS/FDT injection and
    /// snapshot restore; the caller is responsible for flushing write-TLB
    /// entries that alias the region.
    pub fn write_bytes(&self, paddr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let r = self.get_range(paddr).ok_or(MemoryError::NoRange(paddr))?;
        let off = paddr - r.addr;
        if !r.is_ram() || off + data.len() as u64 > r.size {
            return Err(MemoryError::OutOfBounds(paddr));
        }
        r.set_dirty(off);
        // SAFETY: bounds checked above; source and destination cannot
        // overlap (data is host memory, the buffer is map-owned).
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), r.ram_ptr(off), data.len());
        }
        Ok(())
    }

    /// Copy a RAM range out to host memory (snapshot serialization).
    pub fn read_bytes(&self, paddr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let r = self.get_range(paddr).ok_or(MemoryError::NoRange(paddr))?;
        let off = paddr - r.addr;
        if !r.is_ram() || off + out.len() as u64 > r.size {
            return Err(MemoryError::OutOfBounds(paddr));
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(r.ram_ptr(off), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl Default for PhysMemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn ram_read_write_roundtrip() {
        let mut map = PhysMemoryMap::new();
        map.register_ram(0x8000_0000, 0x10000);

        map.phys_write_u32(0x8000_0100, 0xdead_beef);
        assert_eq!(map.phys_read_u32(0x8000_0100), 0xdead_beef);

        map.phys_write_u64(0x8000_0200, 0x0123_4567_89ab_cdef);
        assert_eq!(map.phys_read_u64(0x8000_0200), 0x0123_4567_89ab_cdef);

        // Unmapped reads are zero, writes are dropped.
        assert_eq!(map.phys_read_u64(0x9000_0000), 0);
        map.phys_write_u64(0x9000_0000, 1);
    }

    #[test]
    fn write_marks_page_dirty() {
        let mut map = PhysMemoryMap::new();
        map.register_ram(0x8000_0000, 0x10000);
        let r = map.get_range(0x8000_0000).unwrap();
        assert_eq!(r.dirty_pages()[0], 0);

        map.phys_write_u32(0x8000_1000, 1);
        let r = map.get_range(0x8000_0000).unwrap();
        assert_eq!(r.dirty_pages()[0] & (1 << 1), 1 << 1);

        r.clear_dirty();
        assert_eq!(r.dirty_pages()[0], 0);
    }

    #[test]
    fn wide_access_splits_on_32bit_device() {
        let log: Rc<RefCell<Vec<(u64, u32)>>> = Rc::new(RefCell::new(Vec::new()));
        let rlog = log.clone();
        let wlog = log.clone();

        let mut map = PhysMemoryMap::new();
        map.register_device(
            0x4000_0000,
            0x1000,
            Box::new(move |off, _| {
                rlog.borrow_mut().push((off, 0));
                (off as u32) | 1
            }),
            Box::new(move |off, val, _| {
                wlog.borrow_mut().push((off, val));
            }),
            DEVIO_SIZE32,
        );

        let r = map.get_range(0x4000_0000).unwrap();
        let v = r.read_device(0x10, 3);
        // Low half first on both reads and writes.
        assert_eq!(v & 0xffff_ffff, 0x11);
        assert_eq!(v >> 32, 0x15);
        assert_eq!(&log.borrow()[..2], &[(0x10, 0), (0x14, 0)]);

        r.write_device(0x20, 0xaaaa_bbbb_cccc_dddd, 3);
        assert_eq!(&log.borrow()[2..], &[(0x20, 0xcccc_dddd), (0x24, 0xaaaa_bbbb)]);
    }

    #[test]
    fn unsupported_width_reads_zero() {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let mut map = PhysMemoryMap::new();
        map.register_device(
            0x4000_0000,
            0x1000,
            Box::new(move |_, _| {
                h.set(h.get() + 1);
                7
            }),
            Box::new(|_, _, _| {}),
            DEVIO_SIZE32,
        );
        let r = map.get_range(0x4000_0000).unwrap();
        assert_eq!(r.read_device(0, 0), 0);
        r.write_device(0, 1, 1);
        assert_eq!(hits.get(), 0);
    }
}
