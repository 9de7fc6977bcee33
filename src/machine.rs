use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clint::{Clint, CLINT_BASE_ADDR, CLINT_SIZE, RTC_FREQ};
use crate::cpu::core::{CoreSignals, CpuState};
use crate::cpu::types::MIP_MTIP;
use crate::htif::{Htif, HTIF_BASE_ADDR, HTIF_SIZE};
use crate::memmap::{MemoryError, PhysMemoryMap, DEVIO_SIZE32, PG_MASK};
use crate::plic::{Plic, PLIC_BASE_ADDR, PLIC_SIZE};

pub const LOW_RAM_SIZE: u64 = 0x0001_0000; // 64 KiB
pub const RAM_BASE_ADDR: u64 = 0x8000_0000;

/// The boot ROM lives inside the low RAM range; a synthesized ROM image
/// replaces its contents on snapshot restore.
pub const ROM_BASE_ADDR: u64 = 0;
pub const ROM_SIZE: u64 = LOW_RAM_SIZE;
/// Reset vector: the trampoline on a fresh boot, the first restore
/// instruction after a snapshot.
pub const BOOT_BASE_ADDR: u64 = 0x1000;

/// Offset of the FDT blob behind the reset trampoline.
const FDT_OFFSET: u64 = BOOT_BASE_ADDR + 8 * 4;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("RAM size must be a non-zero multiple of 4 KiB (got {0:#x})")]
    BadRamSize(u64),

    #[error("BIOS image of {0} bytes does not fit in RAM")]
    BiosTooBig(usize),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Host-side machine configuration, filled in by the CLI (or a test).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub ram_size: u64,
    /// Derive mtime from the wall clock instead of the cycle counter.
    pub rtc_real_time: bool,
    /// Validation event name that ends the simulation when reported.
    pub terminating_event: Option<String>,
    /// Override for the HTIF mailbox location.
    pub htif_base_addr: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 256 << 20,
            rtc_real_time: false,
            terminating_event: None,
            htif_base_addr: None,
        }
    }
}

impl MachineConfig {
    /// Small deterministic machine used across the test suite.
    pub fn for_tests() -> Self {
        Self {
            ram_size: 4 << 20,
            rtc_real_time: false,
            terminating_event: None,
            htif_base_addr: None,
        }
    }
}

/// Single-hart virt-style machine: low RAM with the reset trampoline and
/// FDT, main RAM, CLINT, PLIC and the HTIF mailbox. VirtIO and framebuffer
/// regions are outside the core; hosts may register them as opaque device
/// ranges before handing the map to the CPU.
pub struct Machine {
    pub cpu: CpuState,
    clint: Rc<RefCell<Clint>>,
    plic: Rc<RefCell<Plic>>,
    htif: Rc<RefCell<Htif>>,
    ram_size: u64,
    htif_base: u64,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        if config.ram_size == 0 || config.ram_size & PG_MASK != 0 {
            return Err(MachineError::BadRamSize(config.ram_size));
        }

        let signals = CoreSignals::new();
        let mut map = PhysMemoryMap::new();
        map.register_ram(RAM_BASE_ADDR, config.ram_size);
        map.register_ram(ROM_BASE_ADDR, LOW_RAM_SIZE);

        let clint = Rc::new(RefCell::new(Clint::new(
            config.rtc_real_time,
            signals.clone(),
        )));
        {
            let r = clint.clone();
            let w = clint.clone();
            map.register_device(
                CLINT_BASE_ADDR,
                CLINT_SIZE,
                Box::new(move |off, sz| r.borrow().read(off, sz)),
                Box::new(move |off, val, sz| w.borrow_mut().write(off, val, sz)),
                DEVIO_SIZE32,
            );
        }

        let plic = Rc::new(RefCell::new(Plic::new(signals.clone())));
        {
            let r = plic.clone();
            let w = plic.clone();
            map.register_device(
                PLIC_BASE_ADDR,
                PLIC_SIZE,
                Box::new(move |off, sz| r.borrow_mut().read(off, sz)),
                Box::new(move |off, val, sz| w.borrow_mut().write(off, val, sz)),
                DEVIO_SIZE32,
            );
        }

        let htif_base = config.htif_base_addr.unwrap_or(HTIF_BASE_ADDR);
        let htif = Rc::new(RefCell::new(Htif::new(
            Box::new(std::io::stdout()),
            signals.clone(),
        )));
        {
            let r = htif.clone();
            let w = htif.clone();
            map.register_device(
                htif_base,
                HTIF_SIZE,
                Box::new(move |off, sz| r.borrow().read(off, sz)),
                Box::new(move |off, val, sz| w.borrow_mut().write(off, val, sz)),
                DEVIO_SIZE32,
            );
        }

        let mem_map = Rc::new(map);
        let cpu = CpuState::new(mem_map, signals, config.terminating_event);

        Ok(Machine {
            cpu,
            clint,
            plic,
            htif,
            ram_size: config.ram_size,
            htif_base,
        })
    }

    /// Inject the BIOS image and an externally built FDT blob, then install
    /// the reset-vector trampoline. The trampoline loads the hart id into
    /// a0, the FDT address into a1 and jumps to the head of main RAM.
    pub fn copy_bios(&mut self, bios: &[u8], fdt: &[u8]) -> Result<(), MachineError> {
        if bios.len() as u64 > self.ram_size {
            return Err(MachineError::BiosTooBig(bios.len()));
        }
        let map = self.cpu.mem_map().clone();
        map.write_bytes(RAM_BASE_ADDR, bios)?;

        let trampoline: [u32; 8] = [
            0x0000_0297, // auipc t0, 0
            0x0202_8593, // addi  a1, t0, 32
            0xf140_2573, // csrr  a0, mhartid
            0x0182_b283, // ld    t0, 24(t0)
            0x0002_8067, // jr    t0
            0,
            RAM_BASE_ADDR as u32, // jump target, 8-byte slot
            (RAM_BASE_ADDR >> 32) as u32,
        ];
        for (i, word) in trampoline.iter().enumerate() {
            map.phys_write_u32(BOOT_BASE_ADDR + 4 * i as u64, *word);
        }
        map.write_bytes(FDT_OFFSET, fdt)?;

        // The host just mutated RAM behind the CPU's back.
        self.flush_cpu_write_aliases();
        Ok(())
    }

    /// Invalidate write-TLB entries aliasing any RAM range. Called after
    /// host-side bulk mutation (BIOS injection, snapshot restore).
    pub fn flush_cpu_write_aliases(&mut self) {
        let spans: Vec<(*const u8, usize)> = self
            .cpu
            .mem_map()
            .ranges()
            .iter()
            .filter(|r| r.is_ram())
            .map(|r| (r.ram_ptr(0) as *const u8, r.size as usize))
            .collect();
        for (ptr, len) in spans {
            self.cpu.flush_tlb_write_range(ptr, len);
        }
    }

    /// Run up to `n_cycles` interpretation steps, then refresh the timer
    /// pin. Returns the number of committed instructions.
    pub fn step(&mut self, n_cycles: u64) -> u64 {
        let executed = self.cpu.interp(n_cycles);
        self.clint.borrow().update_mtip();
        executed
    }

    /// Milliseconds the host may sleep before the next timer event, capped
    /// at `max_delay_ms`. Asserts MTIP when the compare value is already
    /// due. A running (non-power-down) hart never sleeps.
    pub fn get_sleep_duration(&mut self, max_delay_ms: i64) -> i64 {
        let mut delay = max_delay_ms;
        if self.cpu.signals().mip() & MIP_MTIP == 0 {
            let ticks = self.clint.borrow().update_mtip();
            if ticks == 0 {
                delay = 0;
            } else {
                delay = delay.min((ticks / (RTC_FREQ / 1000)) as i64);
            }
        }
        if !self.cpu.power_down() {
            delay = 0;
        }
        delay
    }

    /// Drive a PLIC input line (IRQ 1..=31) from an external device model.
    pub fn set_irq(&mut self, irq: u32, level: bool) {
        self.plic.borrow_mut().set_irq(irq, level);
    }

    /// Replace the HTIF console sink (tests, alternative frontends).
    pub fn set_console(&mut self, console: Box<dyn Write>) {
        let signals = self.cpu.signals().clone();
        let tohost = self.htif.borrow().tohost();
        let fromhost = self.htif.borrow().fromhost();
        let mut fresh = Htif::new(console, signals);
        fresh.set_tohost(tohost);
        fresh.set_fromhost(fromhost);
        *self.htif.borrow_mut() = fresh;
    }

    pub fn clint(&self) -> &Rc<RefCell<Clint>> {
        &self.clint
    }

    pub fn htif(&self) -> &Rc<RefCell<Htif>> {
        &self.htif
    }

    pub fn htif_base(&self) -> u64 {
        self.htif_base
    }

    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    pub fn terminated(&self) -> bool {
        self.cpu.terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::core::MSTATUS_MIE;

    fn machine() -> Machine {
        Machine::new(MachineConfig::for_tests()).unwrap()
    }

    #[test]
    fn rejects_unaligned_ram_size() {
        let cfg = MachineConfig {
            ram_size: 0x1234,
            ..MachineConfig::for_tests()
        };
        assert!(matches!(
            Machine::new(cfg),
            Err(MachineError::BadRamSize(_))
        ));
    }

    #[test]
    fn trampoline_installed_at_reset_vector() {
        let mut m = machine();
        let bios = [0x13u8, 0, 0, 0]; // nop
        m.copy_bios(&bios, b"\xd0\x0d\xfe\xed").unwrap();
        let map = m.cpu.mem_map();
        assert_eq!(map.phys_read_u32(BOOT_BASE_ADDR), 0x0000_0297);
        assert_eq!(map.phys_read_u32(BOOT_BASE_ADDR + 16), 0x0002_8067);
        assert_eq!(map.phys_read_u64(BOOT_BASE_ADDR + 24), RAM_BASE_ADDR);
        assert_eq!(map.phys_read_u32(RAM_BASE_ADDR), 0x13);
        // FDT blob behind the trampoline.
        assert_eq!(map.phys_read_u32(FDT_OFFSET), u32::from_le_bytes(*b"\xd0\x0d\xfe\xed"));
    }

    #[test]
    fn trampoline_reaches_main_ram() {
        let mut m = machine();
        // BIOS: addi x1, x0, 7 then an infinite loop.
        let mut bios = Vec::new();
        bios.extend_from_slice(&0x0070_0093u32.to_le_bytes());
        bios.extend_from_slice(&0x0000_0063u32.to_le_bytes()); // beq x0,x0,0
        m.copy_bios(&bios, &[]).unwrap();

        m.step(8);
        assert_eq!(m.cpu.read_reg(1), 7);
        assert_eq!(m.cpu.read_reg(10), 0); // mhartid
        assert_eq!(m.cpu.read_reg(11), FDT_OFFSET); // FDT pointer
    }

    #[test]
    fn timer_interrupt_fires_through_clint() {
        let mut m = machine();
        // Spin in place.
        m.cpu.mem_map().phys_write_u32(RAM_BASE_ADDR, 0x0000_0063); // beq x0,x0,0
        let s = &mut m.cpu;
        s.pc = RAM_BASE_ADDR;
        s.mtvec = RAM_BASE_ADDR + 0x1000;
        s.mstatus |= MSTATUS_MIE;
        s.signals().write_mie(MIP_MTIP);

        // mtimecmp = mtime + 1000 through the split 64-bit MMIO path.
        let now = m.clint.borrow().rtc_time();
        m.cpu
            .write_u64(CLINT_BASE_ADDR + crate::clint::MTIMECMP_OFFSET, now + 1000)
            .unwrap();
        assert_eq!(m.cpu.signals().mip() & MIP_MTIP, 0);
        assert_eq!(m.clint.borrow().timecmp(), now + 1000);

        // 1000 RTC ticks is 16000 cycles in cycle-derived mode.
        m.step(16_100);
        assert_ne!(m.cpu.signals().mip() & MIP_MTIP, 0);

        m.step(1);
        assert_eq!(m.cpu.mcause, (1 << 63) | 7);
        assert_eq!(m.cpu.pc, RAM_BASE_ADDR + 0x1000);
    }

    #[test]
    fn htif_console_through_store_path() {
        use std::cell::RefCell;

        struct SharedSink(Rc<RefCell<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut m = machine();
        let out = Rc::new(RefCell::new(Vec::new()));
        m.set_console(Box::new(SharedSink(out.clone())));

        // A 64-bit guest store splits into two 32-bit device writes, low
        // half first, so the command decodes once the high half lands.
        m.cpu
            .write_u64(HTIF_BASE_ADDR, 0x0101_0000_0000_0041)
            .unwrap();
        assert_eq!(out.borrow().as_slice(), b"A");
        assert_eq!(m.htif.borrow().tohost(), 0);
        assert_eq!(m.htif.borrow().fromhost(), 0x0101_0000_0000_0000);
    }

    #[test]
    fn plic_external_interrupt_reaches_mip() {
        let mut m = machine();
        m.set_irq(5, true);
        assert_ne!(m.cpu.signals().mip() & crate::cpu::types::MIP_SEIP, 0);
        // Guest claims via MMIO.
        let claim = m.cpu.read_u32(PLIC_BASE_ADDR + 0x20_0004).unwrap();
        assert_eq!(claim, 5);
        assert_eq!(m.cpu.signals().mip() & crate::cpu::types::MIP_SEIP, 0);
    }

    #[test]
    fn sleep_duration_follows_timecmp() {
        let mut m = machine();
        m.cpu.signals().set_power_down(true);
        let now = m.clint.borrow().rtc_time();
        m.clint.borrow_mut().set_timecmp(now + RTC_FREQ); // one second out
        let d = m.get_sleep_duration(10_000);
        assert!(d > 0 && d <= 1000);

        // Due timer: MTIP asserted, no sleeping.
        m.clint.borrow_mut().set_timecmp(0);
        assert_eq!(m.get_sleep_duration(10_000), 0);
        assert_ne!(m.cpu.signals().mip() & MIP_MTIP, 0);
    }
}
