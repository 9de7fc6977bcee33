use std::fmt::Write as _;
use std::fs;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::clint::{CLINT_BASE_ADDR, MTIMECMP_OFFSET, MTIME_OFFSET, RTC_FREQ_DIV};
use crate::cpu::types::Priv;
use crate::machine::{Machine, BOOT_BASE_ADDR, RAM_BASE_ADDR, ROM_BASE_ADDR, ROM_SIZE};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot checkpoint while PC is inside the boot ROM (pc={0:#x})")]
    PcInsideRom(u64),

    #[error("boot ROM exhausted (code_pos={0}, data_pos={1})")]
    RomOverflow(usize, usize),

    #[error("{file} does not match the digest recorded at snapshot time")]
    DigestMismatch { file: String },

    #[error("{file}: {got} bytes does not match memory size {want}")]
    SizeMismatch { file: String, got: usize, want: usize },

    #[error("boot or main RAM range missing from the memory map")]
    MissingRange,
}

impl SnapshotError {
    /// Process exit code the runner reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            SnapshotError::PcInsideRom(_) => -4,
            SnapshotError::RomOverflow(..) => -6,
            _ => -3,
        }
    }
}

// 32-bit instruction builders for the restore ROM.

fn create_csrrw(rs: u32, csrn: u32) -> u32 {
    0x1073 | ((csrn & 0xfff) << 20) | ((rs & 0x1f) << 15)
}

fn create_csrrs(rd: u32, csrn: u32) -> u32 {
    0x2073 | ((csrn & 0xfff) << 20) | ((rd & 0x1f) << 7)
}

fn create_auipc(rd: u32, mut addr: u32) -> u32 {
    // Compensate the sign extension of the following addi.
    if addr & 0x800 != 0 {
        addr += 0x800;
    }
    0x17 | ((rd & 0x1f) << 7) | ((addr >> 12) << 12)
}

fn create_addi(rd: u32, addr: u32) -> u32 {
    0x13 | ((rd & 0x1f) << 7) | ((rd & 0x1f) << 15) | ((addr & 0xfff) << 20)
}

fn create_seti(rd: u32, data: u32) -> u32 {
    0x13 | ((rd & 0x1f) << 7) | ((data & 0xfff) << 20)
}

fn create_ld(rd: u32, rs1: u32) -> u32 {
    0x3 | ((rd & 0x1f) << 7) | (3 << 12) | ((rs1 & 0x1f) << 15)
}

fn create_sd(rs1: u32, rs2: u32) -> u32 {
    0x23 | ((rs2 & 0x1f) << 20) | (3 << 12) | ((rs1 & 0x1f) << 15)
}

fn create_fld(rd: u32, rs1: u32) -> u32 {
    0x7 | ((rd & 0x1f) << 7) | (3 << 12) | ((rs1 & 0x1f) << 15)
}

/// Restore-ROM under construction: machine code growing from
/// `BOOT_BASE_ADDR`, a 64-bit constant pool growing from the upper half of
/// the ROM region.
struct RomBuilder {
    rom: Vec<u32>,
    code_pos: usize,
    data_pos: usize,
    data_pos_start: usize,
}

impl RomBuilder {
    fn new() -> Self {
        let data_pos = (ROM_SIZE / 2 / 4) as usize;
        Self {
            rom: vec![0u32; (ROM_SIZE / 4) as usize],
            code_pos: ((BOOT_BASE_ADDR - ROM_BASE_ADDR) / 4) as usize,
            data_pos,
            data_pos_start: data_pos,
        }
    }

    fn push(&mut self, insn: u32) {
        if self.code_pos < self.rom.len() {
            self.rom[self.code_pos] = insn;
        }
        self.code_pos += 1;
    }

    fn push_data(&mut self, val: u64) -> u32 {
        let off = 4 * (self.data_pos as u32).wrapping_sub(self.code_pos as u32);
        if self.data_pos + 1 < self.rom.len() {
            self.rom[self.data_pos] = val as u32;
            self.rom[self.data_pos + 1] = (val >> 32) as u32;
        }
        self.data_pos += 2;
        off
    }

    /// csrrw a 12-bit immediate value into `csrn`, clobbering x1.
    fn csr12(&mut self, csrn: u32, val: u16) {
        self.push(create_seti(1, val as u32));
        self.push(create_csrrw(1, csrn));
    }

    /// Load a 64-bit constant from the pool and csrrw it, clobbering x1.
    fn csr64(&mut self, csrn: u32, val: u64) {
        let off = self.data_off_for_triplet();
        self.push(create_auipc(1, off));
        self.push(create_addi(1, off));
        self.push(create_ld(1, 1));
        self.push(create_csrrw(1, csrn));
        self.push_data(val);
    }

    /// Load a 64-bit constant into integer register `rn`.
    fn reg(&mut self, rn: u32, val: u64) {
        let off = self.data_off_for_triplet();
        self.push(create_auipc(rn, off));
        self.push(create_addi(rn, off));
        self.push(create_ld(rn, rn));
        self.push_data(val);
    }

    /// Load a 64-bit constant into FP register `rn` through x1.
    fn fp_reg(&mut self, rn: u32, val: u64) {
        let off = self.data_off_for_triplet();
        self.push(create_auipc(1, off));
        self.push(create_addi(1, off));
        self.push(create_fld(rn, 1));
        self.push_data(val);
    }

    /// `*(u64 *)addr = val`, clobbering x1 and x2.
    fn io64(&mut self, addr: u64, val: u64) {
        let off = self.data_off_for_triplet();
        self.push(create_auipc(1, off));
        self.push(create_addi(1, off));
        self.push(create_ld(1, 1));
        self.push_data(addr);

        let off2 = self.data_off_for_triplet();
        self.push(create_auipc(2, off2));
        self.push(create_addi(2, off2));
        self.push(create_ld(2, 2));
        self.push(create_sd(1, 2));
        self.push_data(val);
    }

    /// PC-relative offset from the next auipc to the next data slot,
    /// assuming the standard auipc/addi/ld triplet.
    fn data_off_for_triplet(&self) -> u32 {
        4 * (self.data_pos as u32).wrapping_sub(self.code_pos as u32)
    }

    fn finish(self) -> Result<Vec<u8>, SnapshotError> {
        if self.data_pos >= self.rom.len() || self.code_pos >= self.data_pos_start {
            return Err(SnapshotError::RomOverflow(self.code_pos, self.data_pos));
        }
        let mut out = Vec::with_capacity(self.rom.len() * 4);
        for w in &self.rom {
            out.extend_from_slice(&w.to_le_bytes());
        }
        Ok(out)
    }
}

/// Synthesize the self-restoring boot ROM for the current machine state:
/// a stream of CSR/register recoveries executed at reset, ending in `dret`
/// to the saved PC at the saved privilege.
fn create_boot_rom(m: &Machine) -> Result<Vec<u8>, SnapshotError> {
    let s = &m.cpu;
    let mut rom = RomBuilder::new();

    rom.csr64(0x7b1, s.pc); // dpc

    // dcsr: stopcount | stoptime plus the privilege dret returns to.
    let prv = match s.priv_level() {
        Priv::User => 0,
        Priv::Supervisor => 1,
        Priv::Machine => 3,
    };
    rom.csr12(0x7b0, 0x600 | prv);

    // mstatus and misa first: later recoveries (fflags, satp) depend on
    // the FS field and the MMU configuration they establish.
    rom.csr64(0x300, s.get_mstatus(!0));
    rom.csr64(
        0x301,
        s.misa as u64 | ((s.mxl as u64) << (s.cur_xlen - 2)),
    );

    if s.fs != 0 {
        // FP state is only recoverable while the FPU is on.
        rom.csr12(0x001, s.fflags as u16);
        rom.csr12(0x002, s.frm as u16);
        rom.csr12(0x003, (s.fflags | ((s.frm as u32) << 5)) as u16);
        for i in 0..32 {
            rom.fp_reg(i, s.fp_reg[i as usize]);
        }
    }

    for i in 3..32 {
        rom.csr12(0xb00 + i, 0); // reset mhpmcounter3..31
        rom.csr64(0x320 + i, s.mhpmevent[i as usize]);
    }
    rom.csr64(0x7a0, s.tselect as u64);

    rom.csr64(0x302, s.medeleg as u64);
    rom.csr64(0x303, s.mideleg as u64);
    rom.csr64(0x304, s.signals().mie() as u64);
    rom.csr64(0x305, s.mtvec);
    rom.csr64(0x105, s.stvec);
    rom.csr12(0x306, s.mcounteren as u16);
    rom.csr12(0x106, s.scounteren as u16);

    rom.csr64(0x340, s.mscratch);
    rom.csr64(0x341, s.mepc);
    rom.csr64(0x342, s.mcause);
    rom.csr64(0x343, s.mtval);

    rom.csr64(0x140, s.sscratch);
    rom.csr64(0x141, s.sepc);
    rom.csr64(0x142, s.scause);
    rom.csr64(0x143, s.stval);

    rom.csr64(0x344, s.signals().mip() as u64);

    for i in 3..32 {
        rom.reg(i, s.reg[i as usize]);
    }

    // CLINT state close to the end to minimize the drift the recovery
    // itself introduces.
    let timecmp = m.clint().borrow().timecmp();
    log::info!(
        "clint hart0 timecmp={} cycles ({})",
        timecmp,
        s.cycles() / RTC_FREQ_DIV
    );
    rom.io64(CLINT_BASE_ADDR + MTIMECMP_OFFSET, timecmp);

    rom.csr64(0xb02, s.minstret);
    rom.csr64(0xb00, s.mcycle);

    rom.io64(CLINT_BASE_ADDR + MTIME_OFFSET, s.mcycle / RTC_FREQ_DIV);

    for i in 1..3 {
        rom.reg(i, s.reg[i as usize]);
    }

    // satp last: it changes the address map. x1 survives in dscratch.
    rom.push(create_csrrw(1, 0x7b2));
    rom.csr64(0x180, s.satp);
    rom.push(create_csrrs(1, 0x7b2));

    rom.push(0x7b20_0073); // dret

    rom.finish()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    let digest = h.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Dump CPU+RAM state: `<prefix>.re_regs` text sidecar, `<prefix>.mainram`
/// and `<prefix>.bootram` raw images. The bootram image is either the
/// current low-RAM contents (checkpoint at the reset vector) or a freshly
/// synthesized restore ROM.
pub fn serialize(m: &Machine, prefix: &str) -> Result<(), SnapshotError> {
    let s = &m.cpu;
    let map = s.mem_map();

    let mut side = String::new();
    let _ = writeln!(side, "# riscv-sim serialization file");
    let _ = writeln!(side, "pc:0x{:x}", s.pc);
    for i in 1..32 {
        let _ = writeln!(side, "reg_x{}:{:x}", i, s.reg[i]);
    }
    for i in 0..32 {
        let _ = writeln!(side, "reg_f{}:{:x}", i, s.fp_reg[i]);
    }
    let _ = writeln!(side, "fflags:{:x}", s.fflags);
    let _ = writeln!(side, "frm:{:x}", s.frm);
    let _ = writeln!(side, "priv:{}", s.priv_level().letter());
    let _ = writeln!(side, "insn_counter:{}", s.insn_counter());

    let _ = writeln!(side, "mstatus:{:x}", s.mstatus);
    let _ = writeln!(side, "mtvec:{:x}", s.mtvec);
    let _ = writeln!(side, "mscratch:{:x}", s.mscratch);
    let _ = writeln!(side, "mepc:{:x}", s.mepc);
    let _ = writeln!(side, "mcause:{:x}", s.mcause);
    let _ = writeln!(side, "mtval:{:x}", s.mtval);

    let _ = writeln!(side, "misa:{}", s.misa);
    let _ = writeln!(side, "mie:{}", s.signals().mie());
    let _ = writeln!(side, "mip:{}", s.signals().mip());
    let _ = writeln!(side, "medeleg:{}", s.medeleg);
    let _ = writeln!(side, "mideleg:{}", s.mideleg);
    let _ = writeln!(side, "mcounteren:{}", s.mcounteren);
    let _ = writeln!(side, "tselect:{}", s.tselect);

    let _ = writeln!(side, "stvec:{:x}", s.stvec);
    let _ = writeln!(side, "sscratch:{:x}", s.sscratch);
    let _ = writeln!(side, "sepc:{:x}", s.sepc);
    let _ = writeln!(side, "scause:{:x}", s.scause);
    let _ = writeln!(side, "stval:{:x}", s.stval);
    let _ = writeln!(side, "satp:{:x}", s.satp);
    let _ = writeln!(side, "scounteren:{:x}", s.scounteren);

    let ranges = map.ranges();
    for (i, r) in ranges.iter().enumerate().rev() {
        let _ = writeln!(
            side,
            "mrange{}:0x{:x} 0x{:x} {}",
            i,
            r.addr,
            r.size,
            if r.is_ram() { "ram" } else { "io" }
        );
    }

    let main = ranges
        .iter()
        .find(|r| r.is_ram() && r.addr == RAM_BASE_ADDR)
        .ok_or(SnapshotError::MissingRange)?;
    let boot = ranges
        .iter()
        .find(|r| r.is_ram() && r.addr == ROM_BASE_ADDR)
        .ok_or(SnapshotError::MissingRange)?;

    let mut main_image = vec![0u8; main.size as usize];
    map.read_bytes(main.addr, &mut main_image)
        .map_err(|_| SnapshotError::MissingRange)?;
    fs::write(format!("{}.mainram", prefix), &main_image)?;

    let boot_image = if s.priv_level() != Priv::Machine || ROM_BASE_ADDR + ROM_SIZE < s.pc {
        log::info!("creating a new boot rom");
        create_boot_rom(m)?
    } else if BOOT_BASE_ADDR < s.pc {
        return Err(SnapshotError::PcInsideRom(s.pc));
    } else if s.pc == BOOT_BASE_ADDR {
        log::info!("reusing the current boot rom");
        let mut image = vec![0u8; boot.size as usize];
        map.read_bytes(boot.addr, &mut image)
            .map_err(|_| SnapshotError::MissingRange)?;
        image
    } else {
        return Err(SnapshotError::PcInsideRom(s.pc));
    };
    fs::write(format!("{}.bootram", prefix), &boot_image)?;

    let _ = writeln!(side, "# sha256 mainram:{}", sha256_hex(&main_image));
    let _ = writeln!(side, "# sha256 bootram:{}", sha256_hex(&boot_image));
    fs::write(format!("{}.re_regs", prefix), side)?;

    Ok(())
}

fn recorded_digest(sidecar: &str, which: &str) -> Option<String> {
    let tag = format!("# sha256 {}:", which);
    sidecar
        .lines()
        .find_map(|l| l.strip_prefix(&tag).map(|h| h.trim().to_string()))
}

fn load_ram_image(
    m: &Machine,
    base: u64,
    file: &str,
    digest: Option<String>,
) -> Result<(), SnapshotError> {
    let data = fs::read(file)?;
    let range = m
        .cpu
        .mem_map()
        .get_range(base)
        .ok_or(SnapshotError::MissingRange)?;
    if data.len() != range.size as usize {
        return Err(SnapshotError::SizeMismatch {
            file: file.to_string(),
            got: data.len(),
            want: range.size as usize,
        });
    }
    if let Some(want) = digest {
        if sha256_hex(&data) != want {
            return Err(SnapshotError::DigestMismatch { file: file.to_string() });
        }
    }
    m.cpu
        .mem_map()
        .write_bytes(base, &data)
        .map_err(|_| SnapshotError::MissingRange)?;
    Ok(())
}

/// Load a snapshot back into a freshly constructed machine. The CPU state
/// itself is restored by the boot ROM when execution resumes at the reset
/// vector.
pub fn deserialize(m: &mut Machine, prefix: &str) -> Result<(), SnapshotError> {
    let sidecar = fs::read_to_string(format!("{}.re_regs", prefix)).unwrap_or_default();

    load_ram_image(
        m,
        ROM_BASE_ADDR,
        &format!("{}.bootram", prefix),
        recorded_digest(&sidecar, "bootram"),
    )?;
    load_ram_image(
        m,
        RAM_BASE_ADDR,
        &format!("{}.mainram", prefix),
        recorded_digest(&sidecar, "mainram"),
    )?;

    m.flush_cpu_write_aliases();
    m.cpu.pc = BOOT_BASE_ADDR;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineConfig;

    fn machine() -> Machine {
        Machine::new(MachineConfig::for_tests()).unwrap()
    }

    fn temp_prefix(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!(
            "riscv-sim-test-{}-{}",
            tag,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir.join("dump").to_string_lossy().into_owned()
    }

    #[test]
    fn roundtrip_restores_cpu_and_ram() {
        let mut m = machine();
        let program: [u32; 3] = [
            0x0070_0093, // addi x1, x0, 7
            0xffd0_8113, // addi x2, x1, -3
            0x1050_0073, // wfi
        ];
        for (i, insn) in program.iter().enumerate() {
            m.cpu
                .mem_map()
                .phys_write_u32(RAM_BASE_ADDR + 4 * i as u64, *insn);
        }
        m.cpu.pc = RAM_BASE_ADDR;
        assert_eq!(m.step(2), 2);
        m.cpu.set_reg(20, 0xdead_beef_0123_4567);
        m.cpu.sscratch = 0x5555;
        m.cpu.mtvec = RAM_BASE_ADDR + 0x2000;
        let saved_pc = m.cpu.pc;
        let saved_minstret = m.cpu.minstret();

        let prefix = temp_prefix("roundtrip");
        serialize(&m, &prefix).unwrap();

        let mut r = machine();
        deserialize(&mut r, &prefix).unwrap();
        // RAM came back bit-exact.
        assert_eq!(r.cpu.mem_map().phys_read_u32(RAM_BASE_ADDR), program[0]);

        // The restore ROM rebuilds the architectural state, dret lands on
        // the saved PC and the wfi there retires exactly one instruction.
        r.step(5000);
        assert!(r.cpu.power_down());
        assert_eq!(r.cpu.pc, saved_pc + 4);
        assert_eq!(r.cpu.read_reg(1), 7);
        assert_eq!(r.cpu.read_reg(2), 4);
        assert_eq!(r.cpu.read_reg(20), 0xdead_beef_0123_4567);
        assert_eq!(r.cpu.sscratch, 0x5555);
        assert_eq!(r.cpu.mtvec, RAM_BASE_ADDR + 0x2000);
        assert_eq!(r.cpu.minstret(), saved_minstret + 1);
        assert_eq!(r.cpu.priv_level(), Priv::Machine);
    }

    #[test]
    fn checkpoint_inside_rom_is_refused() {
        let mut m = machine();
        m.cpu.pc = BOOT_BASE_ADDR + 8;
        let prefix = temp_prefix("inrom");
        let err = serialize(&m, &prefix).unwrap_err();
        assert!(matches!(err, SnapshotError::PcInsideRom(_)));
        assert_eq!(err.exit_code(), -4);
    }

    #[test]
    fn checkpoint_at_reset_vector_reuses_rom() {
        let m = machine();
        // Fresh machine: pc == BOOT_BASE_ADDR, priv == M.
        let prefix = temp_prefix("atreset");
        serialize(&m, &prefix).unwrap();
        let boot = fs::read(format!("{}.bootram", prefix)).unwrap();
        assert_eq!(boot.len() as u64, ROM_SIZE);
    }

    #[test]
    fn sidecar_lists_registers_and_ranges() {
        let mut m = machine();
        m.cpu.pc = RAM_BASE_ADDR;
        m.cpu.set_reg(1, 0xabc);
        let prefix = temp_prefix("sidecar");
        serialize(&m, &prefix).unwrap();
        let side = fs::read_to_string(format!("{}.re_regs", prefix)).unwrap();
        assert!(side.contains(&format!("pc:0x{:x}", RAM_BASE_ADDR)));
        assert!(side.contains("reg_x1:abc"));
        assert!(side.contains("priv:M"));
        assert!(side.contains("mrange0:0x80000000"));
        assert!(side.contains("# sha256 mainram:"));
    }

    #[test]
    fn corrupted_image_fails_digest_check() {
        let mut m = machine();
        m.cpu.pc = RAM_BASE_ADDR;
        let prefix = temp_prefix("digest");
        serialize(&m, &prefix).unwrap();

        // Flip one byte of the main RAM image.
        let file = format!("{}.mainram", prefix);
        let mut data = fs::read(&file).unwrap();
        data[0] ^= 0xff;
        fs::write(&file, &data).unwrap();

        let mut r = machine();
        let err = deserialize(&mut r, &prefix).unwrap_err();
        assert!(matches!(err, SnapshotError::DigestMismatch { .. }));
        assert_eq!(err.exit_code(), -3);
    }
}
