use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use goblin::elf::{program_header::PT_LOAD, Elf};

use riscv_sim::machine::{Machine, MachineConfig};
use riscv_sim::snapshot;

#[derive(Parser, Debug)]
#[command(author, version, about = "Full-system RV64IMAFDC simulator")]
struct Args {
    /// BIOS/kernel image to load (ELF or raw binary at the head of RAM)
    #[arg(long, required_unless_present = "restore")]
    bios: Option<PathBuf>,

    /// FDT blob to place behind the reset trampoline
    #[arg(long)]
    fdt: Option<PathBuf>,

    /// RAM size in MiB
    #[arg(long, default_value_t = 256)]
    ram_mib: u64,

    /// Derive mtime from the wall clock instead of the cycle counter
    #[arg(long)]
    rtc_real_time: bool,

    /// Validation event that terminates the run (e.g. "linux-boot")
    #[arg(long)]
    terminating_event: Option<String>,

    /// Restore a snapshot (prefix of the .re_regs/.mainram/.bootram files)
    #[arg(long)]
    restore: Option<String>,

    /// Dump a snapshot under this prefix when the run ends
    #[arg(long)]
    save: Option<String>,

    /// Stop after this many committed instructions
    #[arg(long)]
    maxinsn: Option<u64>,

    /// Interpretation batch size between device polls
    #[arg(long, default_value_t = 500_000)]
    batch: u64,
}

/// Load an ELF image into guest RAM by physical segment address, falling
/// back to the virtual address for images without paddr info.
fn load_elf(machine: &Machine, buffer: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let elf = Elf::parse(buffer)?;
    let map = machine.cpu.mem_map();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        let target = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        let file_range = ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize;
        let data = buffer
            .get(file_range)
            .ok_or("ELF segment exceeds file bounds")?;
        map.write_bytes(target, data)?;
        log::info!(
            "loaded segment {:#x}..{:#x}",
            target,
            target + ph.p_memsz
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = MachineConfig {
        ram_size: args.ram_mib << 20,
        rtc_real_time: args.rtc_real_time,
        terminating_event: args.terminating_event.clone(),
        htif_base_addr: None,
    };
    let mut machine = Machine::new(config)?;

    if let Some(prefix) = &args.restore {
        if let Err(e) = snapshot::deserialize(&mut machine, prefix) {
            eprintln!("restore failed: {}", e);
            std::process::exit(e.exit_code());
        }
        log::info!("restored snapshot {}", prefix);
    } else {
        let bios_path = args.bios.as_ref().expect("clap enforces bios|restore");
        let bios = fs::read(bios_path)?;
        let fdt = match &args.fdt {
            Some(p) => fs::read(p)?,
            None => Vec::new(),
        };
        if bios.starts_with(b"\x7fELF") {
            machine.copy_bios(&[], &fdt)?;
            load_elf(&machine, &bios)?;
            machine.flush_cpu_write_aliases();
        } else {
            machine.copy_bios(&bios, &fdt)?;
        }
    }

    loop {
        machine.step(args.batch);

        if machine.terminated() {
            log::info!(
                "simulation terminated after {} instructions",
                machine.cpu.insn_counter()
            );
            break;
        }
        if let Some(max) = args.maxinsn {
            if machine.cpu.insn_counter() >= max {
                log::info!("instruction limit {} reached", max);
                break;
            }
        }
        if machine.cpu.power_down() {
            let delay = machine.get_sleep_duration(10);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay.min(10) as u64));
            }
        }
    }

    if let Some(prefix) = &args.save {
        if let Err(e) = snapshot::serialize(&machine, prefix) {
            eprintln!("snapshot failed: {}", e);
            std::process::exit(e.exit_code());
        }
        log::info!("snapshot written under {}", prefix);
    }

    Ok(())
}
