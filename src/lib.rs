pub mod clint;
pub mod cpu;
pub mod htif;
pub mod machine;
pub mod memmap;
pub mod plic;
pub mod snapshot;

pub use cpu::{CpuState, CtfInfo, Exception, Priv};
pub use machine::{Machine, MachineConfig, MachineError};
pub use snapshot::SnapshotError;
