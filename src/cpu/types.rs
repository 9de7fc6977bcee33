use serde::{Deserialize, Serialize};

/// Privilege level of the hart. Hypervisor (encoding 2) is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priv {
    User,
    Supervisor,
    Machine,
}

impl Priv {
    /// Encode into the MPP/SPP field encoding.
    pub fn to_bits(self) -> u64 {
        match self {
            Priv::User => 0b00,
            Priv::Supervisor => 0b01,
            Priv::Machine => 0b11,
        }
    }

    /// Decode an MPP/SPP field. 0b10 is reserved; coerce to Machine (WARL).
    pub fn from_bits(bits: u64) -> Priv {
        match bits & 0b11 {
            0b00 => Priv::User,
            0b01 => Priv::Supervisor,
            _ => Priv::Machine,
        }
    }

    /// Numeric level used in CSR privilege gating (U=0, S=1, M=3).
    pub fn level(self) -> u32 {
        match self {
            Priv::User => 0,
            Priv::Supervisor => 1,
            Priv::Machine => 3,
        }
    }

    /// Single-letter form used by the snapshot sidecar.
    pub fn letter(self) -> char {
        match self {
            Priv::User => 'U',
            Priv::Supervisor => 'S',
            Priv::Machine => 'M',
        }
    }

    pub fn from_letter(c: char) -> Option<Priv> {
        match c {
            'U' => Some(Priv::User),
            'S' => Some(Priv::Supervisor),
            'M' => Some(Priv::Machine),
            _ => None,
        }
    }
}

/// Architectural exception, carrying the trap value where one is defined.
///
/// This is the error channel of every memory, translation and CSR path; the
/// trap machine turns it into an mcause/scause + tval pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exception {
    MisalignedFetch(u64),
    FetchFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    MisalignedLoad(u64),
    LoadFault(u64),
    MisalignedStore(u64),
    StoreFault(u64),
    EcallFromU,
    EcallFromS,
    EcallFromM,
    FetchPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),
}

impl Exception {
    pub fn cause(&self) -> u32 {
        match self {
            Exception::MisalignedFetch(_) => 0,
            Exception::FetchFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint(_) => 3,
            Exception::MisalignedLoad(_) => 4,
            Exception::LoadFault(_) => 5,
            Exception::MisalignedStore(_) => 6,
            Exception::StoreFault(_) => 7,
            Exception::EcallFromU => 8,
            Exception::EcallFromS => 9,
            Exception::EcallFromM => 11,
            Exception::FetchPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StorePageFault(_) => 15,
        }
    }

    pub fn tval(&self) -> u64 {
        match *self {
            Exception::MisalignedFetch(a)
            | Exception::FetchFault(a)
            | Exception::IllegalInstruction(a)
            | Exception::Breakpoint(a)
            | Exception::MisalignedLoad(a)
            | Exception::LoadFault(a)
            | Exception::MisalignedStore(a)
            | Exception::StoreFault(a)
            | Exception::FetchPageFault(a)
            | Exception::LoadPageFault(a)
            | Exception::StorePageFault(a) => a,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Exception {}

/// Kind of memory access, selecting the TLB and the permission bit checked
/// by the page-table walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Code,
}

/// Control-flow info record emitted per retired instruction for an external
/// cosimulation checker. The JALR variants encode the return-address-stack
/// hint derived from the link-register heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtfInfo {
    None,
    Nop,
    TakenBranch,
    UntakenBranch,
    TakenJump,
    TakenJalr,
    TakenJalrPop,
    TakenJalrPush,
    TakenJalrPushPop,
}

impl CtfInfo {
    /// Hint for a taken JALR: rd in {1,5} is a push, rs1 in {1,5} is a pop,
    /// both with rs1 == rd is a push only.
    pub fn jalr_hint(rd: u8, rs1: u8) -> CtfInfo {
        let rd_link = rd == 1 || rd == 5;
        let rs1_link = rs1 == 1 || rs1 == 5;
        match (rd_link, rs1_link) {
            (false, false) => CtfInfo::TakenJalr,
            (false, true) => CtfInfo::TakenJalrPop,
            (true, false) => CtfInfo::TakenJalrPush,
            (true, true) => {
                if rs1 == rd {
                    CtfInfo::TakenJalrPush
                } else {
                    CtfInfo::TakenJalrPushPop
                }
            }
        }
    }
}

// Interrupt bit positions in mip/mie.
pub const MIP_SSIP: u32 = 1 << 1;
pub const MIP_MSIP: u32 = 1 << 3;
pub const MIP_STIP: u32 = 1 << 5;
pub const MIP_MTIP: u32 = 1 << 7;
pub const MIP_SEIP: u32 = 1 << 9;
pub const MIP_MEIP: u32 = 1 << 11;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priv_roundtrip() {
        for p in [Priv::User, Priv::Supervisor, Priv::Machine] {
            assert_eq!(Priv::from_bits(p.to_bits()), p);
            assert_eq!(Priv::from_letter(p.letter()), Some(p));
        }
        // Reserved encoding coerces to Machine.
        assert_eq!(Priv::from_bits(0b10), Priv::Machine);
    }

    #[test]
    fn exception_causes_match_priv_spec() {
        assert_eq!(Exception::MisalignedLoad(0).cause(), 4);
        assert_eq!(Exception::EcallFromM.cause(), 11);
        assert_eq!(Exception::StorePageFault(0).cause(), 15);
        assert_eq!(Exception::LoadPageFault(0x1000).tval(), 0x1000);
        assert_eq!(Exception::EcallFromU.tval(), 0);
    }

    #[test]
    fn jalr_hints() {
        assert_eq!(CtfInfo::jalr_hint(0, 3), CtfInfo::TakenJalr);
        assert_eq!(CtfInfo::jalr_hint(0, 1), CtfInfo::TakenJalrPop);
        assert_eq!(CtfInfo::jalr_hint(1, 3), CtfInfo::TakenJalrPush);
        assert_eq!(CtfInfo::jalr_hint(1, 5), CtfInfo::TakenJalrPushPop);
        // Same link register on both sides is a push only.
        assert_eq!(CtfInfo::jalr_hint(5, 5), CtfInfo::TakenJalrPush);
    }
}
