// Here reside the definitions of the rich types shared by the whole core;
// rather than have magic numbers everywhere, we opt for typed values wherever
// it is not too ridiculous. The parser then becomes the naturally messy code
// responsible for constructing said rich types.

use crate::conversions::Truncate;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Size {
    Byte = 1,
    Word = 2,
    Long = 4,
    Quad = 8,
}

impl Size {
    pub fn from<T>(&self, res: T) -> OpResult
    where
        T: Truncate<u8> + Truncate<u16> + Truncate<u32> + Truncate<u64>,
    {
        match *self {
            Self::Byte => OpResult::Byte(res.truncate()),
            Self::Word => OpResult::Word(res.truncate()),
            Self::Long => OpResult::Long(res.truncate()),
            Self::Quad => OpResult::Quad(res.truncate()),
        }
    }
    pub fn from_le_bytes(&self, slice: &[u8]) -> OpResult {
        match self {
            Size::Byte => OpResult::Byte(slice[0]),
            Size::Word => OpResult::Word(u16::from_le_bytes([slice[0], slice[1]])),
            Size::Long => {
                OpResult::Long(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
            }
            Size::Quad => OpResult::Quad(u64::from_le_bytes([
                slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
            ])),
        }
    }
    pub fn zero(&self) -> OpResult {
        self.from(0u8)
    }
    pub fn alignment_mask(&self) -> u32 {
        match *self {
            Self::Byte => 0,
            Self::Word => 1,
            Self::Long => 3,
            Self::Quad => 7,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum OpResult {
    Byte(u8),
    Word(u16),
    Long(u32),
    Quad(u64),
}

impl OpResult {
    // the value truncated to the bus width; quads keep only the low word
    pub fn inner(&self) -> u32 {
        match *self {
            Self::Byte(b) => b as u32,
            Self::Word(w) => w as u32,
            Self::Long(l) => l,
            Self::Quad(q) => q as u32,
        }
    }
    pub fn quad(&self) -> u64 {
        match *self {
            Self::Byte(b) => b as u64,
            Self::Word(w) => w as u64,
            Self::Long(l) => l as u64,
            Self::Quad(q) => q,
        }
    }
    pub fn sign_extend(&self) -> i64 {
        match *self {
            Self::Byte(b) => b as i8 as i64,
            Self::Word(w) => w as i16 as i64,
            Self::Long(l) => l as i32 as i64,
            Self::Quad(q) => q as i64,
        }
    }
    pub fn size(&self) -> Size {
        match self {
            Self::Byte(_) => Size::Byte,
            Self::Word(_) => Size::Word,
            Self::Long(_) => Size::Long,
            Self::Quad(_) => Size::Quad,
        }
    }
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut result = Vec::new();
        let value = self.quad();
        let size = self.size() as usize;
        for j in 0..size {
            result.push((value >> (8 * j)) as u8)
        }
        result
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OpResult::Byte(b) => write!(f, "{:02x}", b),
            OpResult::Word(w) => write!(f, "{:04x}", w),
            OpResult::Long(l) => write!(f, "{:08x}", l),
            OpResult::Quad(q) => write!(f, "{:016x}", q),
        }
    }
}

// The SH-4 issues two adjacent instructions in one cycle when their execution
// groups are compatible; CO never pairs, identical groups other than MT don't
// pair either.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ExecGroup {
    MT,
    EX,
    BR,
    LS,
    FE,
    CO,
}

impl ExecGroup {
    pub fn pairs_with(&self, last: ExecGroup) -> bool {
        if *self == Self::CO || last == Self::CO {
            return false;
        }
        *self != last || *self == Self::MT
    }
}

/// Exception and interrupt events, named after the architectural causes.
/// `code` is the value latched into EXPEVT/INTEVT; note that the hardware
/// reuses some code values across distinct causes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Exception {
    PowerOnReset,
    ManualReset,
    HudiReset,
    InstTlbMultiHit,
    DataTlbMultiHit,
    UserBreakBefore,
    InstAddrErr,
    InstTlbMiss,
    InstTlbProtViol,
    GenIllegalInst,
    SlotIllegalInst,
    GenFpuDisable,
    SlotFpuDisable,
    DataAddrRead,
    DataAddrWrite,
    DataTlbReadMiss,
    DataTlbWriteMiss,
    DataTlbReadProtViol,
    DataTlbWriteProtViol,
    Fpu,
    InitialPageWrite,
    UnconditionalTrap,
    UserBreakAfter,
    Nmi,
    // the fifteen codes selectable by the encoded IRL bus
    Ext(u8),
    Tuni0,
    Tuni1,
    Tuni2,
    Ticpi2,
    RtcAti,
    RtcPri,
    RtcCui,
    SciEri,
    SciRxi,
    SciTxi,
    SciTei,
    WdtIti,
    RefRcmi,
    RefRovi,
    Hudi,
    Gpio,
    Dmte0,
    Dmte1,
    Dmte2,
    Dmte3,
    Dmae,
    ScifEri,
    ScifRxi,
    ScifBri,
    ScifTxi,
}

impl Exception {
    pub fn code(&self) -> u32 {
        match *self {
            Self::PowerOnReset => 0x000,
            Self::ManualReset => 0x020,
            Self::HudiReset => 0x000,
            Self::InstTlbMultiHit => 0x140,
            Self::DataTlbMultiHit => 0x140,
            Self::UserBreakBefore => 0x1e0,
            Self::InstAddrErr => 0x0e0,
            Self::InstTlbMiss => 0x040,
            Self::InstTlbProtViol => 0x0a0,
            Self::GenIllegalInst => 0x180,
            Self::SlotIllegalInst => 0x1a0,
            Self::GenFpuDisable => 0x800,
            Self::SlotFpuDisable => 0x820,
            Self::DataAddrRead => 0x0e0,
            Self::DataAddrWrite => 0x100,
            Self::DataTlbReadMiss => 0x040,
            Self::DataTlbWriteMiss => 0x060,
            Self::DataTlbReadProtViol => 0x0a0,
            Self::DataTlbWriteProtViol => 0x0c0,
            Self::Fpu => 0x120,
            Self::InitialPageWrite => 0x080,
            Self::UnconditionalTrap => 0x160,
            Self::UserBreakAfter => 0x1e0,
            Self::Nmi => 0x1c0,
            Self::Ext(n) => 0x200 + 0x20 * n as u32,
            Self::Tuni0 => 0x400,
            Self::Tuni1 => 0x420,
            Self::Tuni2 => 0x440,
            Self::Ticpi2 => 0x460,
            Self::RtcAti => 0x480,
            Self::RtcPri => 0x4a0,
            Self::RtcCui => 0x4c0,
            Self::SciEri => 0x4e0,
            Self::SciRxi => 0x500,
            Self::SciTxi => 0x520,
            Self::SciTei => 0x540,
            Self::WdtIti => 0x560,
            Self::RefRcmi => 0x580,
            Self::RefRovi => 0x5a0,
            Self::Hudi => 0x600,
            Self::Gpio => 0x620,
            Self::Dmte0 => 0x640,
            Self::Dmte1 => 0x660,
            Self::Dmte2 => 0x680,
            Self::Dmte3 => 0x6a0,
            Self::Dmae => 0x6c0,
            Self::ScifEri => 0x700,
            Self::ScifRxi => 0x720,
            Self::ScifBri => 0x740,
            Self::ScifTxi => 0x760,
        }
    }
    pub fn is_reset(&self) -> bool {
        matches!(
            *self,
            Self::PowerOnReset
                | Self::ManualReset
                | Self::HudiReset
                | Self::InstTlbMultiHit
                | Self::DataTlbMultiHit
        )
    }
    pub fn is_interrupt(&self) -> bool {
        self.vector_offset() == 0x600
    }
    // offset from VBR of the handler; reset-type events ignore this and
    // restart at 0xa0000000
    pub fn vector_offset(&self) -> u32 {
        match *self {
            Self::PowerOnReset | Self::ManualReset | Self::HudiReset => 0,
            Self::InstTlbMultiHit | Self::DataTlbMultiHit => 0,
            Self::InstTlbMiss | Self::DataTlbReadMiss | Self::DataTlbWriteMiss => 0x400,
            Self::UserBreakBefore
            | Self::InstAddrErr
            | Self::InstTlbProtViol
            | Self::GenIllegalInst
            | Self::SlotIllegalInst
            | Self::GenFpuDisable
            | Self::SlotFpuDisable
            | Self::DataAddrRead
            | Self::DataAddrWrite
            | Self::DataTlbReadProtViol
            | Self::DataTlbWriteProtViol
            | Self::Fpu
            | Self::InitialPageWrite
            | Self::UnconditionalTrap
            | Self::UserBreakAfter => 0x100,
            _ => 0x600,
        }
    }
}

/// The sixteen interrupt lines of the on-chip controller, ordered so that
/// `IPRA + line / 4` is the priority register and `4 * (line % 4)` the
/// nibble shift within it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum IrqLine {
    Rtc = 0,
    Tmu2,
    Tmu1,
    Tmu0,
    Reserved,
    Sci1,
    Ref,
    Wdt,
    Hudi,
    Scif,
    Dmac,
    Gpio,
    Irl3,
    Irl2,
    Irl1,
    Irl0,
}

pub const IRQ_LINE_COUNT: usize = 16;

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Byte => write!(f, "b"),
            Self::Word => write!(f, "w"),
            Self::Long => write!(f, "l"),
            Self::Quad => write!(f, "d"),
        }
    }
}
