use crate::devices::*;
use crate::memory::{BiosRom, Bus, FlashRom, MemRegion, Ram, Shared};
use crate::scheduler::Scheduler;
use crate::{BootMode, Configuration};
use std::cell::RefCell;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

// Physical memory layout (29-bit space, area 0 / 3 / 4)
//
//   $00000000.L   boot ROM, 2 MiB
//   $00200000.L   flash ROM, 128 KiB, persisted when writable
//   $005F6800.L   system block (incl. ISTNRM/ISTEXT/ISTERR + level masks)
//   $005F6C00.L   maple bus registers
//   $005F7000.L   GD-ROM drive registers
//   $005F7400.L   G1 bus registers
//   $005F7800.L   G2 bus registers
//   $005F7C00.L   PVR2 DMA registers
//   $005F8000.L   PVR2 core registers (SPG raster timing, FB_R_CTRL)
//   $00600000.L   modem
//   $00700000.L   AICA channel/DSP registers
//   $00710000.L   AICA real-time clock
//   $00800000.L   AICA wave memory, 2 MiB
//   $0C000000.L   main RAM, 16 MiB, mirrored four times through area 3
//   $10000000.L   TA polygon FIFO (mirror at $13000000)
//   $10800000.L   64-bit texture bus (mirror at $11800000)
//   $11000000.L   32-bit texture bus

pub const ADDR_AREA0_MASK: u32 = 0x01ffffff;
pub const ADDR_AREA3_MASK: u32 = 0x00ffffff;

pub const RAM_SIZE: usize = 0x0100_0000;
pub const BIOS_SIZE: usize = 0x0020_0000;
pub const FLASH_SIZE: usize = 0x0002_0000;
pub const AICA_WAVE_SIZE: usize = 0x0020_0000;

// guest-visible load addresses used by the direct boot path
pub const ADDR_SYSCALLS: u32 = 0x8c000000;
pub const ADDR_IP_BIN: u32 = 0x8c008000;
pub const ADDR_BOOTSTRAP: u32 = 0x8c008300;
pub const ADDR_1ST_READ_BIN: u32 = 0x8c010000;
pub const DIRECT_BOOT_STACK: u32 = 0x8c00f400;

/// A stock NTSC console: boot ROM and flash from disk images.
pub fn console(bios_path: &PathBuf, flash_path: Option<&PathBuf>) -> io::Result<Configuration> {
    let bios = BiosRom::load(bios_path)?;
    let flash = match flash_path {
        Some(path) => FlashRom::load(path)?,
        None => FlashRom::empty(FLASH_SIZE),
    };
    Ok(assemble(bios, flash))
}

/// A console with blank ROMs; programs are poked straight into RAM or the
/// ROM image. This is what the self-tests run on.
pub fn bare_console() -> Configuration {
    assemble(BiosRom::empty(BIOS_SIZE), FlashRom::empty(FLASH_SIZE))
}

fn assemble(bios: Box<BiosRom>, flash: crate::memory::FlashPtr) -> Configuration {
    let sched = Rc::new(RefCell::new(Scheduler::new()));
    let holly = HollyIntc::new();
    let sysblock = SysBlock::new(Rc::clone(&holly), Rc::clone(&sched));
    let spg = Spg::new(Rc::clone(&sched), Rc::clone(&holly));
    let ta_fifo = TaFifo::new();
    let texmem = TexMem::new();

    let mut bus = Bus::new();
    // main RAM leads the scan order; it is by far the hottest region
    bus.attach(
        MemRegion::new(0x0c000000, 0x0fffffff, ADDR_AREA3_MASK, 0x1fffffff),
        Ram::new(RAM_SIZE),
    );
    // tile accelerator windows and their mirrors
    bus.attach(
        MemRegion::new(0x10000000, 0x107fffff, 0x1fffffff, 0x1fffffff),
        Box::new(Shared(Rc::clone(&ta_fifo))),
    );
    bus.attach(
        MemRegion::new(0x13000000, 0x137fffff, 0x1fffffff, 0x1fffffff),
        Box::new(Shared(Rc::clone(&ta_fifo))),
    );
    bus.attach(
        MemRegion::new(0x10800000, 0x10ffffff, 0x007fffff, 0x1fffffff),
        Box::new(Shared(Rc::clone(&texmem))),
    );
    bus.attach(
        MemRegion::new(0x11000000, 0x117fffff, 0x007fffff, 0x1fffffff),
        Box::new(Shared(Rc::clone(&texmem))),
    );
    bus.attach(
        MemRegion::new(0x11800000, 0x11ffffff, 0x007fffff, 0x1fffffff),
        Box::new(Shared(Rc::clone(&texmem))),
    );
    // area 0; these use the area mask so the mirrors resolve, and therefore
    // have to sit behind everything above
    bus.attach(
        MemRegion::new(0x00000000, 0x001fffff, 0x001fffff, ADDR_AREA0_MASK),
        bios,
    );
    bus.attach(
        MemRegion::new(0x00200000, 0x0021ffff, 0x0001ffff, ADDR_AREA0_MASK),
        Box::new(Shared(Rc::clone(&flash))),
    );
    bus.attach(
        MemRegion::new(0x005f6800, 0x005f69ff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        Box::new(Shared(Rc::clone(&sysblock))),
    );
    bus.attach(
        MemRegion::new(0x005f6c00, 0x005f6cff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        RegStub::new("maple"),
    );
    bus.attach(
        MemRegion::new(0x005f7000, 0x005f70ff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        RegStub::new("gdrom"),
    );
    bus.attach(
        MemRegion::new(0x005f7400, 0x005f74ff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        RegStub::new("g1"),
    );
    bus.attach(
        MemRegion::new(0x005f7800, 0x005f78ff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        RegStub::new("g2"),
    );
    bus.attach(
        MemRegion::new(0x005f7c00, 0x005f7cff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        RegStub::new("pvr2-dma"),
    );
    bus.attach(
        MemRegion::new(0x005f8000, 0x005f9fff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        Box::new(Shared(Rc::clone(&spg))),
    );
    bus.attach(
        MemRegion::new(0x00600000, 0x006007ff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        RegStub::new("modem"),
    );
    bus.attach(
        MemRegion::new(0x00700000, 0x00707fff, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        AicaRegs::new(),
    );
    bus.attach(
        MemRegion::new(0x00710000, 0x00710047, ADDR_AREA0_MASK, ADDR_AREA0_MASK),
        AicaRtc::new(Rc::clone(&sched)),
    );
    bus.attach(
        MemRegion::new(0x00800000, 0x009fffff, 0x001fffff, ADDR_AREA0_MASK),
        Ram::new(AICA_WAVE_SIZE),
    );

    spg.borrow_mut().init();

    Configuration {
        bus,
        sched,
        holly,
        spg,
        sysblock,
        ta_fifo,
        flash: Some(flash),
        boot: BootMode::Firmware,
        serial_port: None,
    }
}
