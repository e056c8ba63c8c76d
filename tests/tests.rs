// End-to-end exercises against a bare console: the documented integer
// division kernels, a timer underflow interrupt delivered to a guest
// handler, a store-queue burst, translated loads and a channel-2 DMA burst
// into the polygon FIFO.

use emdc::devices::{HollyNrmInt, SpgPtr};
use emdc::dreamcast;
use emdc::fields::{Exception, OpResult, Size};
use emdc::mmu::{PageSz, TlbEnt};
use emdc::peripherals::CHCR_TE;
use emdc::processor::{Reg, CPU, MMUCR_AT, SR_MD, SR_RB};
use emdc::scheduler::{EventKind, TIMESLICE};
use emdc::{Configuration, Emulator};
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

struct TestConsole {
    cpu: CPU,
    spg: SpgPtr,
    ta_fifo: emdc::devices::TaFifoPtr,
    holly: emdc::devices::HollyPtr,
}

fn test_console() -> TestConsole {
    let Configuration { bus, sched, holly, spg, ta_fifo, .. } = dreamcast::bare_console();
    let cpu = CPU::new(
        Rc::new(RefCell::new(bus)),
        sched,
        Rc::clone(&holly),
        Arc::new(AtomicBool::new(false)),
    );
    TestConsole { cpu, spg, ta_fifo, holly }
}

/// Execute one instruction, then hand any due deadlines to their owners,
/// the way the emulator's timeslice loop would.
fn single_step(console: &mut TestConsole) {
    console.cpu.step();
    loop {
        let due = {
            let sched = console.cpu.sched.borrow();
            match sched.peek() {
                Some(ev) if ev.when <= sched.stamp() => Some(ev),
                _ => None,
            }
        };
        let event = match due {
            Some(ev) => ev,
            None => break,
        };
        console.cpu.sched.borrow_mut().pop();
        match event.kind {
            EventKind::TmuUnderflow(chan) => console.cpu.tmu_underflow(chan),
            EventKind::ScifRxi => console.cpu.scif_rxi_event(),
            EventKind::ScifTxi => console.cpu.scif_txi_event(),
            EventKind::Ch2DmaDone => console.cpu.dmac_ch2_complete(),
            EventKind::Hblank => console.spg.borrow_mut().handle_hblank(),
            EventKind::VblankIn => console.spg.borrow_mut().handle_vblank_in(),
            EventKind::VblankOut => console.spg.borrow_mut().handle_vblank_out(),
            _ => {}
        }
    }
}

fn run_until(console: &mut TestConsole, addr: u32) {
    for _ in 0..1_000_000 {
        if console.cpu.reg[Reg::PC] == addr {
            return;
        }
        single_step(console);
    }
    panic!(
        "guest program never reached {:08x}, stuck at {:08x}",
        addr,
        console.cpu.reg[Reg::PC]
    );
}

fn load_program(console: &mut TestConsole, vaddr: u32, program: &[u16]) {
    let mut bus = console.cpu.bus.borrow_mut();
    for (j, &opcode) in program.iter().enumerate() {
        bus.write((vaddr & 0x1fffffff) + 2 * j as u32, OpResult::Word(opcode));
    }
}

const PROGRAM_BASE: u32 = 0x8c001000;

// -------------------------------------------------------------------
// integer division kernels

#[test]
fn unsigned_division_32_by_16() {
    let mut program = vec![
        0x4128, // shll16 r1
        0xe010, // mov #16,r0
        0x0019, // div0u
    ];
    for _ in 0..16 {
        program.push(0x3214); // div1 r1,r2
    }
    program.push(0x4224); // rotcl r2
    program.push(0x622d); // extu.w r2,r2
    let stop = PROGRAM_BASE + 2 * program.len() as u32;

    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let mut console = test_console();
        load_program(&mut console, PROGRAM_BASE, &program);
        let (dividend, divisor) = loop {
            let divisor = rng.gen::<u16>() as u32;
            let dividend = rng.gen::<u32>();
            if divisor != 0 && dividend < divisor << 16 {
                break (dividend, divisor);
            }
        };
        console.cpu.set_r(1, divisor);
        console.cpu.set_r(2, dividend);
        console.cpu.reg[Reg::PC] = PROGRAM_BASE;
        run_until(&mut console, stop);
        assert_eq!(
            console.cpu.r(2),
            dividend / divisor,
            "{} / {}",
            dividend,
            divisor
        );
    }
}

#[test]
fn signed_division_16_by_16() {
    let mut program = vec![
        0x4128, // shll16 r1
        0x622f, // exts.w r2,r2
        0x200a, // xor r0,r0
        0x6323, // mov r2,r3
        0x4324, // rotcl r3
        0x320a, // subc r0,r2
        0x2217, // div0s r1,r2
    ];
    for _ in 0..16 {
        program.push(0x3214); // div1 r1,r2
    }
    program.push(0x622f); // exts.w r2,r2
    program.push(0x4224); // rotcl r2
    program.push(0x320e); // addc r0,r2
    program.push(0x622f); // exts.w r2,r2
    let stop = PROGRAM_BASE + 2 * program.len() as u32;

    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let mut console = test_console();
        load_program(&mut console, PROGRAM_BASE, &program);
        let divisor = loop {
            let divisor = rng.gen::<i16>();
            if divisor != 0 {
                break divisor;
            }
        };
        let dividend = rng.gen::<i16>();
        console.cpu.set_r(1, divisor as u32 & 0xffff);
        console.cpu.set_r(2, dividend as u32 & 0xffff);
        console.cpu.reg[Reg::PC] = PROGRAM_BASE;
        run_until(&mut console, stop);
        let quotient = (dividend as i32) / (divisor as i32);
        assert_eq!(
            console.cpu.r(2) as i32,
            quotient,
            "{} / {}",
            dividend,
            divisor
        );
    }
}

// -------------------------------------------------------------------
// timer underflow interrupt

#[test]
fn tmu_underflow_interrupts_the_spin_loop() {
    let mut console = test_console();
    // exception vector at VBR + 0x600 branches to the exit label
    load_program(&mut console, 0x8c000600, &[0xad7e, 0x0009]); // bra 0c000100; nop
    // the guest starts the countdown itself, then spins on dt/bf
    load_program(
        &mut console,
        PROGRAM_BASE,
        &[
            0xe001, // mov #1,r0
            0x2200, // mov.b r0,@r2     (TSTR = 1)
            0x4310, // dt r3
            0x8bfd, // bf <dt>
            0xef01, // mov #1,r15       (fallback: loop expired)
            0x412b, // jmp @r1
            0x0009, // nop
        ],
    );

    let cpu = &mut console.cpu;
    cpu.reg[Reg::VBR] = 0x0c000000;
    // TMU0 at priority 1, unmasked, BL clear
    cpu.write_mem(0xffd00004, OpResult::Word(0x1000)).unwrap();
    cpu.write_mem(0xffd80008, OpResult::Long(16)).unwrap(); // TCOR0
    cpu.write_mem(0xffd8000c, OpResult::Long(16)).unwrap(); // TCNT0
    cpu.write_mem(0xffd80010, OpResult::Word(0x20)).unwrap(); // TCR0.UNIE
    cpu.set_sr(SR_MD | SR_RB);
    cpu.set_r(1, 0x0c000100);
    cpu.set_r(2, 0xffd80004);
    cpu.set_r(3, 272);
    cpu.reg[Reg::PC] = PROGRAM_BASE;

    run_until(&mut console, 0x0c000100);

    let cpu = &mut console.cpu;
    assert_eq!(cpu.r(15), 0, "the interrupt never preempted the loop");
    assert!(cpu.r(3) > 0, "loop ran to exhaustion before the interrupt");
    assert_eq!(cpu.reg[Reg::INTEVT], Exception::Tuni0.code());
    // counter reloaded from TCOR0 on underflow
    assert_eq!(cpu.read_mem(0xffd8000c, Size::Long).unwrap().inner(), 16);
}

// -------------------------------------------------------------------
// store queue burst

#[test]
fn store_queue_burst_lands_through_the_memory_map() {
    let mut console = test_console();
    let cpu = &mut console.cpu;
    let target = 0x0c003000u32;
    // QACR0 carries the three address bits above the window
    cpu.write_mem(0xff000038, OpResult::Long((target >> 26) << 2)).unwrap();
    let mut vals = Vec::new();
    for j in 0..16u32 {
        let val = 0xfeed0000 | j * 0x111;
        cpu.write_mem(0xe0003000 + 4 * j, OpResult::Long(val)).unwrap();
        vals.push(val);
    }
    cpu.set_r(0, 0xe0003000);
    // pref @r0
    load_program(&mut console, PROGRAM_BASE, &[0x0083]);
    console.cpu.reg[Reg::PC] = PROGRAM_BASE;
    run_until(&mut console, PROGRAM_BASE + 2);
    let cpu = &mut console.cpu;
    for j in 0..8u32 {
        assert_eq!(
            cpu.read_mem(target + 4 * j, Size::Long).unwrap().inner(),
            vals[j as usize],
        );
    }
    // the upper queue stayed home
    assert_eq!(cpu.read_mem(target + 0x20, Size::Long).unwrap().inner(), 0);
}

// -------------------------------------------------------------------
// translated loads

#[test]
fn mmu_translates_and_detects_double_mappings() {
    let mut console = test_console();
    let cpu = &mut console.cpu;
    cpu.write_mem(0x8c000abc, OpResult::Byte(0x5a)).unwrap();
    cpu.reg[Reg::MMUCR] |= MMUCR_AT;
    cpu.utlb[0] = TlbEnt {
        vpn: 0x10000000,
        ppn: 0x0c000000,
        sz: PageSz::FourK,
        valid: true,
        shared: true,
        dirty: true,
        cacheable: true,
        protection: 3,
        ..TlbEnt::default()
    };
    assert_eq!(
        cpu.read_mem(0x10000abc, Size::Byte).unwrap(),
        OpResult::Byte(0x5a)
    );
    // a second valid mapping of the same page is a multiple hit
    cpu.utlb[13] = cpu.utlb[0];
    assert_eq!(
        cpu.read_mem(0x10000abc, Size::Byte),
        Err(Exception::DataTlbMultiHit)
    );
}

// -------------------------------------------------------------------
// channel-2 DMA

#[test]
fn channel2_dma_bursts_into_the_polygon_fifo() {
    let mut console = test_console();
    let src = 0x0c004000u32;
    let mut staged = Vec::new();
    {
        let cpu = &mut console.cpu;
        for j in 0..32u32 {
            let word = 0xcafe0000 | j;
            cpu.write_mem(0x80000000 | (src + 4 * j), OpResult::Long(word)).unwrap();
            staged.push(word);
        }
        cpu.dmac.sar[2] = src;
        cpu.dmac.dmatcr[2] = 4;
        cpu.dmac.chcr[2] = 0x40; // 32-byte units
        cpu.dmac_channel2(0x10000000, 128);
    }
    // completion is a scheduled event; let it fire
    single_step(&mut console);

    let cpu = &console.cpu;
    assert_eq!(console.ta_fifo.borrow_mut().take(), staged);
    assert!(cpu.dmac.chcr[2] & CHCR_TE != 0);
    assert_eq!(cpu.dmac.dmatcr[2], 0);
    assert_eq!(cpu.dmac.sar[2], src + 128);
    assert!(
        console.holly.borrow().istnrm & HollyNrmInt::Channel2DmaComplete.mask() != 0,
        "completion must be visible in ISTNRM"
    );
}

// -------------------------------------------------------------------
// the timeslice loop

#[test]
fn timeslices_advance_the_master_clock_in_quanta() {
    let config = dreamcast::bare_console();
    let mut emulator = Emulator::new(config).expect("bare console always assembles");
    // park the CPU on a branch-to-self
    emulator.poke(0x0c002000, OpResult::Word(0xaffe)); // bra .
    emulator.poke(0x0c002002, OpResult::Word(0x0009)); // nop
    emulator.cpu.reg[Reg::PC] = 0x8c002000;
    let mut debugger: Option<Box<emdc::processor::Debugger>> = None;
    assert!(!emulator.run_timeslice(&mut debugger));
    let stamp = emulator.cpu.sched.borrow().stamp();
    assert!(stamp >= TIMESLICE, "one quantum must elapse, got {}", stamp);
    assert!(!emulator.run_timeslice(&mut debugger));
    assert!(emulator.cpu.sched.borrow().stamp() >= 2 * TIMESLICE);
}

// -------------------------------------------------------------------
// doubles through memory

#[test]
fn double_moves_transpose_words_in_memory() {
    let mut console = test_console();
    // fschg; fmov @r1,dr0 (pair mode); fschg; fmov.s fr0,@r2; fmov.s fr1,@r3
    load_program(
        &mut console,
        PROGRAM_BASE,
        &[0xf3fd, 0xf018, 0xf3fd, 0xf20a, 0xf31a],
    );
    let pattern: u64 = 0x4045_0000_0000_0000; // 42.0
    let cpu = &mut console.cpu;
    cpu.write_mem(0x8c002000, OpResult::Quad(pattern)).unwrap();
    cpu.set_r(1, 0x8c002000);
    cpu.set_r(2, 0x8c002100);
    cpu.set_r(3, 0x8c002104);
    cpu.reg[Reg::PC] = PROGRAM_BASE;
    run_until(&mut console, PROGRAM_BASE + 10);
    let cpu = &mut console.cpu;
    assert_eq!(cpu.dr(0), 42.0);
    // the two singles land in swapped order relative to the 64-bit image
    assert_eq!(
        cpu.read_mem(0x8c002100, Size::Long).unwrap().inner(),
        (pattern >> 32) as u32
    );
    assert_eq!(
        cpu.read_mem(0x8c002104, Size::Long).unwrap().inner(),
        pattern as u32
    );
}
