// This is the place for the basic processor implementation: the register
// file, the dispatch loop, exception entry and the on-chip decode of the P4
// segment. Peripheral register behavior lives in the peripherals module,
// address translation in the mmu module.

use crate::devices::HollyPtr;
use crate::fields::{Exception, ExecGroup, IrqLine, OpResult, Size, IRQ_LINE_COUNT};
use crate::instructions::Instruction;
use crate::memory::BusPtr;
use crate::mmu::TlbEnt;
use crate::parser::parse_instruction;
use crate::peripherals::{Dmac, Scif, Tmu};
use crate::scheduler::{SchedPtr, SH4_CLOCK_SCALE};
use log::{info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::io::prelude::*;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use termion::{clear, color, cursor};

pub const SR_T: u32 = 1;
pub const SR_S: u32 = 1 << 1;
pub const SR_IMASK: u32 = 0xf << 4;
pub const SR_Q: u32 = 1 << 8;
pub const SR_M: u32 = 1 << 9;
pub const SR_FD: u32 = 1 << 15;
pub const SR_BL: u32 = 1 << 28;
pub const SR_RB: u32 = 1 << 29;
pub const SR_MD: u32 = 1 << 30;

pub const FPSCR_RM: u32 = 3;
pub const FPSCR_DN: u32 = 1 << 18;
pub const FPSCR_PR: u32 = 1 << 19;
pub const FPSCR_SZ: u32 = 1 << 20;
pub const FPSCR_FR: u32 = 1 << 21;

pub const MMUCR_AT: u32 = 1;
pub const MMUCR_TI: u32 = 1 << 2;
pub const MMUCR_SV: u32 = 1 << 8;
pub const MMUCR_SQMD: u32 = 1 << 9;

pub const CCR_OCE: u32 = 1;
pub const CCR_OCI: u32 = 1 << 3;
pub const CCR_ORA: u32 = 1 << 5;
pub const CCR_OIX: u32 = 1 << 7;
pub const CCR_ICI: u32 = 1 << 11;

pub const RESET_PC: u32 = 0xa0000000;
pub const RESET_SR: u32 = SR_MD | SR_RB | SR_BL | SR_IMASK;
pub const RESET_FPSCR: u32 = 0x00040001;

const OC_RAM_AREA_SIZE: usize = 8 * 1024;

/// Dense index into the flat register file.
#[derive(Debug, Copy, Clone, PartialEq)]
#[rustfmt::skip]
pub enum Reg {
    // general purpose, current bank
    R0 = 0, R1, R2, R3, R4, R5, R6, R7,
    R8, R9, R10, R11, R12, R13, R14, R15,
    // general purpose, shadowed bank
    R0B, R1B, R2B, R3B, R4B, R5B, R6B, R7B,
    // floating point, current bank
    FR0, FR1, FR2, FR3, FR4, FR5, FR6, FR7,
    FR8, FR9, FR10, FR11, FR12, FR13, FR14, FR15,
    // floating point, shadowed bank
    XF0, XF1, XF2, XF3, XF4, XF5, XF6, XF7,
    XF8, XF9, XF10, XF11, XF12, XF13, XF14, XF15,
    FPSCR, FPUL,
    SR, SSR, SPC, GBR, VBR, SGR, DBR,
    MACH, MACL, PR, PC,
    PTEH, PTEL, PTEA, TTB, TEA, MMUCR, CCR,
    QACR0, QACR1,
    TRA, EXPEVT, INTEVT,
    TOCR, TSTR,
    TCOR0, TCNT0, TCR0,
    TCOR1, TCNT1, TCR1,
    TCOR2, TCNT2, TCR2,
    TCPR2,
    ICR, IPRA, IPRB, IPRC, IPRD,
    SCSMR2, SCBRR2, SCSCR2, SCFSR2, SCFCR2, SCSPTR2, SCLSR2,
    STBCR,
    Count,
}

pub const REG_COUNT: usize = Reg::Count as usize;

pub struct RegFile([u32; REG_COUNT]);

impl Index<Reg> for RegFile {
    type Output = u32;
    fn index(&self, reg: Reg) -> &u32 {
        &self.0[reg as usize]
    }
}

impl IndexMut<Reg> for RegFile {
    fn index_mut(&mut self, reg: Reg) -> &mut u32 {
        &mut self.0[reg as usize]
    }
}

impl Index<usize> for RegFile {
    type Output = u32;
    fn index(&self, idx: usize) -> &u32 {
        &self.0[idx]
    }
}

impl IndexMut<usize> for RegFile {
    fn index_mut(&mut self, idx: usize) -> &mut u32 {
        &mut self.0[idx]
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ExecState {
    Norm,
    Sleep,
    Standby,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Signal {
    Ok,
    Quit,
    NoOp,
}

pub struct CPU {
    pub reg: RegFile,
    pub delayed_branch: bool,
    pub delayed_branch_addr: u32,
    pc_written: bool,
    pub exec_state: ExecState,
    pub bus: BusPtr,
    pub sched: SchedPtr,
    pub holly: HollyPtr,
    pub utlb: [TlbEnt; 64],
    pub itlb: [TlbEnt; 4],
    pub oc_ram: Vec<u8>,
    pub sq: [u32; 16],
    pub tmu: Tmu,
    pub dmac: Dmac,
    pub scif: Scif,
    pub irq_lines: [Option<Exception>; IRQ_LINE_COUNT],
    pub last_inst_group: Option<ExecGroup>,
    pub kill: Arc<AtomicBool>,
    pub jmp: u32, // last control transfer target (debugger)
    // plain-storage on-chip registers (UBC, BSC, CPG leftovers, RTC, HUDI)
    p4_store: HashMap<u32, u32>,
}

impl CPU {
    pub fn new(bus: BusPtr, sched: SchedPtr, holly: HollyPtr, kill: Arc<AtomicBool>) -> CPU {
        let mut cpu = CPU {
            reg: RegFile([0; REG_COUNT]),
            delayed_branch: false,
            delayed_branch_addr: 0,
            pc_written: false,
            exec_state: ExecState::Norm,
            bus,
            sched,
            holly,
            utlb: [TlbEnt::default(); 64],
            itlb: [TlbEnt::default(); 4],
            oc_ram: vec![0; OC_RAM_AREA_SIZE],
            sq: [0; 16],
            tmu: Tmu::new(),
            dmac: Dmac::new(),
            scif: Scif::new(),
            irq_lines: [None; IRQ_LINE_COUNT],
            last_inst_group: None,
            kill,
            jmp: 0,
            p4_store: HashMap::new(),
        };
        cpu.hard_reset();
        cpu
    }

    pub fn hard_reset(&mut self) {
        self.reg = RegFile([0; REG_COUNT]);
        self.reg[Reg::SR] = RESET_SR;
        self.reg[Reg::PC] = RESET_PC;
        self.reg[Reg::FPSCR] = RESET_FPSCR;
        self.reg[Reg::EXPEVT] = Exception::PowerOnReset.code();
        self.reg[Reg::TCOR0] = 0xffffffff;
        self.reg[Reg::TCNT0] = 0xffffffff;
        self.reg[Reg::TCOR1] = 0xffffffff;
        self.reg[Reg::TCNT1] = 0xffffffff;
        self.reg[Reg::TCOR2] = 0xffffffff;
        self.reg[Reg::TCNT2] = 0xffffffff;
        self.reg[Reg::TOCR] = 1;
        self.reg[Reg::SCFSR2] = 0x0060;
        self.delayed_branch = false;
        self.exec_state = ExecState::Norm;
        self.utlb = [TlbEnt::default(); 64];
        self.itlb = [TlbEnt::default(); 4];
        self.sq = [0; 16];
        self.tmu = Tmu::new();
        self.dmac = Dmac::new();
        self.irq_lines = [None; IRQ_LINE_COUNT];
        self.last_inst_group = None;
    }

    // ------------------------------------------------------------------
    // register file access

    pub fn r(&self, n: usize) -> u32 {
        self.reg[Reg::R0 as usize + n]
    }
    pub fn set_r(&mut self, n: usize, val: u32) {
        self.reg[Reg::R0 as usize + n] = val;
    }
    /// The shadow bank, R0_BANK..R7_BANK as seen by ldc/stc Rn_BANK.
    pub fn bank_r(&self, n: usize) -> u32 {
        self.reg[Reg::R0B as usize + n]
    }
    pub fn set_bank_r(&mut self, n: usize, val: u32) {
        self.reg[Reg::R0B as usize + n] = val;
    }
    pub fn fr_bits(&self, n: usize) -> u32 {
        self.reg[Reg::FR0 as usize + n]
    }
    pub fn set_fr_bits(&mut self, n: usize, bits: u32) {
        self.reg[Reg::FR0 as usize + n] = bits;
    }
    pub fn xf_bits(&self, n: usize) -> u32 {
        self.reg[Reg::XF0 as usize + n]
    }
    pub fn set_xf_bits(&mut self, n: usize, bits: u32) {
        self.reg[Reg::XF0 as usize + n] = bits;
    }
    pub fn fr(&self, n: usize) -> f32 {
        f32::from_bits(self.fr_bits(n))
    }
    pub fn set_fr(&mut self, n: usize, val: f32) {
        self.set_fr_bits(n, val.to_bits());
    }
    /// In little-endian mode the SH-4 keeps the two words of a double
    /// swapped: interpreting DRn means transposing FRn and FRn+1.
    pub fn dr(&self, n: usize) -> f64 {
        let hi = self.fr_bits(n) as u64;
        let lo = self.fr_bits(n + 1) as u64;
        f64::from_bits((hi << 32) | lo)
    }
    pub fn set_dr(&mut self, n: usize, val: f64) {
        let bits = val.to_bits();
        self.set_fr_bits(n, (bits >> 32) as u32);
        self.set_fr_bits(n + 1, bits as u32);
    }
    pub fn xd(&self, n: usize) -> u64 {
        ((self.xf_bits(n) as u64) << 32) | self.xf_bits(n + 1) as u64
    }
    pub fn set_xd(&mut self, n: usize, bits: u64) {
        self.set_xf_bits(n, (bits >> 32) as u32);
        self.set_xf_bits(n + 1, bits as u32);
    }

    pub fn t(&self) -> bool {
        self.reg[Reg::SR] & SR_T != 0
    }
    pub fn set_t(&mut self, val: bool) {
        if val {
            self.reg[Reg::SR] |= SR_T;
        } else {
            self.reg[Reg::SR] &= !SR_T;
        }
    }
    pub fn sr_bit(&self, mask: u32) -> bool {
        self.reg[Reg::SR] & mask != 0
    }
    pub fn set_sr_bit(&mut self, mask: u32, val: bool) {
        if val {
            self.reg[Reg::SR] |= mask;
        } else {
            self.reg[Reg::SR] &= !mask;
        }
    }
    pub fn privileged(&self) -> bool {
        self.sr_bit(SR_MD)
    }
    pub fn fpscr_bit(&self, mask: u32) -> bool {
        self.reg[Reg::FPSCR] & mask != 0
    }

    pub fn bank_switch(&mut self) {
        for n in 0..8 {
            let cur = self.reg[Reg::R0 as usize + n];
            self.reg[Reg::R0 as usize + n] = self.reg[Reg::R0B as usize + n];
            self.reg[Reg::R0B as usize + n] = cur;
        }
    }
    pub fn fpu_bank_switch(&mut self) {
        for n in 0..16 {
            let cur = self.reg[Reg::FR0 as usize + n];
            self.reg[Reg::FR0 as usize + n] = self.reg[Reg::XF0 as usize + n];
            self.reg[Reg::XF0 as usize + n] = cur;
        }
    }
    /// All SR writes funnel through here so a flipped RB bit swaps the
    /// banks exactly once.
    pub fn set_sr(&mut self, new_sr: u32) {
        let old_sr = self.reg[Reg::SR];
        if (old_sr ^ new_sr) & SR_RB != 0 {
            self.bank_switch();
        }
        self.reg[Reg::SR] = new_sr;
    }
    pub fn set_fpscr(&mut self, new_fpscr: u32) {
        let old = self.reg[Reg::FPSCR];
        if (old ^ new_fpscr) & FPSCR_FR != 0 {
            self.fpu_bank_switch();
        }
        self.reg[Reg::FPSCR] = new_fpscr & 0x003fffff;
    }

    // ------------------------------------------------------------------
    // exceptions and interrupts

    pub fn enter_exception(&mut self, excp: Exception) {
        self.reg[Reg::SPC] = self.reg[Reg::PC];
        self.reg[Reg::SSR] = self.reg[Reg::SR];
        self.reg[Reg::SGR] = self.reg[Reg::R15];

        let new_sr = (self.reg[Reg::SR] | SR_BL | SR_MD | SR_RB) & !SR_FD;
        self.set_sr(new_sr);

        if excp.is_reset() {
            self.reg[Reg::PC] = RESET_PC;
        } else {
            self.reg[Reg::PC] = self.reg[Reg::VBR].wrapping_add(excp.vector_offset());
        }
        self.pc_written = true;
        self.exec_state = ExecState::Norm;
    }

    pub fn set_exception(&mut self, excp: Exception) {
        self.reg[Reg::EXPEVT] = excp.code();
        self.enter_exception(excp);
    }

    pub fn set_interrupt(&mut self, line: IrqLine, code: Exception) {
        self.irq_lines[line as usize] = Some(code);
    }
    pub fn clear_interrupt(&mut self, line: IrqLine) {
        self.irq_lines[line as usize] = None;
    }

    /// Drive all four IRL lines from the active-low encoded bus value.
    pub fn set_irl_interrupt(&mut self, irl_val: u32) {
        let irl_val = !irl_val;
        let lines = [IrqLine::Irl0, IrqLine::Irl1, IrqLine::Irl2, IrqLine::Irl3];
        let codes = [2u8, 5, 8, 11]; // fixed EXT codes of the single-line mode
        for bit in 0..4 {
            self.irq_lines[lines[bit] as usize] = if irl_val & (1 << bit) != 0 {
                Some(Exception::Ext(codes[bit]))
            } else {
                None
            };
        }
    }

    fn line_priority(&self, line: usize) -> u32 {
        let ipr = self.reg[Reg::IPRA as usize + line / 4];
        (ipr >> (4 * (line % 4))) & 0xf
    }

    /// The highest-priority pending interrupt that the current SR admits.
    fn next_irq(&self) -> Option<(Option<usize>, Exception, u32)> {
        let imask = (self.reg[Reg::SR] & SR_IMASK) >> 4;
        let irlm = self.reg[Reg::ICR] & (1 << 7) != 0;
        let last_line = if irlm { IRQ_LINE_COUNT - 1 } else { IrqLine::Gpio as usize };

        let mut best: Option<(Option<usize>, Exception, u32)> = None;
        for line in 0..=last_line {
            if let Some(code) = self.irq_lines[line] {
                let prio = self.line_priority(line);
                if prio > imask && best.map_or(true, |(_, _, p)| prio > p) {
                    best = Some((Some(line), code, prio));
                }
            }
        }

        // with IRLM clear the four IRL pins form an encoded active-low bus
        if !irlm {
            let mut irl_val = 0;
            for (bit, line) in [IrqLine::Irl0, IrqLine::Irl1, IrqLine::Irl2, IrqLine::Irl3]
                .iter()
                .enumerate()
            {
                if self.irq_lines[*line as usize].is_some() {
                    irl_val |= 1 << bit;
                }
            }
            let irl_val = (!irl_val) & 0xf;
            if irl_val != 0xf {
                let prio = 15 - irl_val;
                if prio > imask && best.map_or(true, |(_, _, p)| prio > p) {
                    best = Some((None, Exception::Ext(irl_val as u8), prio));
                }
            }
        }
        best
    }

    /// Check the IRQ lines and enter interrupt state if one is due. Delay
    /// slots are treated as atomic with their branch, so nothing fires
    /// between the two.
    pub fn check_interrupts(&mut self) {
        if self.delayed_branch || self.sr_bit(SR_BL) {
            return;
        }
        // the Holly aggregator drives the IRL pins
        let irl = self.holly.borrow().irl_value();
        self.set_irl_interrupt(irl);
        // channel-2 transfer end asserts the DMAC line for as long as TE
        // stands
        self.irq_lines[IrqLine::Dmac as usize] = if self.dmac.te_pending(2) {
            Some(Exception::Dmte2)
        } else {
            None
        };

        if let Some((line, code, _)) = self.next_irq() {
            self.reg[Reg::INTEVT] = code.code();
            self.enter_exception(code);
            match line {
                Some(line) => self.irq_lines[line] = None,
                None => self.set_irl_interrupt(0xf),
            }
        }
    }

    // ------------------------------------------------------------------
    // memory access

    fn in_sq_area(addr: u32) -> bool {
        addr & 0xfc000000 == 0xe0000000
    }
    fn in_ora_area(&self, addr: u32) -> bool {
        self.reg[Reg::CCR] & CCR_OCE != 0
            && self.reg[Reg::CCR] & CCR_ORA != 0
            && addr & 0xfc000000 == 0x7c000000
    }
    fn needs_translation(&self, addr: u32) -> bool {
        if self.reg[Reg::MMUCR] & MMUCR_AT == 0 {
            return false;
        }
        let area = addr >> 29;
        area <= 3 || area == 6
    }

    pub fn read_mem(&mut self, addr: u32, size: Size) -> Result<OpResult, Exception> {
        if addr & size.alignment_mask() != 0 {
            self.reg[Reg::TEA] = addr;
            return Err(Exception::DataAddrRead);
        }
        if addr >= 0xe0000000 {
            if !self.privileged() && !Self::in_sq_area(addr) {
                self.reg[Reg::TEA] = addr;
                return Err(Exception::DataAddrRead);
            }
            return self.p4_read(addr, size);
        }
        if !self.privileged() && addr >= 0x80000000 {
            self.reg[Reg::TEA] = addr;
            return Err(Exception::DataAddrRead);
        }
        if self.in_ora_area(addr) {
            return Ok(self.ora_read(addr, size));
        }
        let paddr = if self.needs_translation(addr) {
            self.translate_data(addr, false)?
        } else {
            addr
        };
        Ok(self.bus.borrow_mut().read(paddr & 0x1fffffff, size))
    }

    pub fn write_mem(&mut self, addr: u32, value: OpResult) -> Result<(), Exception> {
        if addr & value.size().alignment_mask() != 0 {
            self.reg[Reg::TEA] = addr;
            return Err(Exception::DataAddrWrite);
        }
        if addr >= 0xe0000000 {
            if !self.privileged() && !Self::in_sq_area(addr) {
                self.reg[Reg::TEA] = addr;
                return Err(Exception::DataAddrWrite);
            }
            return self.p4_write(addr, value);
        }
        if !self.privileged() && addr >= 0x80000000 {
            self.reg[Reg::TEA] = addr;
            return Err(Exception::DataAddrWrite);
        }
        if self.in_ora_area(addr) {
            self.ora_write(addr, value);
            return Ok(());
        }
        let paddr = if self.needs_translation(addr) {
            self.translate_data(addr, true)?
        } else {
            addr
        };
        self.bus.borrow_mut().write(paddr & 0x1fffffff, value);
        Ok(())
    }

    pub fn read_inst(&mut self, addr: u32) -> Result<u16, Exception> {
        if addr & 1 != 0 || addr >= 0xe0000000 {
            self.reg[Reg::TEA] = addr;
            return Err(Exception::InstAddrErr);
        }
        if !self.privileged() && addr >= 0x80000000 {
            self.reg[Reg::TEA] = addr;
            return Err(Exception::InstAddrErr);
        }
        let paddr = if self.needs_translation(addr) {
            self.translate_inst(addr)?
        } else {
            addr
        };
        Ok(self.bus.borrow_mut().read(paddr & 0x1fffffff, Size::Word).inner() as u16)
    }

    /// Best-effort fetch for the disassembler; never faults, never touches
    /// TLB state.
    pub fn peek_inst(&mut self, addr: u32) -> Option<u16> {
        if addr & 1 != 0 || addr >= 0xe0000000 {
            return None;
        }
        let paddr = if self.needs_translation(addr) {
            self.peek_translation(addr)?
        } else {
            addr
        };
        self.bus
            .borrow_mut()
            .try_read(paddr & 0x1fffffff, Size::Word)
            .map(|res| res.inner() as u16)
    }

    // operand cache as scratch RAM: bank select bit depends on CCR.OIX
    fn ora_ram_index(&self, addr: u32) -> usize {
        let bank_bit = if self.reg[Reg::CCR] & CCR_OIX != 0 { 1 << 25 } else { 1 << 13 };
        let half = if addr & bank_bit != 0 { OC_RAM_AREA_SIZE / 2 } else { 0 };
        half + (addr & 0xfff) as usize
    }
    fn ora_read(&self, addr: u32, size: Size) -> OpResult {
        let ptr = self.ora_ram_index(addr);
        size.from_le_bytes(&self.oc_ram[ptr..ptr + size as usize])
    }
    fn ora_write(&mut self, addr: u32, value: OpResult) {
        let ptr = self.ora_ram_index(addr);
        for (j, b) in value.to_le_bytes().drain(..).enumerate() {
            self.oc_ram[ptr + j] = b;
        }
    }

    // ------------------------------------------------------------------
    // P4: store queues, cache/TLB arrays, memory-mapped registers

    fn p4_read(&mut self, addr: u32, size: Size) -> Result<OpResult, Exception> {
        if Self::in_sq_area(addr) {
            if !self.privileged() && self.reg[Reg::MMUCR] & MMUCR_SQMD != 0 {
                self.reg[Reg::TEA] = addr;
                return Err(Exception::DataAddrRead);
            }
            return Ok(self.sq_read(addr, size));
        }
        match addr {
            0xff000000..=0xfff00007 => Ok(self.mapped_reg_read(addr, size)),
            0xf4000000..=0xf4ffffff | 0xf0000000..=0xf0ffffff => Ok(size.zero()),
            0xfffffffc => {
                info!("read from unknown address fffffffc, returning 0");
                Ok(size.zero())
            }
            0xe4000000..=0xefffffff => {
                warn!("read from reserved P4 address {:08x}, returning 0", addr);
                Ok(size.zero())
            }
            _ if size == Size::Long => match addr {
                0xf2000000..=0xf2ffffff => Ok(OpResult::Long(self.itlb_addr_array_read(addr))),
                0xf3000000..=0xf37fffff => Ok(OpResult::Long(self.itlb_data_array_read(addr))),
                0xf6000000..=0xf6ffffff => Ok(OpResult::Long(self.utlb_addr_array_read(addr))),
                0xf7000000..=0xf77fffff => Ok(OpResult::Long(self.utlb_data_array_read(addr))),
                _ => panic!("unimplemented read of {} bytes from P4 address {:08x}", size as u32, addr),
            },
            _ => panic!("unimplemented read of {} bytes from P4 address {:08x}", size as u32, addr),
        }
    }

    fn p4_write(&mut self, addr: u32, value: OpResult) -> Result<(), Exception> {
        if Self::in_sq_area(addr) {
            if !self.privileged() && self.reg[Reg::MMUCR] & MMUCR_SQMD != 0 {
                self.reg[Reg::TEA] = addr;
                return Err(Exception::DataAddrWrite);
            }
            self.sq_write(addr, value);
            return Ok(());
        }
        match addr {
            0xff000000..=0xfff00007 => {
                self.mapped_reg_write(addr, value);
                Ok(())
            }
            // cache address arrays: nothing behind them in an interpreter
            0xf4000000..=0xf4ffffff | 0xf0000000..=0xf0ffffff => Ok(()),
            _ if value.size() == Size::Long => {
                let val = value.inner();
                match addr {
                    0xf2000000..=0xf2ffffff => self.itlb_addr_array_write(addr, val),
                    0xf3000000..=0xf37fffff => self.itlb_data_array_write(addr, val),
                    0xf6000000..=0xf6ffffff => self.utlb_addr_array_write(addr, val),
                    0xf7000000..=0xf77fffff => self.utlb_data_array_write(addr, val),
                    _ => panic!(
                        "unimplemented write of {} bytes to P4 address {:08x}",
                        value.size() as u32,
                        addr
                    ),
                }
                Ok(())
            }
            _ => panic!(
                "unimplemented write of {} bytes to P4 address {:08x}",
                value.size() as u32,
                addr
            ),
        }
    }

    // store queue slots: bit 5 picks the queue, bits 4:2 the word
    fn sq_slot(addr: u32) -> usize {
        (((addr >> 5) & 1) << 3 | (addr >> 2) & 7) as usize
    }
    fn sq_read(&self, addr: u32, size: Size) -> OpResult {
        let slot = Self::sq_slot(addr);
        match size {
            Size::Quad => {
                OpResult::Quad((self.sq[slot + 1] as u64) << 32 | self.sq[slot] as u64)
            }
            _ => size.from(self.sq[slot] >> (8 * (addr & 3))),
        }
    }
    fn sq_write(&mut self, addr: u32, value: OpResult) {
        let slot = Self::sq_slot(addr);
        match value {
            OpResult::Quad(q) => {
                self.sq[slot & !1] = q as u32;
                self.sq[(slot & !1) + 1] = (q >> 32) as u32;
            }
            OpResult::Long(l) => self.sq[slot] = l,
            OpResult::Word(w) => {
                let shift = 8 * (addr & 2);
                self.sq[slot] = (self.sq[slot] & !(0xffff << shift)) | ((w as u32) << shift);
            }
            OpResult::Byte(b) => {
                let shift = 8 * (addr & 3);
                self.sq[slot] = (self.sq[slot] & !(0xff << shift)) | ((b as u32) << shift);
            }
        }
    }

    /// `pref` inside the store-queue window: burst one queue out through the
    /// memory map. The 29-bit target is the virtual bits 25:6 with QACRn
    /// bits 4:2 on top.
    pub fn sq_pref(&mut self, addr: u32) {
        let sel = (addr >> 5) & 1;
        let base = (sel << 3) as usize;
        let qacr = if sel == 0 { self.reg[Reg::QACR0] } else { self.reg[Reg::QACR1] };
        let target = (addr & 0x03ffffe0) | (((qacr >> 2) & 7) << 26);
        let mut bus = self.bus.borrow_mut();
        for j in 0..8 {
            bus.write(
                (target + 4 * j as u32) & 0x1fffffff,
                OpResult::Long(self.sq[base + j]),
            );
        }
    }

    fn mapped_reg_read(&mut self, addr: u32, size: Size) -> OpResult {
        let val = match addr {
            0xff000000 => self.reg[Reg::PTEH],
            0xff000004 => self.reg[Reg::PTEL],
            0xff000008 => self.reg[Reg::TTB],
            0xff00000c => self.reg[Reg::TEA],
            0xff000010 => self.reg[Reg::MMUCR],
            0xff00001c => self.reg[Reg::CCR],
            0xff000020 => self.reg[Reg::TRA],
            0xff000024 => self.reg[Reg::EXPEVT],
            0xff000028 => self.reg[Reg::INTEVT],
            0xff000034 => self.reg[Reg::PTEA],
            0xff000038 => self.reg[Reg::QACR0],
            0xff00003c => self.reg[Reg::QACR1],
            0xffa00000..=0xffa00043 => self.dmac_reg_read(addr),
            0xffc00004 => self.reg[Reg::STBCR],
            0xffd00000 => self.reg[Reg::ICR],
            0xffd00004 => self.reg[Reg::IPRA],
            0xffd00008 => self.reg[Reg::IPRB],
            0xffd0000c => self.reg[Reg::IPRC],
            0xffd00010 => self.reg[Reg::IPRD],
            0xffd80000..=0xffd8002f => self.tmu_reg_read(addr),
            0xffe80000..=0xffe80027 => self.scif_reg_read(addr),
            0xff000014 | 0xff000018 => *self.p4_store.get(&addr).unwrap_or(&0), // BASRA/B
            0xff200000..=0xff20001f
            | 0xff800000..=0xff80004f
            | 0xffc00000..=0xffc0001f
            | 0xffc80000..=0xffc8003f
            | 0xffe00000..=0xffe0001f
            | 0xfff00000..=0xfff00007 => *self.p4_store.get(&addr).unwrap_or(&0),
            _ => panic!("unimplemented on-chip register read from {:08x}", addr),
        };
        size.from(val)
    }

    fn mapped_reg_write(&mut self, addr: u32, value: OpResult) {
        let val = value.inner();
        match addr {
            0xff000000 => self.reg[Reg::PTEH] = val,
            0xff000004 => self.reg[Reg::PTEL] = val,
            0xff000008 => self.reg[Reg::TTB] = val,
            0xff00000c => self.reg[Reg::TEA] = val,
            0xff000010 => self.mmucr_write(val),
            0xff00001c => {
                // invalidation strobes read back as zero
                self.reg[Reg::CCR] = val & !(CCR_ICI | CCR_OCI);
            }
            0xff000020 => self.reg[Reg::TRA] = val & 0x3fc,
            0xff000024 => self.reg[Reg::EXPEVT] = val & 0xfff,
            0xff000028 => self.reg[Reg::INTEVT] = val & 0xfff,
            0xff000034 => self.reg[Reg::PTEA] = val & 0xf,
            0xff000038 => self.reg[Reg::QACR0] = val & 0x1c,
            0xff00003c => self.reg[Reg::QACR1] = val & 0x1c,
            0xffa00000..=0xffa00043 => self.dmac_reg_write(addr, val),
            0xffc00004 => self.reg[Reg::STBCR] = val & 0xff,
            0xffd00000 => self.reg[Reg::ICR] = val,
            0xffd00004 => self.reg[Reg::IPRA] = val & 0xffff,
            0xffd00008 => self.reg[Reg::IPRB] = val & 0xffff,
            0xffd0000c => self.reg[Reg::IPRC] = val & 0xffff,
            0xffd00010 => self.reg[Reg::IPRD] = val & 0xffff,
            0xffd80000..=0xffd8002f => self.tmu_reg_write(addr, val),
            0xffe80000..=0xffe80027 => self.scif_reg_write(addr, val),
            0xff000014
            | 0xff000018
            | 0xff200000..=0xff20001f
            | 0xff800000..=0xff80004f
            | 0xffc00000..=0xffc0001f
            | 0xffc80000..=0xffc8003f
            | 0xffe00000..=0xffe0001f
            | 0xfff00000..=0xfff00007 => {
                self.p4_store.insert(addr, val);
            }
            _ => panic!("unimplemented on-chip register write to {:08x}", addr),
        }
    }

    // ------------------------------------------------------------------
    // dispatch

    /// Instructions that transfer control immediately.
    pub fn jump(&mut self, target: u32) {
        self.reg[Reg::PC] = target;
        self.pc_written = true;
        self.jmp = target;
    }
    /// Instructions that transfer control after their delay slot.
    pub fn branch(&mut self, target: u32) {
        self.delayed_branch = true;
        self.delayed_branch_addr = target;
    }

    fn count_inst_cycles(&mut self, inst: &Instruction) -> u64 {
        let (group, issue) = inst.timing();
        match self.last_inst_group {
            // the second pipeline issues this one for free
            Some(last) if group.pairs_with(last) => {
                self.last_inst_group = None;
                0
            }
            _ => {
                self.last_inst_group = Some(group);
                issue as u64
            }
        }
    }

    fn handle_fault(&mut self, excp: Exception, pc: u32, in_slot: bool) {
        // a fault in a delay slot re-executes the whole branch/slot pair
        if in_slot {
            self.reg[Reg::PC] = pc.wrapping_sub(2);
            self.delayed_branch = false;
        } else {
            self.reg[Reg::PC] = pc;
        }
        self.set_exception(excp);
    }

    pub fn step(&mut self) {
        if self.scif.something_pending.swap(false, Ordering::AcqRel) {
            self.scif_periodic();
        }
        if !self.delayed_branch {
            self.check_interrupts();
        }
        if self.exec_state != ExecState::Norm {
            // core is asleep: idle the clock forward to the next event
            let mut sched = self.sched.borrow_mut();
            let span = sched.target().saturating_sub(sched.stamp());
            sched.advance(span.max(SH4_CLOCK_SCALE));
            return;
        }

        let pc = self.reg[Reg::PC];
        let in_slot = self.delayed_branch;
        let opcode = match self.read_inst(pc) {
            Ok(opcode) => opcode,
            Err(excp) => {
                self.handle_fault(excp, pc, in_slot);
                return;
            }
        };
        let inst = match parse_instruction(opcode) {
            Some(inst) => inst,
            None => {
                let excp = if in_slot { Exception::SlotIllegalInst } else { Exception::GenIllegalInst };
                self.handle_fault(excp, pc, in_slot);
                return;
            }
        };
        let cycles = self.count_inst_cycles(&inst);
        self.sched.borrow_mut().advance(cycles * SH4_CLOCK_SCALE);
        self.pc_written = false;
        match inst.execute(self) {
            Ok(()) => {
                if in_slot {
                    self.reg[Reg::PC] = self.delayed_branch_addr;
                    self.jmp = self.delayed_branch_addr;
                    self.delayed_branch = false;
                } else if !self.pc_written {
                    self.reg[Reg::PC] = pc.wrapping_add(2);
                }
            }
            Err(excp) => self.handle_fault(excp, pc, in_slot),
        }
    }

    /// Run instructions until the next scheduler deadline. Returns Quit if
    /// the debugger asked to stop or the kill flag went up.
    pub fn execute_until(&mut self, debugger: &mut Option<Box<Debugger>>) -> Signal {
        loop {
            {
                let sched = self.sched.borrow();
                if sched.stamp() >= sched.target() {
                    return Signal::Ok;
                }
            }
            if self.kill.load(Ordering::Relaxed) {
                return Signal::Quit;
            }
            self.step();
            if let Some(dbg) = debugger {
                match dbg.update(self) {
                    Signal::Quit => return Signal::Quit,
                    _ => {}
                }
            }
        }
    }

    pub fn disassemble(&mut self, lines: usize) -> DisassemblySection {
        let mut disassembly = VecDeque::with_capacity(lines);
        let mut pc = self.reg[Reg::PC];
        for _ in 0..lines {
            let (opcode, text) = match self.peek_inst(pc) {
                Some(opcode) => match parse_instruction(opcode) {
                    Some(inst) => (opcode, inst.as_asm(pc)),
                    None => (opcode, String::from(".word")),
                },
                None => (0, String::from("??")),
            };
            disassembly.push_back((pc, vec![opcode], text));
            pc = pc.wrapping_add(2);
        }
        disassembly
    }
}

impl fmt::Display for CPU {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::from("\n");
        s.push_str(&format!("{r}╔══════════════════════════════════╦", r = cursor::Goto(1, 2)));
        s.push_str(&format!("{r}║ SH-4 state                       ║", r = cursor::Goto(1, 3)));
        s.push_str(&format!("{r}╟─────┬───────────┬─────┬──────────╫", r = cursor::Goto(1, 4)));
        for j in 0..8 {
            s.push_str(&format!(
                "{r}║ R{j}  │  {a:08x} │ R{k:<2} │ {b:08x} ║\n",
                j = j,
                k = j + 8,
                a = self.r(j),
                b = self.r(j + 8),
                r = cursor::Goto(1, (j + 5) as u16),
            ));
        }
        s.push_str(&format!("{r}╟─────┼─┬─┬─┬─┬─┬─┴┬────┴──────────╢", r = cursor::Goto(1, 13)));
        s.push_str(&format!("{r}║ IM  │T│S│Q│M│BL│RB│MD│           ║", r = cursor::Goto(1, 14)));
        s.push_str(&format!(
            "{r}║ {im:x}   │{t}│{ss}│{q}│{m}│{bl} │{rb} │{md}│ {pc:08x}  ║\n",
            im = (self.reg[Reg::SR] & SR_IMASK) >> 4,
            t = self.t() as u8,
            ss = self.sr_bit(SR_S) as u8,
            q = self.sr_bit(SR_Q) as u8,
            m = self.sr_bit(SR_M) as u8,
            bl = self.sr_bit(SR_BL) as u8,
            rb = self.sr_bit(SR_RB) as u8,
            md = self.sr_bit(SR_MD) as u8,
            pc = self.reg[Reg::PC],
            r = cursor::Goto(1, 15)
        ));
        s.push_str(&format!(
            "{r}║ PR {pr:08x} GBR {gbr:08x} VBR {vbr:08x}",
            pr = self.reg[Reg::PR],
            gbr = self.reg[Reg::GBR],
            vbr = self.reg[Reg::VBR],
            r = cursor::Goto(1, 16)
        ));
        s.push_str(&format!("{r}╚═════╧═╧═╧═╧═╧══╧══╧══╧═══════════╩", r = cursor::Goto(1, 17)));
        write!(f, "{}", s)
    }
}

pub fn set_bit(bitfield: &mut u32, bit: u32, value: bool) {
    if value {
        *bitfield |= 1 << bit;
    } else {
        *bitfield &= !(1 << bit);
    }
}

pub fn get_bit(bitfield: u32, bit: u32) -> bool {
    bitfield & (1 << bit) != 0
}

pub type DisassemblySection = VecDeque<(u32, Vec<u16>, String)>;

pub struct Disassembly {
    pub disassembly: DisassemblySection,
    pub cursor: usize,
    pub length: usize,
    pub breakpoints: HashSet<u32>,
}

impl Disassembly {
    pub fn new(lines: usize) -> Self {
        Self {
            disassembly: VecDeque::with_capacity(lines),
            cursor: 0,
            length: lines,
            breakpoints: HashSet::new(),
        }
    }
    pub fn update(&mut self, cpu: &mut CPU) {
        let pc = cpu.reg[Reg::PC];
        let known = self
            .disassembly
            .iter()
            .position(|line| line.0 == pc);
        match known {
            Some(cursor) if cursor <= self.length / 2 => self.cursor = cursor,
            _ => {
                self.disassembly = cpu.disassemble(self.length);
                self.cursor = 0;
            }
        }
    }
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = String::new();
        result.push_str(&format!(
            "{r}═══════════════════════════════════════════════════════╗\n",
            r = cursor::Goto(37, 2)
        ));
        result.push_str(&format!(
            "{r} Next instructions                                     ║\n",
            r = cursor::Goto(37, 3)
        ));
        result.push_str(&format!(
            "{r}──────────┬───────┬────────────────────────────────────╢\n",
            r = cursor::Goto(37, 4)
        ));
        for (j, line) in self.disassembly.iter().enumerate() {
            let mut out = String::new();
            for word in &line.1 {
                out.push_str(&format!("{:04x} ", word));
            }
            let mut symbol = String::from(" ");
            let mut col = format!("{}", color::Fg(color::Reset));
            if self.breakpoints.contains(&line.0) {
                symbol = format!("{r}*{n}", n = color::Fg(color::Reset), r = color::Fg(color::Red));
                if j == self.cursor {
                    symbol.push_str(&format!("{g}", g = color::Fg(color::Green)));
                    col = format!("{}", color::Fg(color::Green));
                }
            } else if j == self.cursor {
                symbol = format!("{g}>", g = color::Fg(color::Green));
                col = format!("{}", color::Fg(color::Green));
            }
            result.push_str(&format!(
                "{r}{sym}{a:08x}{n} │ {col}{o:<6}{n}│{col} {i:<35}{n}║\n",
                n = color::Fg(color::Reset),
                col = col,
                o = out,
                i = line.2,
                a = line.0,
                r = cursor::Goto(37, (j + 5) as u16),
                sym = symbol,
            ));
        }
        result.push_str(&format!(
            "{r}══════════╧═══════╧════════════════════════════════════╝\n",
            r = cursor::Goto(37, (self.disassembly.len() + 5) as u16)
        ));
        write!(f, "{}", result)
    }
}

pub struct Debugger {
    disassembly: Disassembly,
    code_running: bool,
    last_cmd: DebugCommand,
    variables: HashSet<u32>,
}

#[derive(PartialEq, Clone)]
enum DebugCommand {
    Quit,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Continue,
    Step,
    Jump(Option<String>),
    Watch(Option<String>),
    Unwatch(Option<String>),
}

impl Debugger {
    pub fn new() -> Box<Self> {
        Box::new(Debugger {
            disassembly: Disassembly::new(12),
            code_running: false,
            last_cmd: DebugCommand::Step,
            variables: HashSet::new(),
        })
    }
    fn set_breakpoint(&mut self, breakpoint: &Option<String>, cpu: &mut CPU, delete: bool) {
        if let Some(address) = parse_address(breakpoint) {
            if delete {
                self.disassembly.breakpoints.remove(&address);
            } else {
                self.disassembly.breakpoints.insert(address);
            }
            self.draw_user_interface(cpu);
            if delete {
                println!("Breakpoint deleted.");
            } else {
                println!("Breakpoint created.");
            }
        } else {
            self.draw_user_interface(cpu);
            println!("Invalid address!");
        }
    }
    fn watch_address(&mut self, address: &Option<String>, cpu: &mut CPU, watch: bool) {
        if let Some(address) = parse_address(address) {
            if watch {
                self.variables.insert(address);
            } else {
                self.variables.remove(&address);
            }
            self.draw_user_interface(cpu);
        } else {
            self.draw_user_interface(cpu);
            println!("Invalid address!");
        }
    }
    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        io::stdin().read_line(&mut input).unwrap();
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("b") => DebugCommand::SetBreakpoint(cmd.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(cmd.next().map(String::from)),
            Some("j") => DebugCommand::Jump(cmd.next().map(String::from)),
            Some("w") => DebugCommand::Watch(cmd.next().map(String::from)),
            Some("u") => DebugCommand::Unwatch(cmd.next().map(String::from)),
            Some("c") => DebugCommand::Continue,
            _ => self.last_cmd.clone(),
        }
    }
    fn draw_user_interface(&mut self, cpu: &mut CPU) {
        println!("{}", clear::All);
        print!("{c}{tl}{cpu}", c = clear::All, tl = cursor::Goto(1, 1), cpu = cpu);
        print!("{tr}{dis}", tr = cursor::Goto(10, 10), dis = self.disassembly);
        if !self.variables.is_empty() {
            println!(
                "{r}Watched memory locations",
                r = cursor::Goto(1, 6 + self.disassembly.length as u16)
            );
            for var in self.variables.iter() {
                match cpu.bus.borrow_mut().try_read(*var & 0x1fffffff, Size::Long) {
                    Some(value) => println!("{:08x}: {}", var, value),
                    None => println!("{:08x}: <unmapped>", var),
                }
            }
        }
        println!("{r}\nDebugger attached. Enter n to single step, c to continue, b/d <addr> to enter/delete a breakpoint at addr, j <addr> to jump to <addr> or q to quit.",
            r = cursor::Goto(1, (7 + self.disassembly.length + self.variables.len()) as u16));
        print!("{r}> ", r = cursor::Goto(1, (9 + self.disassembly.length + self.variables.len()) as u16));
        io::stdout().flush().expect("");
    }
    pub fn update(&mut self, cpu: &mut CPU) -> Signal {
        if !self.code_running || self.disassembly.breakpoints.contains(&cpu.reg[Reg::PC]) {
            self.code_running = false;
            self.disassembly.update(cpu);
            self.draw_user_interface(cpu);
            let cmd = self.get_command();
            match &cmd {
                DebugCommand::Quit => Signal::Quit,
                DebugCommand::SetBreakpoint(b) => {
                    self.set_breakpoint(&b, cpu, false);
                    Signal::NoOp
                }
                DebugCommand::DeleteBreakpoint(b) => {
                    self.set_breakpoint(&b, cpu, true);
                    Signal::NoOp
                }
                DebugCommand::Watch(a) => {
                    self.watch_address(&a, cpu, true);
                    Signal::NoOp
                }
                DebugCommand::Unwatch(a) => {
                    self.watch_address(&a, cpu, false);
                    Signal::NoOp
                }
                DebugCommand::Continue => {
                    self.code_running = true;
                    Signal::Ok
                }
                DebugCommand::Step => {
                    self.last_cmd = cmd;
                    Signal::Ok
                }
                DebugCommand::Jump(a) => {
                    if let Some(address) = parse_address(a) {
                        cpu.reg[Reg::PC] = address;
                        cpu.delayed_branch = false;
                        self.last_cmd = cmd;
                        Signal::Ok
                    } else {
                        Signal::NoOp
                    }
                }
            }
        } else {
            Signal::Ok
        }
    }
}

fn parse_address(address: &Option<String>) -> Option<u32> {
    match address {
        Some(addr) => u32::from_str_radix(&addr.trim_start_matches("0x"), 16).ok(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamcast;

    fn test_cpu() -> CPU {
        let config = dreamcast::bare_console();
        CPU::new(
            std::rc::Rc::new(std::cell::RefCell::new(config.bus)),
            config.sched,
            config.holly,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn rb_flip_swaps_and_restores_general_registers() {
        let mut cpu = test_cpu();
        let sr = cpu.reg[Reg::SR];
        for j in 0..8 {
            cpu.set_r(j, 0x1000 + j as u32);
            cpu.set_bank_r(j, 0x2000 + j as u32);
        }
        cpu.set_sr(sr ^ SR_RB);
        for j in 0..8 {
            assert_eq!(cpu.r(j), 0x2000 + j as u32);
        }
        cpu.set_sr(sr);
        for j in 0..8 {
            assert_eq!(cpu.r(j), 0x1000 + j as u32);
            assert_eq!(cpu.bank_r(j), 0x2000 + j as u32);
        }
    }

    #[test]
    fn fr_flip_swaps_and_restores_float_banks() {
        let mut cpu = test_cpu();
        let fpscr = cpu.reg[Reg::FPSCR];
        for j in 0..16 {
            cpu.set_fr_bits(j, 0xaa00 + j as u32);
            cpu.set_xf_bits(j, 0xbb00 + j as u32);
        }
        cpu.set_fpscr(fpscr ^ FPSCR_FR);
        for j in 0..16 {
            assert_eq!(cpu.fr_bits(j), 0xbb00 + j as u32);
        }
        cpu.set_fpscr(fpscr);
        for j in 0..16 {
            assert_eq!(cpu.fr_bits(j), 0xaa00 + j as u32);
            assert_eq!(cpu.xf_bits(j), 0xbb00 + j as u32);
        }
    }

    #[test]
    fn double_registers_swap_words() {
        let mut cpu = test_cpu();
        let pattern = f64::from_bits(0x0123456789abcdef);
        cpu.set_dr(2, pattern);
        assert_eq!(cpu.dr(2), pattern);
        // halves come back transposed when read as singles
        assert_eq!(cpu.fr_bits(2), 0x01234567);
        assert_eq!(cpu.fr_bits(3), 0x89abcdef);
    }

    #[test]
    fn exception_entry_sets_banked_privileged_state() {
        let mut cpu = test_cpu();
        cpu.set_sr(0x000000f0); // user mode, bank 0, interrupts masked
        cpu.reg[Reg::PC] = 0x8c001234;
        cpu.reg[Reg::VBR] = 0x8c000000;
        cpu.set_r(15, 0xdeadbeef);
        cpu.set_exception(Exception::GenIllegalInst);
        assert_eq!(cpu.reg[Reg::SPC], 0x8c001234);
        assert_eq!(cpu.reg[Reg::SSR], 0x000000f0);
        assert_eq!(cpu.reg[Reg::SGR], 0xdeadbeef);
        assert!(cpu.sr_bit(SR_BL) && cpu.sr_bit(SR_MD) && cpu.sr_bit(SR_RB));
        assert_eq!(cpu.reg[Reg::PC], 0x8c000100);
        assert_eq!(cpu.reg[Reg::EXPEVT], 0x180);
    }

    #[test]
    fn irl_bus_encoding_selects_ext_code_and_priority() {
        let mut cpu = test_cpu();
        cpu.set_sr(RESET_SR & !SR_BL & !SR_IMASK);
        cpu.set_irl_interrupt(0x9); // level 6 on the encoded bus
        let (line, code, prio) = cpu.next_irq().expect("interrupt should be pending");
        assert_eq!(line, None);
        assert_eq!(code, Exception::Ext(9));
        assert_eq!(prio, 6);
        // masked out by IMASK >= priority
        cpu.set_sr((cpu.reg[Reg::SR] & !SR_IMASK) | (6 << 4));
        assert!(cpu.next_irq().is_none());
    }

    #[test]
    fn independent_irl_lines_use_their_fixed_codes() {
        let mut cpu = test_cpu();
        cpu.set_sr(RESET_SR & !SR_BL & !SR_IMASK);
        cpu.reg[Reg::ICR] = 1 << 7; // IRLM: four independent lines
        cpu.reg[Reg::IPRD] = 0x4321;
        let cases = [
            (0xe, IrqLine::Irl0, Exception::Ext(2), 4),
            (0xd, IrqLine::Irl1, Exception::Ext(5), 3),
            (0xb, IrqLine::Irl2, Exception::Ext(8), 2),
            (0x7, IrqLine::Irl3, Exception::Ext(11), 1),
        ];
        for (irl_val, line, code, prio) in cases.iter() {
            cpu.set_irl_interrupt(*irl_val);
            let (got_line, got_code, got_prio) =
                cpu.next_irq().expect("line should be pending");
            assert_eq!(got_line, Some(*line as usize));
            assert_eq!(got_code, *code);
            assert_eq!(got_prio, *prio);
        }
    }
}
