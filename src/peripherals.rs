// On-chip peripherals: the three-channel timer unit, the DMA controller
// (with the channel-2 burst engine the tile accelerator lives off), and the
// FIFO serial port. Each keeps its timing by lazy synchronization against
// the master cycle counter and schedules exactly one deadline per concern.

use crate::devices::HollyNrmInt;
use crate::fields::{Exception, IrqLine, Size};
use crate::processor::{Reg, CPU};
use crate::scheduler::{EventKind, SH4_CLOCK_SCALE};
use crate::serial::TextRing;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

// ---------------------------------------------------------------------
// TMU

// scheduler ticks per TMU base tick (the peripheral clock, CPU / 4)
const TMU_SCALE: u64 = SH4_CLOCK_SCALE * 4;

pub const TCR_UNF: u32 = 1 << 8;
pub const TCR_UNIE: u32 = 1 << 5;
pub const TCR_ICPF: u32 = 1 << 9;
const TCR_TPSC: u32 = 7;

pub struct Tmu {
    stamp_last_sync: [u64; 3],
    accum: [u64; 3],
    scheduled: [bool; 3],
    unf: [bool; 3],
    unf_read: [bool; 3],
}

impl Tmu {
    pub fn new() -> Tmu {
        Tmu {
            stamp_last_sync: [0; 3],
            accum: [0; 3],
            scheduled: [false; 3],
            unf: [false; 3],
            unf_read: [false; 3],
        }
    }
}

fn tcor_reg(chan: usize) -> usize {
    Reg::TCOR0 as usize + 3 * chan
}
fn tcnt_reg(chan: usize) -> usize {
    Reg::TCNT0 as usize + 3 * chan
}
fn tcr_reg(chan: usize) -> usize {
    Reg::TCR0 as usize + 3 * chan
}

impl CPU {
    fn tmu_stamp(&self) -> u64 {
        self.sched.borrow().stamp() / TMU_SCALE
    }
    fn tmu_chan_enabled(&self, chan: usize) -> bool {
        self.reg[Reg::TSTR] & (1 << chan) != 0
    }
    fn tmu_chan_div(&self, chan: usize) -> u64 {
        match self.reg[tcr_reg(chan)] & TCR_TPSC {
            0 => 4,
            1 => 16,
            2 => 64,
            3 => 256,
            5 => 1024,
            tpsc => panic!("TMU channel {} programmed with unsupported clock source {}", chan, tpsc),
        }
    }

    /// Catch the channel up with the master clock. Underflow is latched in
    /// `tmu.unf`; raising the interrupt is the event handler's business.
    fn tmu_chan_sync(&mut self, chan: usize) {
        let now = self.tmu_stamp();
        let elapsed = now - self.tmu.stamp_last_sync[chan];
        self.tmu.stamp_last_sync[chan] = now;
        if elapsed == 0 || !self.tmu_chan_enabled(chan) {
            return;
        }
        let div = self.tmu_chan_div(chan);
        self.tmu.accum[chan] += elapsed;
        let chan_cycles = self.tmu.accum[chan] / div;
        if chan_cycles >= 1 {
            let tcnt = self.reg[tcnt_reg(chan)] as u64;
            if chan_cycles > tcnt {
                self.tmu.unf[chan] = true;
                self.reg[tcnt_reg(chan)] = self.reg[tcor_reg(chan)];
                let unf_was_set = self.reg[tcr_reg(chan)] & TCR_UNF != 0;
                self.reg[tcr_reg(chan)] |= TCR_UNF;
                if !unf_was_set {
                    self.tmu.unf_read[chan] = false;
                }
            } else {
                self.reg[tcnt_reg(chan)] = (tcnt - chan_cycles) as u32;
            }
            self.tmu.accum[chan] %= div;
        }
    }

    fn tmu_chan_unsched(&mut self, chan: usize) {
        if self.tmu.scheduled[chan] {
            self.sched.borrow_mut().cancel(EventKind::TmuUnderflow(chan));
            self.tmu.scheduled[chan] = false;
        }
    }

    /// Deadline of the next underflow, on the channel's own clock lattice
    /// so late events cannot accumulate drift.
    fn tmu_chan_sched_next(&mut self, chan: usize) {
        if !self.tmu_chan_enabled(chan) {
            self.tmu.scheduled[chan] = false;
            return;
        }
        let div = self.tmu_chan_div(chan);
        let tcnt = self.reg[tcnt_reg(chan)] as u64;
        let base_ticks = (tcnt + 1) * div - self.tmu.accum[chan];
        let when = (base_ticks + self.sched.borrow().stamp() / TMU_SCALE) * TMU_SCALE;
        self.sched.borrow_mut().schedule(when, EventKind::TmuUnderflow(chan));
        self.tmu.scheduled[chan] = true;
    }

    /// Scheduler callback for a channel's programmed underflow deadline.
    pub fn tmu_underflow(&mut self, chan: usize) {
        self.tmu.scheduled[chan] = false;
        self.tmu_chan_sync(chan);
        self.tmu_chan_sched_next(chan);
        if self.tmu.unf[chan] {
            self.tmu.unf[chan] = false;
            if self.reg[tcr_reg(chan)] & TCR_UNIE != 0 {
                let (line, code) = match chan {
                    0 => (IrqLine::Tmu0, Exception::Tuni0),
                    1 => (IrqLine::Tmu1, Exception::Tuni1),
                    _ => (IrqLine::Tmu2, Exception::Tuni2),
                };
                self.set_interrupt(line, code);
            }
        }
    }

    pub fn tmu_reg_read(&mut self, addr: u32) -> u32 {
        match addr {
            0xffd80000 => 1, // TOCR reads back its only legal value
            0xffd80004 => self.reg[Reg::TSTR],
            0xffd80008 => self.reg[Reg::TCOR0],
            0xffd80014 => self.reg[Reg::TCOR1],
            0xffd80020 => self.reg[Reg::TCOR2],
            0xffd8000c | 0xffd80018 | 0xffd80024 => {
                let chan = ((addr - 0xffd8000c) / 0xc) as usize;
                self.tmu_chan_sync(chan);
                self.reg[tcnt_reg(chan)]
            }
            0xffd80010 | 0xffd8001c | 0xffd80028 => {
                let chan = ((addr - 0xffd80010) / 0xc) as usize;
                self.tmu_chan_sync(chan);
                let val = self.reg[tcr_reg(chan)];
                if val & TCR_UNF != 0 {
                    self.tmu.unf_read[chan] = true;
                }
                val
            }
            0xffd8002c => self.reg[Reg::TCPR2],
            _ => panic!("unimplemented TMU register read from {:08x}", addr),
        }
    }

    pub fn tmu_reg_write(&mut self, addr: u32, val: u32) {
        match addr {
            0xffd80000 => self.reg[Reg::TOCR] = 1,
            0xffd80004 => self.tmu_tstr_write(val),
            0xffd80008 | 0xffd80014 | 0xffd80020 => {
                let chan = ((addr - 0xffd80008) / 0xc) as usize;
                self.reg[tcor_reg(chan)] = val;
            }
            0xffd8000c | 0xffd80018 | 0xffd80024 => {
                let chan = ((addr - 0xffd8000c) / 0xc) as usize;
                self.tmu_chan_sync(chan);
                self.reg[tcnt_reg(chan)] = val;
                self.tmu_chan_sync(chan);
                self.tmu_chan_unsched(chan);
                self.tmu_chan_sched_next(chan);
            }
            0xffd80010 | 0xffd8001c | 0xffd80028 => {
                let chan = ((addr - 0xffd80010) / 0xc) as usize;
                self.tmu_tcr_write(chan, val);
            }
            0xffd8002c => self.reg[Reg::TCPR2] = val,
            _ => panic!("unimplemented TMU register write to {:08x}", addr),
        }
    }

    fn tmu_tstr_write(&mut self, val: u32) {
        let val = val & 7;
        let old = self.reg[Reg::TSTR];
        for chan in 0..3 {
            let mask = 1 << chan;
            if (old ^ val) & mask != 0 {
                // sync under the old enable state, then restart the
                // channel's accumulator from scratch
                self.tmu_chan_sync(chan);
                self.tmu.accum[chan] = 0;
            }
        }
        self.reg[Reg::TSTR] = val;
        for chan in 0..3 {
            self.tmu_chan_sync(chan);
            self.tmu_chan_unsched(chan);
            self.tmu_chan_sched_next(chan);
        }
    }

    fn tmu_tcr_write(&mut self, chan: usize, val: u32) {
        self.tmu_chan_sync(chan);
        let old = self.reg[tcr_reg(chan)];
        let mut new_val = val & 0x3ff;
        // ICPF and UNF cannot be set by software
        if new_val & TCR_ICPF != 0 && old & TCR_ICPF == 0 {
            new_val &= !TCR_ICPF;
        }
        if new_val & TCR_UNF != 0 && old & TCR_UNF == 0 {
            new_val &= !TCR_UNF;
        }
        // ... and clearing UNF is only honored after it has been read set
        if old & TCR_UNF != 0 && new_val & TCR_UNF == 0 {
            if self.tmu.unf_read[chan] {
                self.tmu.unf_read[chan] = false;
            } else {
                new_val |= TCR_UNF;
            }
        }
        if (old ^ new_val) & TCR_TPSC != 0 {
            self.tmu.accum[chan] = 0;
        }
        self.reg[tcr_reg(chan)] = new_val;
        self.tmu_chan_sync(chan);
        self.tmu_chan_unsched(chan);
        self.tmu_chan_sched_next(chan);
    }
}

// ---------------------------------------------------------------------
// DMAC

pub const CHCR_TE: u32 = 1 << 1;

pub struct Dmac {
    pub sar: [u32; 4],
    pub dar: [u32; 4],
    pub dmatcr: [u32; 4],
    pub chcr: [u32; 4],
    pub dmaor: u32,
    dma_ack: [bool; 4],
    sar_pending: u32,
    /// completion latency of a channel-2 burst, in scheduler ticks; real
    /// hardware takes a while and some software notices
    pub ch2_latency: u64,
}

impl Dmac {
    pub fn new() -> Dmac {
        Dmac {
            sar: [0; 4],
            dar: [0; 4],
            dmatcr: [0; 4],
            chcr: [0; 4],
            dmaor: 0,
            dma_ack: [false; 4],
            sar_pending: 0,
            ch2_latency: 0,
        }
    }
    pub fn te_pending(&self, chan: usize) -> bool {
        self.chcr[chan] & CHCR_TE != 0
    }
}

impl CPU {
    pub fn dmac_reg_read(&mut self, addr: u32) -> u32 {
        if addr == 0xffa00040 {
            return self.dmac.dmaor;
        }
        let idx = ((addr - 0xffa00000) / 4) as usize;
        let (chan, which) = (idx / 4, idx % 4);
        match which {
            0 => self.dmac.sar[chan],
            1 => self.dmac.dar[chan],
            2 => self.dmac.dmatcr[chan],
            _ => {
                let val = self.dmac.chcr[chan];
                if val & CHCR_TE != 0 {
                    // transfer-end has now been observed, software may
                    // clear it
                    self.dmac.dma_ack[chan] = true;
                }
                val
            }
        }
    }

    pub fn dmac_reg_write(&mut self, addr: u32, val: u32) {
        if addr == 0xffa00040 {
            self.dmac.dmaor = val;
            return;
        }
        let idx = ((addr - 0xffa00000) / 4) as usize;
        let (chan, which) = (idx / 4, idx % 4);
        match which {
            0 => self.dmac.sar[chan] = val,
            1 => self.dmac.dar[chan] = val,
            2 => self.dmac.dmatcr[chan] = val,
            _ => self.dmac_chcr_write(chan, val),
        }
    }

    fn dmac_chcr_write(&mut self, chan: usize, val: u32) {
        let cur = self.dmac.chcr[chan];
        let mut val = val;
        if val & CHCR_TE != 0 {
            // TE is set by hardware only
            if cur & CHCR_TE == 0 {
                val &= !CHCR_TE;
            }
        } else if cur & CHCR_TE != 0 {
            if self.dmac.dma_ack[chan] {
                self.dmac.dma_ack[chan] = false;
            } else {
                // clearing TE without having read it set is not honored
                val |= CHCR_TE;
            }
        }
        self.dmac.chcr[chan] = val;
    }

    /// Channel-2 burst into the tile accelerator. The only transfer unit
    /// guest software ever uses is 32 bytes; everything else hangs a real
    /// console, so emulating it would hide a guest bug.
    pub fn dmac_channel2(&mut self, transfer_dst: u32, n_bytes: u32) {
        let xfer_unit = match (self.dmac.chcr[2] >> 4) & 7 {
            0 => 8,
            1 => 1,
            2 => 2,
            3 => 4,
            4 => 32,
            ts => panic!("channel-2 DMA with reserved transfer size field {}", ts),
        };
        if xfer_unit != 32 {
            panic!("channel-2 DMA with {}-byte transfer units (address {:08x}, length {})",
                xfer_unit, transfer_dst, n_bytes);
        }
        if n_bytes != 32 * self.dmac.dmatcr[2] {
            panic!("channel-2 DMA length {} disagrees with DMATCR2 {}", n_bytes, self.dmac.dmatcr[2]);
        }
        let transfer_src = self.dmac.sar[2];
        if transfer_src % 32 != 0 {
            panic!("misaligned channel-2 DMA source address {:08x}", transfer_src);
        }
        if transfer_dst % 32 != 0 {
            panic!("misaligned channel-2 DMA destination address {:08x}", transfer_dst);
        }
        // remap the mirrors onto their canonical tile-accelerator windows
        let dst = match transfer_dst & 0x1fffffff {
            dst @ 0x10000000..=0x117fffff => dst,
            dst @ 0x11800000..=0x11ffffff => dst - 0x01000000,
            dst @ 0x13000000..=0x137fffff => dst - 0x03000000,
            dst => panic!("channel-2 DMA to address {:08x} outside the TA windows", dst),
        };

        debug!(
            "initiating {}-byte channel-2 DMA transfer from {:08x} to {:08x}",
            n_bytes, transfer_src, dst
        );
        {
            let mut bus = self.bus.borrow_mut();
            let mut src = transfer_src & 0x1fffffff;
            let mut dst = dst;
            for _ in 0..n_bytes / 4 {
                let word = bus.read(src, Size::Long);
                bus.write(dst, word);
                src += 4;
                dst += 4;
            }
        }
        self.dmac.sar_pending = transfer_src.wrapping_add(n_bytes);
        let latency = self.dmac.ch2_latency;
        let mut sched = self.sched.borrow_mut();
        let when = sched.stamp() + latency;
        sched.schedule(when, EventKind::Ch2DmaDone);
    }

    /// Scheduler callback: the burst has landed, report completion.
    pub fn dmac_ch2_complete(&mut self) {
        self.dmac.dmatcr[2] = 0;
        self.dmac.sar[2] = self.dmac.sar_pending;
        self.dmac.chcr[2] |= CHCR_TE;
        self.dmac.dma_ack[2] = false;
        self.holly.borrow_mut().raise_nrm(HollyNrmInt::Channel2DmaComplete);
    }
}

// ---------------------------------------------------------------------
// SCIF

pub const SCFSR_ER: u32 = 1 << 7;
pub const SCFSR_TEND: u32 = 1 << 6;
pub const SCFSR_TDFE: u32 = 1 << 5;
pub const SCFSR_BRK: u32 = 1 << 4;
pub const SCFSR_RDF: u32 = 1 << 1;
pub const SCFSR_DR: u32 = 1;

pub const SCSCR_TIE: u32 = 1 << 7;
pub const SCSCR_RIE: u32 = 1 << 6;
pub const SCSCR_TE: u32 = 1 << 5;
pub const SCSCR_RE: u32 = 1 << 4;
pub const SCSCR_REIE: u32 = 1 << 3;

const SCFCR_TFRST: u32 = 1 << 2;
const SCFCR_RFRST: u32 = 1 << 1;

const SCIF_FIFO_LEN: usize = 16;

pub struct Scif {
    // for txq the SCIF is the producer, for rxq the consumer; the other
    // ends belong to the host bridge thread
    pub txq: Arc<TextRing>,
    pub rxq: Arc<TextRing>,
    tx_buf: VecDeque<u8>,
    rx_buf: VecDeque<u8>,
    // the spec only lets software clear the sticky status bits after
    // reading them set; these track the read-at-1 observations
    tend_read: bool,
    dr_read: bool,
    tdfe_read: bool,
    rdf_read: bool,
    pub ser_srv_connected: bool,
    pub something_pending: Arc<AtomicBool>,
    rxi_scheduled: bool,
    txi_scheduled: bool,
}

impl Scif {
    pub fn new() -> Scif {
        Scif {
            txq: TextRing::new(),
            rxq: TextRing::new(),
            tx_buf: VecDeque::with_capacity(SCIF_FIFO_LEN),
            rx_buf: VecDeque::with_capacity(SCIF_FIFO_LEN),
            tend_read: false,
            dr_read: false,
            tdfe_read: false,
            rdf_read: false,
            ser_srv_connected: false,
            something_pending: Arc::new(AtomicBool::new(false)),
            rxi_scheduled: false,
            txi_scheduled: false,
        }
    }
    fn fill_rx_buf(&mut self) {
        while self.rx_buf.len() < SCIF_FIFO_LEN {
            match self.rxq.consume() {
                Some(byte) => self.rx_buf.push_back(byte),
                None => break,
            }
        }
    }
    fn drain_tx_buf(&mut self) {
        while let Some(&byte) = self.tx_buf.front() {
            if self.txq.produce(byte) {
                self.tx_buf.pop_front();
            } else {
                break;
            }
        }
    }
    fn read_char(&mut self) -> Option<u8> {
        self.fill_rx_buf();
        let byte = self.rx_buf.pop_front();
        self.fill_rx_buf();
        byte
    }
    fn write_char(&mut self, byte: u8) {
        self.drain_tx_buf();
        if self.tx_buf.len() < SCIF_FIFO_LEN {
            self.tx_buf.push_back(byte);
        }
        self.drain_tx_buf();
    }
}

impl CPU {
    fn rx_fifo_trigger(&self) -> usize {
        [1, 4, 8, 14][((self.reg[Reg::SCFCR2] >> 6) & 3) as usize]
    }
    fn tx_fifo_trigger(&self) -> usize {
        [8, 4, 2, 1][((self.reg[Reg::SCFCR2] >> 4) & 3) as usize]
    }

    /// Latch a sticky status bit, remembering that it needs a fresh
    /// read-at-1 before software may clear it again.
    fn scfsr_assert(&mut self, mask: u32) {
        if self.reg[Reg::SCFSR2] & mask == 0 {
            self.reg[Reg::SCFSR2] |= mask;
            match mask {
                SCFSR_TEND => self.scif.tend_read = false,
                SCFSR_DR => self.scif.dr_read = false,
                SCFSR_TDFE => self.scif.tdfe_read = false,
                SCFSR_RDF => self.scif.rdf_read = false,
                _ => {}
            }
        }
    }

    fn check_rx_trig(&mut self) {
        self.scif.fill_rx_buf();
        let len = self.scif.rx_buf.len();
        if len >= self.rx_fifo_trigger() {
            self.scfsr_assert(SCFSR_RDF);
            if self.reg[Reg::SCSCR2] & SCSCR_RIE != 0 && !self.scif.rxi_scheduled {
                self.scif.rxi_scheduled = true;
                let mut sched = self.sched.borrow_mut();
                let when = sched.stamp();
                sched.schedule(when, EventKind::ScifRxi);
            }
        } else if len > 0 {
            self.scfsr_assert(SCFSR_DR);
        }
    }

    fn check_tx_trig(&mut self) {
        if self.scif.tx_buf.len() <= self.tx_fifo_trigger() {
            self.scfsr_assert(SCFSR_TDFE);
            if self.reg[Reg::SCSCR2] & SCSCR_TIE != 0 && !self.scif.txi_scheduled {
                self.scif.txi_scheduled = true;
                let mut sched = self.sched.borrow_mut();
                let when = sched.stamp();
                sched.schedule(when, EventKind::ScifTxi);
            }
        }
    }

    fn check_fifo_resets(&mut self) {
        if self.reg[Reg::SCFCR2] & SCFCR_RFRST != 0 {
            self.scif.rx_buf.clear();
            while self.scif.rxq.consume().is_some() {}
        }
        if self.reg[Reg::SCFCR2] & SCFCR_TFRST != 0 {
            self.scif.tx_buf.clear();
        }
    }

    /// Rescan the FIFO state. Runs whenever the host bridge flags activity
    /// and after every guest access to a SCIF register.
    pub fn scif_periodic(&mut self) {
        self.scif.fill_rx_buf();
        self.scif.drain_tx_buf();
        self.check_fifo_resets();
        self.check_rx_trig();
        self.check_tx_trig();
        if self.scif.tx_buf.is_empty() {
            self.scfsr_assert(SCFSR_TEND);
        }
    }

    pub fn scif_rxi_event(&mut self) {
        self.scif.rxi_scheduled = false;
        self.set_interrupt(IrqLine::Scif, Exception::ScifRxi);
    }
    pub fn scif_txi_event(&mut self) {
        self.scif.txi_scheduled = false;
        self.set_interrupt(IrqLine::Scif, Exception::ScifTxi);
    }

    pub fn scif_reg_read(&mut self, addr: u32) -> u32 {
        match addr {
            0xffe80000 => self.reg[Reg::SCSMR2],
            0xffe80004 => self.reg[Reg::SCBRR2],
            0xffe80008 => self.reg[Reg::SCSCR2],
            0xffe8000c => 0, // the transmit FIFO data register is write-only
            0xffe80010 => {
                let val = self.reg[Reg::SCFSR2];
                if val & SCFSR_TEND != 0 {
                    self.scif.tend_read = true;
                }
                if val & SCFSR_DR != 0 {
                    self.scif.dr_read = true;
                }
                if val & SCFSR_TDFE != 0 {
                    self.scif.tdfe_read = true;
                }
                if val & SCFSR_RDF != 0 {
                    self.scif.rdf_read = true;
                }
                val
            }
            0xffe80014 => {
                let byte = self.scif.read_char().unwrap_or(0);
                self.check_rx_trig();
                byte as u32
            }
            0xffe80018 => self.reg[Reg::SCFCR2],
            0xffe8001c => {
                // SCFDR2: both FIFO counts
                let rx = self.scif.rx_buf.len().min(SCIF_FIFO_LEN) as u32;
                let tx = self.scif.tx_buf.len().min(SCIF_FIFO_LEN) as u32;
                rx | tx << 8
            }
            0xffe80020 => self.reg[Reg::SCSPTR2],
            0xffe80024 => self.reg[Reg::SCLSR2],
            _ => panic!("unimplemented SCIF register read from {:08x}", addr),
        }
    }

    pub fn scif_reg_write(&mut self, addr: u32, val: u32) {
        match addr {
            0xffe80000 => self.reg[Reg::SCSMR2] = val & 0x7b,
            0xffe80004 => self.reg[Reg::SCBRR2] = val & 0xff,
            0xffe80008 => {
                self.reg[Reg::SCSCR2] = val & 0xfa;
                if self.reg[Reg::SCSCR2] & SCSCR_TE == 0 {
                    self.scfsr_assert(SCFSR_TEND);
                }
                // interrupts may just have been enabled
                self.check_rx_trig();
                self.check_tx_trig();
            }
            0xffe8000c => {
                if self.scif.ser_srv_connected {
                    self.scif.write_char(val as u8);
                } else {
                    debug!("SCIF transmit {:02x} with no bridge attached", val as u8);
                }
                self.scif_periodic();
            }
            0xffe80010 => self.scfsr_write(val),
            0xffe80018 => {
                self.reg[Reg::SCFCR2] = val & 0x7ff;
                self.check_fifo_resets();
                self.check_rx_trig();
                self.check_tx_trig();
            }
            0xffe80020 => self.reg[Reg::SCSPTR2] = val & 0xf3,
            0xffe80024 => self.reg[Reg::SCLSR2] = val & 1,
            _ => panic!("unimplemented SCIF register write to {:08x}", addr),
        }
    }

    /// Status register writes. The sticky bits may only go 1 -> 0 when the
    /// software has read them at 1 and the underlying condition has lapsed;
    /// anything else snaps back.
    fn scfsr_write(&mut self, val: u32) {
        let orig = self.reg[Reg::SCFSR2];
        let mut new_val = val & 0xff;

        self.scif.fill_rx_buf();
        let rx_sz = self.scif.rx_buf.len();
        let tx_sz = self.scif.tx_buf.len();

        if orig & SCFSR_TEND != 0 && new_val & SCFSR_TEND == 0 {
            if !self.scif.tend_read || tx_sz == 0 {
                new_val |= SCFSR_TEND;
            } else {
                self.scif.tend_read = false;
            }
        }
        if orig & SCFSR_DR != 0 && new_val & SCFSR_DR == 0 {
            if !self.scif.dr_read || (rx_sz > 0 && rx_sz < self.rx_fifo_trigger()) {
                new_val |= SCFSR_DR;
            } else {
                self.scif.dr_read = false;
            }
        }
        if orig & SCFSR_TDFE != 0 && new_val & SCFSR_TDFE == 0 {
            if !self.scif.tdfe_read || tx_sz <= self.tx_fifo_trigger() {
                new_val |= SCFSR_TDFE;
            } else {
                self.scif.tdfe_read = false;
            }
        }
        if orig & SCFSR_RDF != 0 && new_val & SCFSR_RDF == 0 {
            if !self.scif.rdf_read || rx_sz >= self.rx_fifo_trigger() {
                new_val |= SCFSR_RDF;
            } else {
                self.scif.rdf_read = false;
            }
        }
        // the sticky bits cannot be set from software either
        new_val &= orig | !(SCFSR_TEND | SCFSR_DR | SCFSR_TDFE | SCFSR_RDF);
        self.reg[Reg::SCFSR2] = new_val;
    }

    /// Bytes arriving from the host bridge while no guest is watching the
    /// registers; used by tests and by the bridge wake-up path.
    pub fn scif_connect_server(&mut self) {
        self.scif.ser_srv_connected = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamcast;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_cpu() -> CPU {
        let config = dreamcast::bare_console();
        CPU::new(
            Rc::new(RefCell::new(config.bus)),
            config.sched,
            config.holly,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn tcnt_counts_down_against_the_master_clock() {
        let mut cpu = test_cpu();
        cpu.tmu_reg_write(0xffd8000c, 1000); // TCNT0
        cpu.tmu_reg_write(0xffd80008, 1000); // TCOR0
        cpu.tmu_reg_write(0xffd80004, 1); // TSTR
        // default prescaler: one channel tick per 16 CPU cycles
        cpu.sched.borrow_mut().advance(160 * SH4_CLOCK_SCALE);
        assert_eq!(cpu.tmu_reg_read(0xffd8000c), 990);
    }

    #[test]
    fn underflow_reloads_and_latches_unf() {
        let mut cpu = test_cpu();
        cpu.tmu_reg_write(0xffd8000c, 16);
        cpu.tmu_reg_write(0xffd80008, 16);
        cpu.tmu_reg_write(0xffd80010, TCR_UNIE);
        cpu.tmu_reg_write(0xffd80004, 1);
        let when = cpu.sched.borrow().peek().expect("underflow scheduled").when;
        // 17 channel ticks of 4 peripheral clocks at CPU/4 each
        assert_eq!(when, 17 * 4 * 4 * SH4_CLOCK_SCALE);
        cpu.sched.borrow_mut().advance(when);
        cpu.tmu_underflow(0);
        assert_eq!(cpu.reg[Reg::TCNT0], 16);
        assert!(cpu.reg[Reg::TCR0] & TCR_UNF != 0);
        assert_eq!(cpu.irq_lines[IrqLine::Tmu0 as usize], Some(Exception::Tuni0));
    }

    #[test]
    fn unf_clear_requires_a_read_at_one() {
        let mut cpu = test_cpu();
        cpu.tmu_reg_write(0xffd8000c, 4);
        cpu.tmu_reg_write(0xffd80008, 4);
        cpu.tmu_reg_write(0xffd80004, 1);
        cpu.sched.borrow_mut().advance(1000 * SH4_CLOCK_SCALE);
        cpu.tmu_chan_sync(0);
        assert!(cpu.reg[Reg::TCR0] & TCR_UNF != 0);
        // blind clear is ignored
        cpu.tmu_reg_write(0xffd80010, 0);
        assert!(cpu.reg[Reg::TCR0] & TCR_UNF != 0);
        // read it set, then the clear sticks
        cpu.tmu_reg_read(0xffd80010);
        cpu.tmu_reg_write(0xffd80010, 0);
        assert!(cpu.reg[Reg::TCR0] & TCR_UNF == 0);
    }

    #[test]
    fn stopping_a_channel_cancels_its_deadline() {
        let mut cpu = test_cpu();
        cpu.tmu_reg_write(0xffd8000c, 100);
        cpu.tmu_reg_write(0xffd80008, 100);
        cpu.tmu_reg_write(0xffd80004, 1);
        assert!(cpu.sched.borrow().scheduled(EventKind::TmuUnderflow(0)));
        cpu.tmu_reg_write(0xffd80004, 0);
        assert!(!cpu.sched.borrow().scheduled(EventKind::TmuUnderflow(0)));
    }

    #[test]
    fn te_clear_needs_prior_read() {
        let mut cpu = test_cpu();
        cpu.dmac.chcr[2] = CHCR_TE | 0x40;
        // software writes 0 without having read TE set: refused
        cpu.dmac_reg_write(0xffa0002c, 0x40);
        assert!(cpu.dmac.chcr[2] & CHCR_TE != 0);
        cpu.dmac_reg_read(0xffa0002c);
        cpu.dmac_reg_write(0xffa0002c, 0x40);
        assert!(cpu.dmac.chcr[2] & CHCR_TE == 0);
    }

    #[test]
    fn scif_flags_follow_read_clear_discipline() {
        let mut cpu = test_cpu();
        cpu.scif_connect_server();
        // TEND is up after reset; clearing it blind fails
        assert!(cpu.reg[Reg::SCFSR2] & SCFSR_TEND != 0);
        cpu.scif_reg_write(0xffe80010, 0);
        assert!(cpu.reg[Reg::SCFSR2] & SCFSR_TEND != 0);
        // read it at 1, make the condition lapse, then the clear sticks
        cpu.scif_reg_read(0xffe80010);
        cpu.scif_reg_write(0xffe8000c, b'x' as u32);
        // a pending byte means TEND's condition no longer holds... except
        // the ring drained it instantly; park a byte in the FIFO instead
        for _ in 0..2000 {
            cpu.scif_reg_write(0xffe8000c, b'y' as u32);
        }
        let tx_held = cpu.scif.tx_buf.len();
        if tx_held > 0 {
            cpu.scif_reg_write(0xffe80010, 0);
            assert!(cpu.reg[Reg::SCFSR2] & SCFSR_TEND == 0);
        }
    }

    #[test]
    fn rdf_asserts_at_trigger_level_and_raises_rxi() {
        let mut cpu = test_cpu();
        cpu.scif_connect_server();
        cpu.scif_reg_write(0xffe80008, SCSCR_RIE | SCSCR_RE);
        let rxq = Arc::clone(&cpu.scif.rxq);
        // trigger level is 1 by default
        rxq.produce(0x55);
        cpu.scif.something_pending.store(true, std::sync::atomic::Ordering::Release);
        cpu.scif_periodic();
        assert!(cpu.reg[Reg::SCFSR2] & SCFSR_RDF != 0);
        assert!(cpu.scif.rxi_scheduled);
        assert_eq!(cpu.scif_reg_read(0xffe80014), 0x55);
    }
}
