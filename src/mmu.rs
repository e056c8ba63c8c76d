// Address translation. A 64-entry unified TLB serves data accesses and
// backfills the 4-entry instruction TLB. All the faulting paths store the
// failing VPN into PTEH and the failing address into TEA before bubbling the
// exception up to the dispatch loop.

use crate::fields::Exception;
use crate::processor::{CPU, MMUCR_SV, MMUCR_TI, Reg, SR_MD};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PageSz {
    OneK = 0,
    FourK = 1,
    SixtyFourK = 2,
    OneMeg = 3,
}

impl PageSz {
    pub fn from_bits(bits: u32) -> PageSz {
        match bits & 3 {
            0 => PageSz::OneK,
            1 => PageSz::FourK,
            2 => PageSz::SixtyFourK,
            _ => PageSz::OneMeg,
        }
    }
    pub fn vpn_mask(&self) -> u32 {
        !self.offset_mask()
    }
    pub fn ppn_mask(&self) -> u32 {
        !self.offset_mask()
    }
    pub fn offset_mask(&self) -> u32 {
        match *self {
            PageSz::OneK => 0x3ff,
            PageSz::FourK => 0xfff,
            PageSz::SixtyFourK => 0xffff,
            PageSz::OneMeg => 0xfffff,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TlbEnt {
    pub asid: u8,
    pub vpn: u32,
    pub ppn: u32,
    pub sz: PageSz,
    pub valid: bool,
    pub shared: bool,
    pub cacheable: bool,
    pub dirty: bool,
    pub wt: bool,
    pub protection: u8,
    pub sa: u8,
    pub tc: bool,
}

impl Default for TlbEnt {
    fn default() -> TlbEnt {
        TlbEnt {
            asid: 0,
            vpn: 0,
            ppn: 0,
            sz: PageSz::OneK,
            valid: false,
            shared: false,
            cacheable: false,
            dirty: false,
            wt: false,
            protection: 0,
            sa: 0,
            tc: false,
        }
    }
}

impl TlbEnt {
    pub fn translate(&self, vaddr: u32) -> u32 {
        (self.ppn & self.sz.ppn_mask()) | (vaddr & self.sz.offset_mask())
    }
}

// ITLB LRU state: MMUCR.LRUI is six pairwise comparison bits, one per pair
// of entries. Bit assignments (msb first): (0,1) (0,2) (0,3) (1,2) (1,3)
// (2,3); a set bit means the second entry of the pair was used more
// recently.
const LRUI_REPLACE_MASK: [u32; 4] = [0b111000, 0b100110, 0b010101, 0b001011];
const LRUI_REPLACE_VAL: [u32; 4] = [0b111000, 0b000110, 0b000001, 0b000000];
const LRUI_USE_AND: [u32; 4] = [0b000111, 0b111001, 0b111110, 0b111111];
const LRUI_USE_OR: [u32; 4] = [0b000000, 0b100000, 0b010100, 0b001011];

const LRUI_SHIFT: u32 = 26;
const URC_SHIFT: u32 = 10;
const URB_SHIFT: u32 = 18;

impl CPU {
    fn mmu_asid(&self) -> u8 {
        self.reg[Reg::PTEH] as u8
    }

    /// ASID participation rule: shared pages always match, and in
    /// single-VM privileged operation the ASID is ignored entirely.
    fn asid_matters(&self, shared: bool) -> bool {
        !shared
            && (self.reg[Reg::MMUCR] & MMUCR_SV == 0 || self.reg[Reg::SR] & SR_MD == 0)
    }

    fn bump_urc(&mut self) {
        let mmucr = self.reg[Reg::MMUCR];
        let urb = (mmucr >> URB_SHIFT) & 0x3f;
        let mut urc = (mmucr >> URC_SHIFT) & 0x3f;
        urc = if urb != 0 && urc + 1 >= urb { 0 } else { (urc + 1) & 0x3f };
        self.reg[Reg::MMUCR] = (mmucr & !(0x3f << URC_SHIFT)) | (urc << URC_SHIFT);
    }

    fn utlb_find(&mut self, vaddr: u32) -> Result<Option<usize>, Exception> {
        let asid = self.mmu_asid();
        let mut found = None;
        for idx in 0..self.utlb.len() {
            let ent = &self.utlb[idx];
            if !ent.valid {
                continue;
            }
            let mask = ent.sz.vpn_mask();
            if (ent.vpn & mask) == (vaddr & mask)
                && (!self.asid_matters(ent.shared) || ent.asid == asid)
            {
                if found.is_some() {
                    return Err(Exception::DataTlbMultiHit);
                }
                found = Some(idx);
            }
        }
        self.bump_urc();
        Ok(found)
    }

    fn itlb_find(&mut self, vaddr: u32) -> Result<Option<usize>, Exception> {
        let asid = self.mmu_asid();
        let mut found = None;
        for idx in 0..self.itlb.len() {
            let ent = &self.itlb[idx];
            if !ent.valid {
                continue;
            }
            let mask = ent.sz.vpn_mask();
            if (ent.vpn & mask) == (vaddr & mask)
                && (!self.asid_matters(ent.shared) || ent.asid == asid)
            {
                if found.is_some() {
                    return Err(Exception::InstTlbMultiHit);
                }
                found = Some(idx);
            }
        }
        Ok(found)
    }

    fn tlb_fault(&mut self, vaddr: u32, excp: Exception) -> Exception {
        self.reg[Reg::PTEH] = (self.reg[Reg::PTEH] & 0x3ff) | (vaddr & 0xfffffc00);
        self.reg[Reg::TEA] = vaddr;
        excp
    }

    /// Translate a data access through the UTLB, including the protection
    /// ladder and the initial-page-write check.
    pub fn translate_data(&mut self, vaddr: u32, write: bool) -> Result<u32, Exception> {
        let idx = match self.utlb_find(vaddr) {
            Ok(Some(idx)) => idx,
            Ok(None) => {
                let excp = if write {
                    Exception::DataTlbWriteMiss
                } else {
                    Exception::DataTlbReadMiss
                };
                return Err(self.tlb_fault(vaddr, excp));
            }
            Err(excp) => {
                self.reg[Reg::TEA] = vaddr;
                return Err(excp);
            }
        };
        let ent = self.utlb[idx];
        let privileged = self.reg[Reg::SR] & SR_MD != 0;
        // protection: 0 = privileged r/o, 1 = privileged r/w,
        //             2 = user r/o,       3 = user r/w
        if write {
            let allowed = if privileged { ent.protection & 1 != 0 } else { ent.protection == 3 };
            if !allowed {
                return Err(self.tlb_fault(vaddr, Exception::DataTlbWriteProtViol));
            }
            if !ent.dirty {
                return Err(self.tlb_fault(vaddr, Exception::InitialPageWrite));
            }
        } else if !privileged && ent.protection & 2 == 0 {
            return Err(self.tlb_fault(vaddr, Exception::DataTlbReadProtViol));
        }
        Ok(ent.translate(vaddr))
    }

    /// Translate an instruction fetch through the ITLB, refilling from the
    /// UTLB on a miss.
    pub fn translate_inst(&mut self, vaddr: u32) -> Result<u32, Exception> {
        for _ in 0..2 {
            match self.itlb_find(vaddr) {
                Ok(Some(idx)) => {
                    let ent = self.itlb[idx];
                    let privileged = self.reg[Reg::SR] & SR_MD != 0;
                    if !privileged && ent.protection & 1 == 0 {
                        return Err(self.tlb_fault(vaddr, Exception::InstTlbProtViol));
                    }
                    self.itlb_lru_use(idx);
                    return Ok(ent.translate(vaddr));
                }
                Ok(None) => {
                    let utlb_idx = match self.utlb_find(vaddr) {
                        Ok(Some(idx)) => idx,
                        Ok(None) => return Err(self.tlb_fault(vaddr, Exception::InstTlbMiss)),
                        Err(_) => {
                            self.reg[Reg::TEA] = vaddr;
                            return Err(Exception::InstTlbMultiHit);
                        }
                    };
                    self.itlb_refill(utlb_idx);
                }
                Err(excp) => {
                    self.reg[Reg::TEA] = vaddr;
                    return Err(excp);
                }
            }
        }
        // the refilled entry matches by construction
        Err(self.tlb_fault(vaddr, Exception::InstTlbMiss))
    }

    /// Quiet UTLB walk used by the disassembler.
    pub fn peek_translation(&self, vaddr: u32) -> Option<u32> {
        let asid = self.mmu_asid();
        for ent in self.utlb.iter() {
            if !ent.valid {
                continue;
            }
            let mask = ent.sz.vpn_mask();
            if (ent.vpn & mask) == (vaddr & mask)
                && (!self.asid_matters(ent.shared) || ent.asid == asid)
            {
                return Some(ent.translate(vaddr));
            }
        }
        None
    }

    fn lrui(&self) -> u32 {
        (self.reg[Reg::MMUCR] >> LRUI_SHIFT) & 0x3f
    }
    fn set_lrui(&mut self, lrui: u32) {
        self.reg[Reg::MMUCR] =
            (self.reg[Reg::MMUCR] & !(0x3f << LRUI_SHIFT)) | ((lrui & 0x3f) << LRUI_SHIFT);
    }
    fn itlb_lru_use(&mut self, idx: usize) {
        let lrui = (self.lrui() & LRUI_USE_AND[idx]) | LRUI_USE_OR[idx];
        self.set_lrui(lrui);
    }
    fn itlb_lru_victim(&self) -> usize {
        let lrui = self.lrui();
        for idx in 0..4 {
            if lrui & LRUI_REPLACE_MASK[idx] == LRUI_REPLACE_VAL[idx] {
                return idx;
            }
        }
        // inconsistent LRU state, any victim is architecturally permitted
        0
    }

    fn itlb_refill(&mut self, utlb_idx: usize) {
        let src = self.utlb[utlb_idx];
        let victim = self.itlb_lru_victim();
        let ent = &mut self.itlb[victim];
        *ent = src;
        // ITLB protection is a single bit, the user-accessible one
        ent.protection = (src.protection >> 1) & 1;
        ent.dirty = false;
        self.itlb_lru_use(victim);
    }

    pub fn ldtlb(&mut self) {
        let urc = ((self.reg[Reg::MMUCR] >> URC_SHIFT) & 0x3f) as usize;
        let pteh = self.reg[Reg::PTEH];
        let ptel = self.reg[Reg::PTEL];
        let ptea = self.reg[Reg::PTEA];
        self.utlb[urc] = TlbEnt {
            asid: pteh as u8,
            vpn: pteh & 0xfffffc00,
            ppn: ptel & 0x1ffffc00,
            sz: PageSz::from_bits(((ptel >> 4) & 1) | ((ptel >> 6) & 2)),
            valid: (ptel >> 8) & 1 != 0,
            shared: (ptel >> 1) & 1 != 0,
            cacheable: (ptel >> 3) & 1 != 0,
            dirty: (ptel >> 2) & 1 != 0,
            wt: ptel & 1 != 0,
            protection: ((ptel >> 5) & 3) as u8,
            sa: (ptea & 7) as u8,
            tc: ptea & 8 != 0,
        };
    }

    pub fn mmucr_write(&mut self, val: u32) {
        let mut val = val & 0xfcfcff05;
        if val & MMUCR_TI != 0 {
            self.utlb = [TlbEnt::default(); 64];
            self.itlb = [TlbEnt::default(); 4];
            val &= !MMUCR_TI;
        }
        self.reg[Reg::MMUCR] = val;
    }

    // ------------------------------------------------------------------
    // TLB array windows in the P4 segment

    pub fn utlb_addr_array_write(&mut self, addr: u32, val: u32) {
        let associative = (addr >> 7) & 1 != 0;
        let valid = (val >> 8) & 1 != 0;
        let dirty = (val >> 9) & 1 != 0;
        let vpn = val & 0xfffffc00;
        let asid = val as u8;

        if associative {
            // associative writes update the valid/dirty bits of a matching
            // entry; this is how NetBSD invalidates pages
            if let Ok(Some(idx)) = self.itlb_find(vpn) {
                self.itlb[idx].valid = valid;
            }
            if let Ok(Some(idx)) = self.utlb_find(vpn) {
                self.utlb[idx].valid = valid;
                self.utlb[idx].dirty = dirty;
            }
        } else {
            let idx = ((addr >> 8) & 0x3f) as usize;
            let ent = &mut self.utlb[idx];
            ent.vpn = vpn;
            ent.asid = asid;
            ent.valid = valid;
            ent.dirty = dirty;
        }
    }

    pub fn utlb_addr_array_read(&self, addr: u32) -> u32 {
        // associative access is never performed for reads
        let ent = &self.utlb[((addr >> 8) & 0x3f) as usize];
        ent.vpn | (ent.dirty as u32) << 9 | (ent.valid as u32) << 8 | ent.asid as u32
    }

    pub fn utlb_data_array_write(&mut self, addr: u32, val: u32) {
        let ent = &mut self.utlb[((addr >> 8) & 0x3f) as usize];
        ent.ppn = val & 0x1ffffc00;
        ent.sz = PageSz::from_bits(((val >> 4) & 1) | ((val >> 6) & 2));
        ent.valid = (val >> 8) & 1 != 0;
        ent.protection = ((val >> 5) & 3) as u8;
        ent.cacheable = (val >> 3) & 1 != 0;
        ent.dirty = (val >> 2) & 1 != 0;
        ent.shared = (val >> 1) & 1 != 0;
        ent.wt = val & 1 != 0;
    }

    pub fn utlb_data_array_read(&self, addr: u32) -> u32 {
        let ent = &self.utlb[((addr >> 8) & 0x3f) as usize];
        let sz = ent.sz as u32;
        ent.ppn
            | (ent.valid as u32) << 8
            | (sz & 2) << 6
            | (ent.protection as u32) << 5
            | (sz & 1) << 4
            | (ent.cacheable as u32) << 3
            | (ent.dirty as u32) << 2
            | (ent.shared as u32) << 1
            | ent.wt as u32
    }

    pub fn itlb_addr_array_write(&mut self, addr: u32, val: u32) {
        let ent = &mut self.itlb[((addr >> 8) & 3) as usize];
        ent.vpn = val & 0xfffffc00;
        ent.valid = (val >> 8) & 1 != 0;
        ent.asid = val as u8;
    }

    pub fn itlb_addr_array_read(&self, addr: u32) -> u32 {
        let ent = &self.itlb[((addr >> 8) & 3) as usize];
        ent.vpn | (ent.valid as u32) << 8 | ent.asid as u32
    }

    pub fn itlb_data_array_write(&mut self, addr: u32, val: u32) {
        let ent = &mut self.itlb[((addr >> 8) & 3) as usize];
        ent.ppn = val & 0x1ffffc00;
        ent.valid = (val >> 8) & 1 != 0;
        ent.protection = ((val >> 6) & 1) as u8;
        ent.sz = PageSz::from_bits(((val >> 4) & 1) | ((val >> 6) & 2));
        ent.cacheable = (val >> 3) & 1 != 0;
        ent.shared = (val >> 1) & 1 != 0;
    }

    pub fn itlb_data_array_read(&self, addr: u32) -> u32 {
        let ent = &self.itlb[((addr >> 8) & 3) as usize];
        let sz = ent.sz as u32;
        ent.ppn
            | (ent.valid as u32) << 8
            | (sz & 2) << 6
            | (ent.protection as u32) << 6
            | (sz & 1) << 4
            | (ent.cacheable as u32) << 3
            | (ent.shared as u32) << 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamcast;
    use crate::processor::MMUCR_AT;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn test_cpu() -> CPU {
        let config = dreamcast::bare_console();
        CPU::new(
            Rc::new(RefCell::new(config.bus)),
            config.sched,
            config.holly,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn page(vpn: u32, ppn: u32, sz: PageSz) -> TlbEnt {
        TlbEnt {
            vpn,
            ppn,
            sz,
            valid: true,
            shared: true,
            dirty: true,
            cacheable: true,
            protection: 3,
            ..TlbEnt::default()
        }
    }

    #[test]
    fn single_hit_translates_ppn_plus_offset() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        cpu.utlb[0] = page(0x10000000, 0x0c000000, PageSz::FourK);
        assert_eq!(cpu.translate_data(0x10000abc, false).unwrap(), 0x0c000abc);
        assert_eq!(cpu.translate_data(0x10000abc, true).unwrap(), 0x0c000abc);
    }

    #[test]
    fn overlapping_entries_raise_multi_hit() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        cpu.utlb[0] = page(0x10000000, 0x0c000000, PageSz::FourK);
        cpu.utlb[17] = page(0x10000000, 0x0c400000, PageSz::OneMeg);
        assert_eq!(
            cpu.translate_data(0x10000abc, false),
            Err(Exception::DataTlbMultiHit)
        );
    }

    #[test]
    fn miss_latches_vpn_and_tea() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        assert_eq!(
            cpu.translate_data(0x10000abc, false),
            Err(Exception::DataTlbReadMiss)
        );
        assert_eq!(cpu.reg[Reg::TEA], 0x10000abc);
        assert_eq!(cpu.reg[Reg::PTEH] & 0xfffffc00, 0x10000800 & 0xfffffc00);
        assert_eq!(
            cpu.translate_data(0x10000abc, true),
            Err(Exception::DataTlbWriteMiss)
        );
    }

    #[test]
    fn write_to_clean_page_is_initial_page_write() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        let mut ent = page(0x10000000, 0x0c000000, PageSz::FourK);
        ent.dirty = false;
        cpu.utlb[5] = ent;
        assert_eq!(cpu.translate_data(0x10000010, false).unwrap(), 0x0c000010);
        assert_eq!(
            cpu.translate_data(0x10000010, true),
            Err(Exception::InitialPageWrite)
        );
    }

    #[test]
    fn user_mode_honors_protection_ladder() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        cpu.set_sr(cpu.reg[Reg::SR] & !SR_MD);
        let mut ent = page(0x10000000, 0x0c000000, PageSz::FourK);
        ent.protection = 2; // user read-only
        cpu.utlb[3] = ent;
        assert_eq!(cpu.translate_data(0x10000000, false).unwrap(), 0x0c000000);
        assert_eq!(
            cpu.translate_data(0x10000000, true),
            Err(Exception::DataTlbWriteProtViol)
        );
        cpu.utlb[3].protection = 0;
        assert_eq!(
            cpu.translate_data(0x10000000, false),
            Err(Exception::DataTlbReadProtViol)
        );
    }

    #[test]
    fn asid_mismatch_misses_unless_shared() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        cpu.set_sr(cpu.reg[Reg::SR] & !SR_MD);
        let mut ent = page(0x10000000, 0x0c000000, PageSz::FourK);
        ent.shared = false;
        ent.asid = 7;
        cpu.utlb[0] = ent;
        cpu.reg[Reg::PTEH] = 3; // running with ASID 3
        assert!(cpu.translate_data(0x10000000, false).is_err());
        cpu.utlb[0].shared = true;
        assert_eq!(cpu.translate_data(0x10000000, false).unwrap(), 0x0c000000);
    }

    #[test]
    fn itlb_refills_from_utlb_and_collapses_protection() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] |= MMUCR_AT;
        let mut ent = page(0x10000000, 0x0c000000, PageSz::FourK);
        ent.protection = 2;
        cpu.utlb[9] = ent;
        assert_eq!(cpu.translate_inst(0x10000040).unwrap(), 0x0c000040);
        let refilled = cpu.itlb.iter().find(|e| e.valid).expect("refilled entry");
        assert_eq!(refilled.protection, 1);
        assert_eq!(refilled.vpn, 0x10000000);
    }

    #[test]
    fn ldtlb_loads_the_urc_slot() {
        let mut cpu = test_cpu();
        cpu.reg[Reg::MMUCR] = (5 << 10) | MMUCR_AT;
        cpu.reg[Reg::PTEH] = 0x10000000 | 0x42;
        cpu.reg[Reg::PTEL] = 0x0c000000 | (1 << 8) | (3 << 5) | (1 << 4) | (1 << 2);
        cpu.reg[Reg::PTEA] = 0x3;
        cpu.ldtlb();
        let ent = &cpu.utlb[5];
        assert!(ent.valid && ent.dirty);
        assert_eq!(ent.asid, 0x42);
        assert_eq!(ent.sz, PageSz::FourK);
        assert_eq!(ent.protection, 3);
        assert_eq!(ent.sa, 3);
    }
}
