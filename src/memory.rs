// The physical memory map. An ordered list of regions is scanned in
// insertion order; the first region whose masked address range contains the
// access wins, and the access is routed to that region's device after
// masking. The P4 segment and the operand-cache scratch window never get
// here, the CPU resolves those before dispatching.

use crate::fields::{OpResult, Size};
use log::warn;
use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

pub type BusPtr = Rc<RefCell<Bus>>;

#[derive(Debug, Copy, Clone)]
pub struct MemRegion {
    pub first: u32,
    pub last: u32,
    pub addr_mask: u32,
    pub range_mask: u32,
}

impl MemRegion {
    pub fn new(first: u32, last: u32, addr_mask: u32, range_mask: u32) -> MemRegion {
        MemRegion { first, last, addr_mask, range_mask }
    }
    fn contains(&self, addr: u32, size: Size) -> bool {
        let first = addr & self.range_mask;
        let last = first + (size as u32 - 1);
        first >= self.first && last <= self.last
    }
}

pub trait Device {
    fn read(&mut self, addr: u32, size: Size) -> OpResult;
    fn write(&mut self, addr: u32, value: OpResult);
}

pub type DeviceList = Vec<(MemRegion, Box<dyn Device>)>;

/// Lets a device live in the region list while callers elsewhere keep a
/// handle to it.
pub struct Shared<T: Device>(pub Rc<RefCell<T>>);

impl<T: Device> Device for Shared<T> {
    fn read(&mut self, addr: u32, size: Size) -> OpResult {
        self.0.borrow_mut().read(addr, size)
    }
    fn write(&mut self, addr: u32, value: OpResult) {
        self.0.borrow_mut().write(addr, value)
    }
}

pub struct Bus {
    pub devices: DeviceList,
}

impl Bus {
    pub fn new() -> Self {
        Bus { devices: DeviceList::new() }
    }
    pub fn attach(&mut self, region: MemRegion, device: Box<dyn Device>) {
        self.devices.push((region, device));
    }
    pub fn read(&mut self, addr: u32, size: Size) -> OpResult {
        match self.try_read(addr, size) {
            Some(result) => result,
            None => panic!(
                "unmapped memory map read of {} bytes from {:08x}",
                size as u32, addr
            ),
        }
    }
    pub fn write(&mut self, addr: u32, value: OpResult) {
        if !self.try_write(addr, value) {
            panic!(
                "unmapped memory map write of {} bytes to {:08x}",
                value.size() as u32,
                addr
            );
        }
    }
    pub fn try_read(&mut self, addr: u32, size: Size) -> Option<OpResult> {
        for (region, device) in &mut self.devices {
            if region.contains(addr, size) {
                return Some(device.read(addr & region.addr_mask, size));
            }
        }
        None
    }
    pub fn try_write(&mut self, addr: u32, value: OpResult) -> bool {
        for (region, device) in &mut self.devices {
            if region.contains(addr, value.size()) {
                device.write(addr & region.addr_mask, value);
                return true;
            }
        }
        false
    }
}

pub struct Ram {
    mem: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Box<Self> {
        Box::new(Self { mem: vec![0; size] })
    }
}

impl Device for Ram {
    fn read(&mut self, addr: u32, size: Size) -> OpResult {
        let ptr = addr as usize & (self.mem.len() - 1);
        size.from_le_bytes(&self.mem[ptr..ptr + size as usize])
    }
    fn write(&mut self, addr: u32, value: OpResult) {
        let ptr = addr as usize & (self.mem.len() - 1);
        for (j, b) in value.to_le_bytes().drain(..).enumerate() {
            self.mem[ptr + j] = b;
        }
    }
}

pub struct BiosRom {
    data: Vec<u8>,
}

impl BiosRom {
    pub fn load(path: &PathBuf) -> io::Result<Box<Self>> {
        let data = fs::read(path)?;
        Ok(Box::new(Self { data }))
    }
    pub fn empty(len: usize) -> Box<Self> {
        Box::new(Self { data: vec![0; len] })
    }
    pub fn fill(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Device for BiosRom {
    fn read(&mut self, addr: u32, size: Size) -> OpResult {
        let ptr = addr as usize % self.data.len();
        size.from_le_bytes(&self.data[ptr..ptr + size as usize])
    }
    fn write(&mut self, addr: u32, value: OpResult) {
        warn!("ignoring write of {} to boot ROM address {:08x}", value, addr);
    }
}

pub type FlashPtr = Rc<RefCell<FlashRom>>;

pub struct FlashRom {
    data: Vec<u8>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl FlashRom {
    pub fn load(path: &PathBuf) -> io::Result<FlashPtr> {
        let data = fs::read(path)?;
        Ok(Rc::new(RefCell::new(Self {
            data,
            path: Some(path.clone()),
            dirty: false,
        })))
    }
    pub fn empty(len: usize) -> FlashPtr {
        Rc::new(RefCell::new(Self { data: vec![0xff; len], path: None, dirty: false }))
    }
    /// Write the image back to its backing file. Failures are logged, the
    /// emulation result is unaffected.
    pub fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(path) = &self.path {
            match fs::write(path, &self.data) {
                Ok(()) => self.dirty = false,
                Err(err) => warn!("could not write flash image {:?}: {}", path, err),
            }
        }
    }
}

impl Device for FlashRom {
    fn read(&mut self, addr: u32, size: Size) -> OpResult {
        let ptr = addr as usize % self.data.len();
        size.from_le_bytes(&self.data[ptr..ptr + size as usize])
    }
    fn write(&mut self, addr: u32, value: OpResult) {
        let ptr = addr as usize % self.data.len();
        for (j, b) in value.to_le_bytes().drain(..).enumerate() {
            self.data[ptr + j] = b;
        }
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        seen: Rc<RefCell<Vec<u32>>>,
    }

    impl Device for Probe {
        fn read(&mut self, addr: u32, _size: Size) -> OpResult {
            self.seen.borrow_mut().push(addr);
            OpResult::Long(0)
        }
        fn write(&mut self, addr: u32, _value: OpResult) {
            self.seen.borrow_mut().push(addr);
        }
    }

    #[test]
    fn dispatch_applies_addr_mask() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = Bus::new();
        bus.attach(
            MemRegion::new(0x0c000000, 0x0fffffff, 0x00ffffff, 0x1fffffff),
            Box::new(Probe { seen: Rc::clone(&seen) }),
        );
        bus.read(0x0d001234, Size::Long);
        bus.write(0x0f001234, OpResult::Word(7));
        assert_eq!(*seen.borrow(), vec![0x00001234, 0x03001234]);
    }

    #[test]
    fn first_matching_region_wins() {
        let seen_a = Rc::new(RefCell::new(Vec::new()));
        let seen_b = Rc::new(RefCell::new(Vec::new()));
        let mut bus = Bus::new();
        bus.attach(
            MemRegion::new(0x0000, 0x0fff, 0xffffffff, 0xffffffff),
            Box::new(Probe { seen: Rc::clone(&seen_a) }),
        );
        bus.attach(
            MemRegion::new(0x0000, 0xffff, 0xffffffff, 0xffffffff),
            Box::new(Probe { seen: Rc::clone(&seen_b) }),
        );
        bus.read(0x0800, Size::Byte);
        bus.read(0x1800, Size::Byte);
        assert_eq!(*seen_a.borrow(), vec![0x0800]);
        assert_eq!(*seen_b.borrow(), vec![0x1800]);
    }

    #[test]
    fn footprint_must_fit_inside_the_region() {
        let mut bus = Bus::new();
        bus.attach(
            MemRegion::new(0x0000, 0x0fff, 0xffffffff, 0xffffffff),
            Ram::new(0x1000),
        );
        assert!(bus.try_read(0x0ffe, Size::Word).is_some());
        assert!(bus.try_read(0x0ffe, Size::Long).is_none());
    }

    #[test]
    fn ram_round_trips_little_endian() {
        let mut ram = Ram::new(0x1000);
        ram.write(0x10, OpResult::Long(0x11223344));
        assert_eq!(ram.read(0x10, Size::Byte), OpResult::Byte(0x44));
        assert_eq!(ram.read(0x12, Size::Word), OpResult::Word(0x1122));
        ram.write(0x20, OpResult::Quad(0x0102030405060708));
        assert_eq!(ram.read(0x24, Size::Long), OpResult::Long(0x01020304));
    }
}
