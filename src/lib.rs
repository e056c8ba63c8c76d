use log::info;
use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod conversions;
pub mod devices;
pub mod dreamcast;
pub mod fields;
mod instructions;
pub mod memory;
pub mod mmu;
mod parser;
pub mod peripherals;
pub mod processor;
pub mod scheduler;
pub mod serial;

use devices::{HollyPtr, SpgPtr, SysBlockPtr, TaFifoPtr};
use fields::{OpResult, Size};
use memory::{Bus, FlashPtr};
use processor::{Debugger, Signal, CPU};
use scheduler::{EventKind, SchedPtr, TIMESLICE};
use serial::SerialServer;

#[derive(Debug, Clone)]
pub enum BootMode {
    /// come up through the boot ROM, exactly like a retail console
    Firmware,
    /// skip the firmware and enter IP.BIN's bootstrap
    DirectIp {
        ip_bin: PathBuf,
        first_read: PathBuf,
        syscalls: Option<PathBuf>,
    },
    /// skip IP.BIN as well and jump straight into 1ST_READ.BIN
    Direct1stRead {
        ip_bin: PathBuf,
        first_read: PathBuf,
        syscalls: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not load {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0}")]
    Invalid(&'static str),
}

pub struct Configuration {
    pub bus: Bus,
    pub sched: SchedPtr,
    pub holly: HollyPtr,
    pub spg: SpgPtr,
    pub sysblock: SysBlockPtr,
    pub ta_fifo: TaFifoPtr,
    pub flash: Option<FlashPtr>,
    pub boot: BootMode,
    pub serial_port: Option<u16>,
}

pub struct Emulator {
    pub cpu: CPU,
    sched: SchedPtr,
    spg: SpgPtr,
    sysblock: SysBlockPtr,
    flash: Option<FlashPtr>,
    kill: Arc<AtomicBool>,
    serial: Option<SerialServer>,
}

impl Emulator {
    pub fn new(config: Configuration) -> Result<Emulator, ConfigError> {
        let bus = Rc::new(RefCell::new(config.bus));
        let kill = Arc::new(AtomicBool::new(false));
        let mut cpu = CPU::new(
            Rc::clone(&bus),
            Rc::clone(&config.sched),
            Rc::clone(&config.holly),
            Arc::clone(&kill),
        );

        let serial = match config.serial_port {
            Some(port) => {
                let server = SerialServer::launch(
                    port,
                    Arc::clone(&cpu.scif.txq),
                    Arc::clone(&cpu.scif.rxq),
                    Arc::clone(&cpu.scif.something_pending),
                    Arc::clone(&kill),
                )
                .map_err(|source| ConfigError::Io { path: PathBuf::from(format!("tcp port {}", port)), source })?;
                cpu.scif_connect_server();
                Some(server)
            }
            None => None,
        };

        let mut emulator = Emulator {
            cpu,
            sched: config.sched,
            spg: config.spg,
            sysblock: config.sysblock,
            flash: config.flash,
            kill,
            serial,
        };
        emulator.apply_boot_mode(&config.boot)?;
        Ok(emulator)
    }

    fn apply_boot_mode(&mut self, boot: &BootMode) -> Result<(), ConfigError> {
        use processor::Reg;
        match boot {
            BootMode::Firmware => {}
            BootMode::DirectIp { ip_bin, first_read, syscalls }
            | BootMode::Direct1stRead { ip_bin, first_read, syscalls } => {
                if let Some(syscalls) = syscalls {
                    self.load_image(syscalls, dreamcast::ADDR_SYSCALLS)?;
                }
                self.load_image(ip_bin, dreamcast::ADDR_IP_BIN)?;
                self.load_image(first_read, dreamcast::ADDR_1ST_READ_BIN)?;
                // the state the firmware would have left behind
                self.cpu.set_sr(0x500000f0);
                self.cpu.set_r(15, dreamcast::DIRECT_BOOT_STACK);
                self.cpu.reg[Reg::VBR] = 0x8c000000;
                self.cpu.reg[Reg::PC] = match boot {
                    BootMode::Direct1stRead { .. } => dreamcast::ADDR_1ST_READ_BIN,
                    _ => dreamcast::ADDR_BOOTSTRAP,
                };
            }
        }
        Ok(())
    }

    fn load_image(&mut self, path: &PathBuf, vaddr: u32) -> Result<(), ConfigError> {
        let image = fs::read(path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        info!("loading {} bytes from {:?} at {:08x}", image.len(), path, vaddr);
        let mut bus = self.cpu.bus.borrow_mut();
        for (j, &b) in image.iter().enumerate() {
            bus.write((vaddr & 0x1fffffff) + j as u32, OpResult::Byte(b));
        }
        Ok(())
    }

    /// A flag that stops the emulation loop; safe to hand to other threads.
    pub fn kill_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.kill)
    }

    pub fn run(&mut self, debug: bool) {
        let mut debugger = if debug { Some(Debugger::new()) } else { None };
        loop {
            if self.kill.load(Ordering::Relaxed) {
                break;
            }
            if self.run_timeslice(&mut debugger) {
                break;
            }
        }
        self.shutdown();
    }

    /// Advance emulation by one timeslice: run the CPU between deadlines and
    /// hand each due event to its owner. Returns true when asked to stop.
    pub fn run_timeslice(&mut self, debugger: &mut Option<Box<Debugger>>) -> bool {
        {
            let mut sched = self.sched.borrow_mut();
            let when = sched.stamp() + TIMESLICE;
            sched.schedule(when, EventKind::TimesliceEnd);
        }
        loop {
            if self.cpu.execute_until(debugger) == Signal::Quit {
                self.sched.borrow_mut().cancel(EventKind::TimesliceEnd);
                return true;
            }
            let event = self.sched.borrow_mut().pop();
            let event = match event {
                Some(event) => event,
                None => continue,
            };
            match event.kind {
                EventKind::TimesliceEnd => return false,
                EventKind::TmuUnderflow(chan) => self.cpu.tmu_underflow(chan),
                EventKind::ScifRxi => self.cpu.scif_rxi_event(),
                EventKind::ScifTxi => self.cpu.scif_txi_event(),
                EventKind::Ch2DmaStart => {
                    let (dst, len) = {
                        let sysblock = self.sysblock.borrow();
                        (sysblock.c2dstat, sysblock.c2dlen)
                    };
                    self.cpu.dmac_channel2(dst, len);
                }
                EventKind::Ch2DmaDone => self.cpu.dmac_ch2_complete(),
                EventKind::Hblank => self.spg.borrow_mut().handle_hblank(),
                EventKind::VblankIn => self.spg.borrow_mut().handle_vblank_in(),
                EventKind::VblankOut => self.spg.borrow_mut().handle_vblank_out(),
            }
        }
    }

    fn shutdown(&mut self) {
        self.kill.store(true, Ordering::Relaxed);
        if let Some(flash) = &self.flash {
            flash.borrow_mut().persist();
        }
        if let Some(server) = &mut self.serial {
            server.join();
        }
        info!(
            "emulation stopped after {} cycles",
            self.sched.borrow().stamp()
        );
    }

    /// Poke a guest-visible address, mainly for test setups.
    pub fn poke(&mut self, vaddr: u32, value: OpResult) {
        self.cpu.bus.borrow_mut().write(vaddr & 0x1fffffff, value);
    }
    pub fn peek(&mut self, vaddr: u32, size: Size) -> OpResult {
        self.cpu.bus.borrow_mut().read(vaddr & 0x1fffffff, size)
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if !self.kill.load(Ordering::Relaxed) {
            self.kill.store(true, Ordering::Relaxed);
            if let Some(server) = &mut self.serial {
                server.join();
            }
        }
    }
}
