use clap::{Parser, ValueEnum};
use emdc::{dreamcast, BootMode, Emulator};
use std::path::PathBuf;
use std::process::exit;

#[derive(Parser)]
#[command(name = "mydc", about = "Sega Dreamcast emulator", version)]
struct Args {
    /// path to the Dreamcast boot ROM
    #[arg(short, long)]
    bios: Option<PathBuf>,
    /// path to the Dreamcast flash ROM image
    #[arg(short, long)]
    flash: Option<PathBuf>,
    /// how to start the machine
    #[arg(long, value_enum, default_value_t = BootKind::Firmware)]
    boot: BootKind,
    /// IP.BIN image (direct boot only)
    #[arg(long)]
    ip_bin: Option<PathBuf>,
    /// 1ST_READ.BIN image (direct boot only)
    #[arg(long)]
    first_read: Option<PathBuf>,
    /// system call image (direct boot only)
    #[arg(long)]
    syscalls: Option<PathBuf>,
    /// attach the terminal debugger
    #[arg(short = 'g', long)]
    debugger: bool,
    /// bridge the serial port over TCP on the given port
    #[arg(short = 't', long, num_args = 0..=1, default_missing_value = "1998")]
    serial: Option<u16>,
}

#[derive(Copy, Clone, PartialEq, ValueEnum)]
enum BootKind {
    Firmware,
    DirectIp,
    Direct1stRead,
}

fn configuration_error(msg: &str) -> ! {
    eprintln!("configuration error: {}", msg);
    exit(1);
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let boot = match args.boot {
        BootKind::Firmware => BootMode::Firmware,
        BootKind::DirectIp | BootKind::Direct1stRead => {
            let ip_bin = match &args.ip_bin {
                Some(path) => path.clone(),
                None => configuration_error("direct boot requires --ip-bin"),
            };
            let first_read = match &args.first_read {
                Some(path) => path.clone(),
                None => configuration_error("direct boot requires --first-read"),
            };
            let syscalls = args.syscalls.clone();
            if args.boot == BootKind::DirectIp {
                BootMode::DirectIp { ip_bin, first_read, syscalls }
            } else {
                BootMode::Direct1stRead { ip_bin, first_read, syscalls }
            }
        }
    };

    let bios = match (&args.bios, &boot) {
        (Some(path), _) => path.clone(),
        (None, BootMode::Firmware) => configuration_error("firmware boot requires --bios"),
        (None, _) => PathBuf::new(),
    };

    let mut config = if bios.as_os_str().is_empty() {
        dreamcast::bare_console()
    } else {
        match dreamcast::console(&bios, args.flash.as_ref()) {
            Ok(config) => config,
            Err(err) => configuration_error(&format!("{}", err)),
        }
    };
    config.boot = boot;
    config.serial_port = args.serial;

    let mut emulator = match Emulator::new(config) {
        Ok(emulator) => emulator,
        Err(err) => configuration_error(&format!("{}", err)),
    };
    emulator.run(args.debugger);
}
