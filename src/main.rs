//! Thin driver binary: load ROMs, pick an engine, run the machine.
//!
//! The real front end (window, sound, disc images) lives elsewhere; this
//! shim is enough to boot an OS ROM headless, pace emulated time against
//! the wall clock, and dump a snapshot on exit.

use std::time::{Duration, Instant};

use owlet::cpu::defs::CpuVariant;
use owlet::{Bus, Cpu, CpuDriver, CpuMode, Model, Options};

struct Args {
    options: Options,
    mode: CpuMode,
    os_rom: Option<String>,
    basic_rom: Option<String>,
    snapshot: Option<String>,
    max_cycles: Option<u64>,
    headless: bool,
}

fn usage() -> ! {
    eprintln!(
        "usage: owlet [-master] [-mode interp|inturbo|jit] [-os FILE] \
         [-basic FILE] [-snapshot FILE] [-cycles N] [-headless] \
         [-opt FLAGS] [-log FLAGS] [-debug] [-fast]"
    );
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        options: Options::default(),
        mode: CpuMode::Interp,
        os_rom: None,
        basic_rom: None,
        snapshot: None,
        max_cycles: None,
        headless: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-master" => args.options.model = Model::Master,
            "-mode" => match it.next().as_deref() {
                Some("interp") => args.mode = CpuMode::Interp,
                Some("inturbo") => args.mode = CpuMode::Inturbo,
                Some("jit") => args.mode = CpuMode::Jit,
                _ => usage(),
            },
            "-os" => args.os_rom = it.next().or_else(|| usage()),
            "-basic" => args.basic_rom = it.next().or_else(|| usage()),
            "-snapshot" => args.snapshot = it.next().or_else(|| usage()),
            "-cycles" => {
                let n = it.next().and_then(|v| v.parse().ok());
                args.max_cycles = Some(n.unwrap_or_else(|| usage()));
            }
            "-headless" => args.headless = true,
            "-fast" => args.options.accurate = false,
            "-debug" => args.options.debug = true,
            "-opt" => args.options.opt_flags = it.next().unwrap_or_else(|| usage()),
            "-log" => args.options.log_flags = it.next().unwrap_or_else(|| usage()),
            _ => usage(),
        }
    }
    args
}

fn load_rom_file(path: &str) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            log::error!("couldn't read ROM file {path}: {err}");
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let mut bus = Bus::new(&args.options);
    if let Some(path) = &args.os_rom {
        bus.mem.load_os_rom(&load_rom_file(path));
    }
    if let Some(path) = &args.basic_rom {
        bus.mem.load_rom_bank(15, &load_rom_file(path));
    }

    let variant = match args.options.model {
        Model::B => CpuVariant::Nmos,
        Model::Master => CpuVariant::Cmos,
    };
    let mut cpu = Cpu::new();
    let mut driver = CpuDriver::new(args.mode, variant);

    if let Some(path) = &args.snapshot {
        let image = load_rom_file(path);
        if let Err(err) = owlet::snapshot::load(&image, &mut cpu, &mut bus) {
            log::error!("snapshot {path}: {err}");
            std::process::exit(1);
        }
        driver.memory_range_invalidate(0, 0x10000);
        log::info!("loaded snapshot, PC {:04X}", cpu.pc);
    } else {
        driver.reset(&mut cpu, &mut bus);
    }

    // One emulated frame's worth of cycles per scheduling quantum.
    const QUANTUM: u64 = 40_000;
    const TICK_RATE: u64 = 2_000_000;

    let start_wall = Instant::now();
    let start_cycles = cpu.cycles;
    loop {
        driver.run(&mut cpu, &mut bus, QUANTUM);

        if cpu.halted || bus.exit_requested() {
            break;
        }
        if let Some(max) = args.max_cycles {
            if cpu.cycles - start_cycles >= max {
                break;
            }
        }
        if !args.headless {
            // Sleep until the wall clock catches emulated time back up.
            let emulated = Duration::from_micros((cpu.cycles - start_cycles) / (TICK_RATE / 1_000_000));
            let elapsed = start_wall.elapsed();
            if emulated > elapsed {
                std::thread::sleep(emulated - elapsed);
            }
        }
    }

    log::info!(
        "exiting at PC {:04X} after {} cycles, {} vsyncs",
        cpu.pc,
        cpu.cycles - start_cycles,
        bus.video().num_vsyncs()
    );
}
