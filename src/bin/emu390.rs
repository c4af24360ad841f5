//! Emulator initialiser
//!
//! Builds the system configuration, starts the timer thread and one
//! thread per CPU, and then parks. The CPUs come up stopped; an
//! operator facility or test harness drives them from there via SIGP.
//! Configuration files, signal handling and the interactive panel are
//! outside this core.

use std::process::exit;
use std::sync::Arc;
use std::thread;

use log::error;

use emu390_core::clock::spawn_timer_thread;
use emu390_core::cpu::execute::{spawn_cpu_thread, IdleDispatcher};
use emu390_core::{Config, System};

fn usage(program: &str) -> ! {
    eprintln!(
        "usage: {} [-m mainsize-mb] [-n numcpu] [-d toddrag]",
        program
    );
    exit(1);
}

fn parse_config() -> Config {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "emu390".into());
    let mut config = Config::default();

    while let Some(flag) = args.next() {
        let value = match args.next() {
            Some(v) => v,
            None => usage(&program),
        };
        match (flag.as_str(), value.parse::<u64>()) {
            ("-m", Ok(mb)) => config.mainsize = mb as usize * 1024 * 1024,
            ("-n", Ok(n)) => config.numcpu = n as usize,
            ("-d", Ok(d)) => config.toddrag = d,
            _ => usage(&program),
        }
    }
    config
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = parse_config();
    let sys = match System::new(config) {
        Ok(sys) => Arc::new(sys),
        Err(err) => {
            error!("cannot build system configuration: {}", err);
            exit(1);
        }
    };

    if let Err(err) = spawn_timer_thread(Arc::clone(&sys)) {
        error!("cannot create timer thread: {}", err);
        exit(1);
    }

    for ad in 0..sys.num_cpus() {
        if let Err(err) = spawn_cpu_thread(Arc::clone(&sys), ad as u16, IdleDispatcher) {
            error!("cannot create thread for CPU {}: {}", ad, err);
            exit(1);
        }
    }

    // The worker threads run for the life of the process
    loop {
        thread::park();
    }
}
