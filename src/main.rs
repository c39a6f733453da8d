use std::io::{BufRead, Write};

use clap::Parser;
use log::info;

use millcore::hal::{SimDriver, SimLimits};
use millcore::report::ConsoleReporter;
use millcore::serial::SerialRx;
use millcore::settings::MemoryNvs;
use millcore::{Machine, MachineConfig};

/// Console front-end: drives the motion core from stdin as if it were the
/// serial link, printing every response line to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of driven axes (2 or 3)
    #[arg(short = 'a', long, default_value_t = 3)]
    axes: usize,

    /// Step interrupts executed per realtime checkpoint
    #[arg(short, long, default_value_t = 512)]
    ticks: u32,

    /// Read G-code from a file instead of stdin
    #[arg()]
    input: Option<String>,

    /// Enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter(
        None,
        if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        },
    );
    builder.init();

    let mut config = MachineConfig::with_axes(args.axes);
    config.checkpoint_ticks = args.ticks;

    let mut machine = Machine::new(
        config,
        Box::new(SimDriver::new()),
        Box::new(SimLimits::new()),
        Box::new(MemoryNvs::new()),
        Box::new(ConsoleReporter),
    );
    let rx = SerialRx::new(machine.signals());

    machine.reset_state();
    info!("machine ready");

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => Box::new(std::io::BufReader::new(file)),
            Err(err) => {
                eprintln!("cannot open {path}: {err}");
                std::process::exit(1);
            }
        },
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        rx.push_str(&line);
        rx.push(b'\n');
        machine.poll(&rx);
        let _ = std::io::stdout().flush();
    }

    // Let anything still queued run out before exiting.
    machine.protocol_buffer_synchronize();
}
