// relay-adder command line
//
// Opens the FT232H (or the simulated board with --simulate), brings up both
// MCP23S17 and runs one command. Logs go to stderr, results to stdout.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_adder::board::{Board, pins, sim::RelayAdderSim};
use relay_adder::config::Settings;
use relay_adder::drivers::bitbang::BitBangIo;
use relay_adder::drivers::mcp23s17::{Register, Side};

const SNAPSHOT_ROWS: usize = 10;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(name = "relay-adder")]
struct Cli {
    /// Settings file (key=value lines)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run against the simulated board instead of the FT232H
    #[arg(long, global = true)]
    simulate: bool,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load A and B into the adder and read the 9-bit sum
    Add {
        a: u8,
        b: u8,
        /// Keep reading until the relays stop moving
        #[arg(long)]
        settle: bool,
        /// Print the pin levels of the last transfer
        #[arg(long)]
        trace: bool,
    },
    /// Drive both operands to zero
    Clear,
    /// Dump the registers of both expanders
    Regs,
    /// Show the pin assignment
    Pins,
    /// Print the effective settings, or write them to a file
    Config {
        #[arg(long, value_name = "FILE")]
        write: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::defaults(),
    };

    match cli.command {
        Commands::Config { write: Some(path) } => {
            settings.save(&path)?;
            println!("settings written to {}", path.display());
            Ok(())
        }
        Commands::Config { write: None } => {
            print!("{}", settings.render());
            Ok(())
        }
        Commands::Pins => {
            let map = pins::pin_map(&settings.pins)?;
            for pin in map.iter() {
                println!(
                    "ADBUS{}  {:<7} {:?}  initial {}",
                    pin.no,
                    pin.name,
                    pin.direction,
                    if pin.initial { "H" } else { "L" }
                );
            }
            println!("{}", map);
            Ok(())
        }
        cmd if cli.simulate => {
            let board = Board::init(RelayAdderSim::new(&settings), &settings)
                .context("simulated board bring-up failed")?;
            run(board, &settings, cmd)
        }
        cmd => run_hardware(&settings, cmd),
    }
}

#[cfg(feature = "ftd2xx")]
fn run_hardware(settings: &Settings, cmd: Commands) -> anyhow::Result<()> {
    use relay_adder::board::ft232h::Ft232h;

    let map = pins::pin_map(&settings.pins)?;
    let ftdi = Ft232h::open(settings, map.output_mask())?;
    let board = Board::init(ftdi, settings).context("board bring-up failed")?;
    run(board, settings, cmd)
}

#[cfg(not(feature = "ftd2xx"))]
fn run_hardware(_settings: &Settings, _cmd: Commands) -> anyhow::Result<()> {
    anyhow::bail!("built without FT232H support; rebuild with --features ftd2xx or pass --simulate")
}

fn run<IO: BitBangIo>(
    mut board: Board<IO>,
    settings: &Settings,
    cmd: Commands,
) -> anyhow::Result<()> {
    match cmd {
        Commands::Add {
            a,
            b,
            settle,
            trace,
        } => {
            // drop bring-up traffic from the chart
            board.port().borrow_mut().signal_chart();

            let sum = if settle {
                let settled = board.adder().add_settled(a, b)?;
                println!("{:>9}  {:>9}", "t [ms]", "sum");
                for sample in settled.snapshot_rows(SNAPSHOT_ROWS) {
                    println!(
                        "{:>9.3}  {}",
                        sample.at.as_secs_f64() * 1000.0,
                        sample.value.binary()
                    );
                }
                settled.value
            } else {
                board.adder().add(a, b)?
            };

            println!("{} + {} = {}", a, b, sum);
            println!("binary: {}", sum.binary());
            println!("carry:  {}", u8::from(sum.carry()));

            if trace {
                print!("{}", board.port().borrow_mut().signal_chart());
            }
        }
        Commands::Clear => {
            board.adder().clear()?;
            println!("operands cleared");
        }
        Commands::Regs => {
            for (label, dev) in [
                ("operands", settings.operand_dev),
                ("result", settings.result_dev),
            ] {
                println!("device {} ({}):", dev, label);
                for reg in Register::ALL {
                    let mcp = board.adder().expander();
                    let a = mcp.read(dev, reg, Side::A)?;
                    let b = mcp.read(dev, reg, Side::B)?;
                    println!("  {:<8} A={:08b}  B={:08b}", reg.name(), a, b);
                }
            }
        }
        Commands::Pins | Commands::Config { .. } => unreachable!("handled before bring-up"),
    }
    Ok(())
}
