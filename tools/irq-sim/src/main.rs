//! irq-sim - exercise the threaded IRQ example driver on the host
//!
//! Loads the driver into a simulated kernel, fires interrupts on its line,
//! reads the device node to end of file, prints the interrupt listing and
//! unloads. The exit status is the load errno when loading fails.
//!
//! ```text
//! irq-sim --events 5 --share --claim status-register
//! irq-sim --config params.toml --param irq_number=12
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use cap_broker::{CapabilityBroker, DefaultCapBroker, IrqFlags, IrqHandler, IrqReturn};
use clap::Parser;
use colored::Colorize;
use dddk_runtime::{DriverError, ModuleLoader};
use threaded_irq::{ClaimPolicy, ModuleParams, StatusBits, ThreadedIrqDevice, DEVICE_NAME};

/// How long to wait for the IRQ thread to catch up before reading
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "irq-sim")]
#[command(version)]
#[command(about = "Load the threaded IRQ example driver into a simulated kernel", long_about = None)]
struct Cli {
    /// Module parameters file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Module parameter as name=value, may be repeated
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,

    /// IRQ line, overrides config and parameters
    #[arg(long)]
    irq_number: Option<u32>,

    /// Claim policy: always | status-register
    #[arg(long)]
    claim: Option<ClaimPolicy>,

    /// Interrupts to fire
    #[arg(short, long, default_value_t = 3)]
    events: u32,

    /// Read size in bytes
    #[arg(long, default_value_t = 8)]
    chunk: usize,

    /// Put a second device on the line; every other event is its
    #[arg(long)]
    share: bool,
}

/// Second device on a shared line
#[derive(Default)]
struct Neighbour {
    pending: AtomicBool,
}

impl IrqHandler for Neighbour {
    fn handle(&self, _irq: u32) -> IrqReturn {
        if self.pending.swap(false, Ordering::AcqRel) {
            IrqReturn::Handled
        } else {
            IrqReturn::None
        }
    }

    fn thread_fn(&self, _irq: u32) -> IrqReturn {
        IrqReturn::None
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            match e.downcast_ref::<DriverError>() {
                Some(driver) => ExitCode::from(u8::try_from(-driver.errno()).unwrap_or(1)),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn module_params(cli: &Cli) -> anyhow::Result<ModuleParams> {
    let mut params = match &cli.config {
        Some(path) => load_config(path)?,
        None => ModuleParams::default(),
    };
    for arg in &cli.params {
        params.set(arg)?;
    }
    if let Some(irq) = cli.irq_number {
        params.irq_number = irq;
    }
    if let Some(claim) = cli.claim {
        params.claim = claim;
    }
    Ok(params)
}

fn load_config(path: &Path) -> anyhow::Result<ModuleParams> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid module parameters in {}", path.display()))
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let params = module_params(cli)?;
    let irq = params.irq_number;
    let claim = params.claim;

    let broker = Arc::new(DefaultCapBroker::new());
    let neighbour = Arc::new(Neighbour::default());
    let neighbour_reg = if cli.share {
        let reg = broker
            .request_threaded_irq(irq, neighbour.clone(), IrqFlags::SHARED, "irq_sim_neighbour")
            .with_context(|| format!("Failed to put a neighbour on IRQ {}", irq))?;
        Some(reg)
    } else {
        None
    };

    println!(
        "{} Loading {} (irq_number={}, claim={:?})",
        "▶".green(),
        DEVICE_NAME.bold(),
        irq,
        claim
    );
    let mut loader = ModuleLoader::<ThreadedIrqDevice>::new(broker.clone());
    if let Err(e) = loader.load(params.into()) {
        if let Some(reg) = neighbour_reg {
            broker.free_irq(reg);
        }
        return Err(e.into());
    }
    let Some(device) = loader.driver() else {
        anyhow::bail!("Module reported live without a driver");
    };
    println!("  major {}, node /dev/{}", device.major(), device.node_name());

    let mut woken = 0;
    for event in 0..cli.events {
        let foreign = cli.share && event % 2 == 1;
        if foreign {
            neighbour.pending.store(true, Ordering::Release);
        } else if claim == ClaimPolicy::StatusRegister {
            device.state().status().assert(StatusBits::PENDING | StatusBits::DATA);
        }

        let outcome = broker.raise_irq(irq)?;
        woken += outcome.woken;
        if outcome.is_spurious() {
            log::warn!("irq {}: nobody claimed event {}", irq, event);
        }
    }

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let settled = |d: &ThreadedIrqDevice| d.state().processed() + d.processor().faults() >= woken as u64;
    while !settled(device) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let stats = device.dispatcher().stats();
    println!(
        "{} {} events: {} claimed, {} handed off, {} processed",
        "⚡".yellow(),
        stats.received,
        stats.claimed,
        stats.handed_off,
        device.state().processed()
    );

    let mut file = broker.open(DEVICE_NAME)?;
    let content = file.read_to_end(cli.chunk)?;
    drop(file);
    println!(
        "{} read {} bytes in chunks of {}: {:?}",
        "📖".cyan(),
        content.len(),
        cli.chunk,
        String::from_utf8_lossy(&content)
    );

    println!("\n{}", "Interrupts:".bold());
    for line in broker.interrupts() {
        println!("  {}", line);
    }
    println!("{}", "Character devices:".bold());
    for (major, name) in broker.devices() {
        println!("  {:3} {}", major, name);
    }

    loader.unload()?;
    if let Some(reg) = neighbour_reg {
        broker.free_irq(reg);
    }

    let leaked = broker.total_live();
    if leaked != 0 {
        anyhow::bail!("{} resources still held after unload", leaked);
    }
    println!("\n{} Unloaded cleanly", "✓".green());
    Ok(())
}
