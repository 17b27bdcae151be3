//! usbd-sim: drive the USB host driver core against a simulated controller.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use usbd::config::{UsbdConfig, example_config};
use usbd::hcd::scenario::{Action, Scenario, Step};
use usbd::model::format_ns;
use usbd::usbd::{AttachKind, MgmtCallback, MgmtNotice};
use usbd::{ClassPattern, SimHcd, Usbd, UsbdClient};

#[derive(Parser)]
#[command(name = "usbd-sim")]
#[command(about = "Run the USB host driver core against a simulated controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: auto-detect)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a scenario, printing attach/removal events, then the final tree
    Simulate {
        /// Scenario file (TOML)
        scenario: PathBuf,

        /// Skip the per-bus statistics
        #[arg(long)]
        no_stats: bool,
    },

    /// Enumerate what a scenario plugs in before attach and print the tree
    Tree {
        /// Scenario file (TOML)
        scenario: PathBuf,
    },

    /// Print blank example config file
    InitConfig,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("usbd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(*shell, &mut cmd, "usbd-sim", &mut std::io::stdout());
            return Ok(());
        }
        Commands::InitConfig => {
            print!("{}", example_config());
            return Ok(());
        }
        _ => {}
    }

    let config = match &cli.config {
        Some(path) => UsbdConfig::load_from_path(path)?,
        None => UsbdConfig::load()?,
    };

    match cli.command {
        Commands::Simulate { scenario, no_stats } => simulate(config, &scenario, !no_stats),
        Commands::Tree { scenario } => tree(config, &scenario),
        Commands::InitConfig | Commands::Completions { .. } => Ok(()),
    }
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    Scenario::load(path).with_context(|| format!("loading scenario {}", path.display()))
}

fn simulate(config: UsbdConfig, path: &Path, stats: bool) -> Result<()> {
    let scenario = load_scenario(path)?;
    let (hcd, steps) = scenario.build();
    let hcd = Arc::new(hcd);

    let usbd = Usbd::new(config)?;
    let mgmt: MgmtCallback = Arc::new(|notice: MgmtNotice| {
        println!("[mgmt]   root {} {:?}", notice.root, notice.event);
    });
    let monitor = UsbdClient::register_with(&usbd, "usbd-sim", Some(mgmt))?;
    monitor.subscribe(ClassPattern::ANY, |event| {
        let verb = match event.kind {
            AttachKind::Attach => "attach",
            AttachKind::Remove => "remove",
        };
        println!(
            "[{verb}] {} config {} interface {} class {:02x}/{:02x}/{:02x}",
            event.node,
            event.configuration,
            event.interface,
            event.class,
            event.subclass,
            event.protocol
        );
    })?;

    let controller = usbd.attach_hcd(hcd.clone())?;
    info!(%controller, buses = scenario.buses.len(), "controller attached");

    play(&scenario, &hcd, &steps);
    thread::sleep(Duration::from_millis(scenario.settle_ms));

    println!();
    print!("{}", usbd.topology()?.render_tree());

    if stats {
        println!();
        for bus in 0..usbd.bus_count(monitor.handle())? {
            let root = monitor.root_node(bus)?;
            let s = usbd.statistics(monitor.handle(), root)?;
            println!(
                "bus {bus}: {} nodes, {} reserved, in {} ({} errors), out {} ({} errors)",
                s.nodes,
                format_ns(s.reserved_ns),
                s.transfers_in,
                s.receive_errors,
                s.transfers_out,
                s.transmit_errors
            );
        }
    }

    usbd.detach_hcd(controller)?;
    monitor.unregister()?;
    usbd.shutdown()?;
    Ok(())
}

fn play(scenario: &Scenario, hcd: &SimHcd, steps: &[Step]) {
    let start = Instant::now();
    for step in steps {
        let due = start + Duration::from_millis(step.at_ms);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
        let (i, result) = match step.action {
            Action::Plug(i) => {
                let dev = &scenario.devices[i];
                (i, hcd.plug(dev.bus, &dev.path, dev.spec()))
            }
            Action::Unplug(i) => {
                let dev = &scenario.devices[i];
                (i, hcd.unplug(dev.bus, &dev.path))
            }
        };
        if let Err(e) = result {
            warn!(device = i, at_ms = step.at_ms, error = %e, "scenario step failed");
        }
    }
}

fn tree(config: UsbdConfig, path: &Path) -> Result<()> {
    let scenario = load_scenario(path)?;
    let (hcd, _) = scenario.build();

    let usbd = Usbd::new(config)?;
    let controller = usbd.attach_hcd(Arc::new(hcd))?;
    thread::sleep(Duration::from_millis(scenario.settle_ms));

    print!("{}", usbd.topology()?.render_tree());

    usbd.detach_hcd(controller)?;
    usbd.shutdown()?;
    Ok(())
}
