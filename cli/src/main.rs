mod commands;
mod utils;

use clap::{Parser, Subcommand};
use commands::{EchoArgs, PingArgs, run_echo, run_ping, show_info};
use std::path::PathBuf;
use std::sync::Arc;
use uther_chip::{Bus, Controller, Driver, IndirectBus, StaticConfig};

#[derive(Parser)]
#[command(name = "uther")]
#[command(about = "Uther - drive an emulated TCP/IP offload chip from the host")]
struct Cli {
    /// Network config JSON (mac, ip, subnet, gateway)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Go through the four-port indirect interface instead of direct mapping
    #[arg(long, global = true)]
    indirect: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the chip's network identity and buffer layout
    Info,
    /// Serve TCP echo on one channel
    Echo(EchoArgs),
    /// Ping a host through an IPRAW channel
    Ping(PingArgs),
}

fn driver(chip: &Arc<Controller>, channel: usize, indirect: bool) -> Driver<Box<dyn Bus>> {
    let bus: Box<dyn Bus> = if indirect {
        Box::new(IndirectBus::new(chip.clone()))
    } else {
        Box::new(chip.clone())
    };
    Driver::new(bus, channel)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = utils::load_config(cli.config.as_deref())?;
    let chip = Arc::new(Controller::new(Arc::new(StaticConfig(config))));

    match cli.command {
        Some(Commands::Info) => show_info(&chip),
        Some(Commands::Echo(args)) => {
            let channel = utils::check_channel(args.channel)?;
            run_echo(driver(&chip, channel, cli.indirect), &args)?;
        }
        Some(Commands::Ping(args)) => {
            let channel = utils::check_channel(args.channel)?;
            run_ping(driver(&chip, channel, cli.indirect), &args)?;
        }
        None => {
            show_info(&chip);
            println!("Use --help for usage information.");
        }
    }

    chip.die();
    Ok(())
}
