use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod doctor;
pub mod dump;
pub mod loopback;
pub mod recover;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pump blocks from an in-process host to its companion.
    Loopback(LoopbackArgs),
    /// Simulate a companion warm reset and show what the host reclaims.
    Recover(RecoverArgs),
    /// Print descriptor snapshots of a populated in-process domain pair.
    Dump(DumpArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Loopback(args) => loopback::run(args, format),
        Command::Recover(args) => recover::run(args, format),
        Command::Dump(args) => dump::run(args, format),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Blocks to send. 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 1000)]
    pub count: u64,
    /// Blocks queued per doorbell.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch: u32,
    /// Payload bytes per block.
    #[arg(long, default_value_t = 1024)]
    pub block_size: u32,
    /// Blocks per pool.
    #[arg(long, default_value_t = 16)]
    pub blocks: u32,
    /// Channel id to use.
    #[arg(long, default_value_t = 1)]
    pub channel: u8,
    /// Real-time priority for the event threads.
    #[arg(long, value_name = "PRIORITY")]
    pub rt_priority: Option<i32>,
}

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Blocks per pool.
    #[arg(long, default_value_t = 4)]
    pub blocks: u32,
    /// Payload bytes per block.
    #[arg(long, default_value_t = 128)]
    pub block_size: u32,
    /// Blocks the host keeps on loan across the reset.
    #[arg(long, default_value_t = 2)]
    pub hold: u32,
    /// Blocks sent to the companion and never released.
    #[arg(long, default_value_t = 2)]
    pub in_flight: u32,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Number of channels to create.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub channels: u8,
    /// Also create a shared pool and make every channel a member.
    #[arg(long)]
    pub shared: bool,
    /// Dump the companion registry instead of the host.
    #[arg(long)]
    pub companion: bool,
}

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Priority used for the real-time scheduling probe.
    #[arg(long, default_value_t = 1)]
    pub rt_priority: i32,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Print build details.
    #[arg(long)]
    pub extended: bool,
}
