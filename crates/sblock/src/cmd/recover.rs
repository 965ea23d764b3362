use sblock_core::{
    Block, BlockError, ChannelConfig, ChannelHandle, ChannelSnapshot, ChannelState,
    RecoveryReport, Wait,
};
use serde::Serialize;
use tracing::info;

use crate::cmd::RecoverArgs;
use crate::domains::{wait_for_state, Domains, PEER, SETTLE};
use crate::exit::{block_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{new_table, print_json, recovery_line, schema_id, OutputFormat};

const CHANNEL: u8 = 1;

/// Transmit-side occupancy of the host at one point in time.
#[derive(Debug, Clone, Copy, Serialize)]
struct Occupancy {
    state: ChannelState,
    pool_tx: u32,
    ring_tx: u32,
    pending_tx: u32,
}

impl Occupancy {
    fn of(snapshot: &ChannelSnapshot) -> Self {
        let occupancy = |name: &str| snapshot.queue(name).map_or(0, |queue| queue.occupancy);
        Self {
            state: snapshot.state,
            pool_tx: occupancy("pool-tx"),
            ring_tx: occupancy("ring-tx"),
            pending_tx: snapshot.pending_tx,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecoverOutput {
    schema_id: String,
    blocks: u32,
    hold: u32,
    in_flight: u32,
    before: Occupancy,
    after: Occupancy,
    report: RecoveryReport,
    /// Blocks `get` could hand out after recovery.
    reclaimed: u32,
    /// Free blocks once the held ones were returned too.
    free_after_return: u32,
    ok: bool,
}

pub fn run(args: RecoverArgs, format: OutputFormat) -> CliResult<i32> {
    if args.hold + args.in_flight > args.blocks {
        return Err(CliError::new(
            USAGE,
            format!(
                "--hold {} plus --in-flight {} exceeds pool of {} blocks",
                args.hold, args.in_flight, args.blocks
            ),
        ));
    }

    let config = ChannelConfig::new(PEER, CHANNEL)
        .with_tx(args.block_size, args.blocks)
        .with_rx(args.block_size, args.blocks);
    let domains = Domains::new()?;
    let (host, companion) = domains.open_channel(&config)?;

    let held = take(&host, args.hold)?;
    for block in take(&host, args.in_flight)? {
        host.send(block)
            .map_err(|rejected| block_error("send failed", rejected.error))?;
    }
    let before = Occupancy::of(&host.snapshot());

    info!(channel = CHANNEL, "restarting companion");
    domains
        .companion
        .destroy(&companion)
        .map_err(|err| block_error("companion destroy failed", err))?;
    wait_for_state(&host, ChannelState::Idle)?;
    let _companion = domains.open_companion(&config)?;
    host.wait_ready(Wait::Timeout(SETTLE))
        .map_err(|err| block_error("host not ready after restart", err))?;

    let snapshot = host.snapshot();
    let after = Occupancy::of(&snapshot);
    let report = snapshot
        .last_recovery
        .ok_or_else(|| CliError::new(FAILURE, "host recorded no recovery"))?;

    let reclaimed = drain_free(&host)?;
    for block in held {
        host.put(block)
            .map_err(|rejected| block_error("put after recovery failed", rejected.error))?;
    }
    let free_after_return = host.free_count();

    let output = RecoverOutput {
        schema_id: schema_id("recover-report"),
        blocks: args.blocks,
        hold: args.hold,
        in_flight: args.in_flight,
        before,
        after,
        report,
        reclaimed,
        free_after_return,
        ok: reclaimed == args.blocks - args.hold && free_after_return == args.blocks,
    };
    print_recover(&output, format);

    Ok(if output.ok { SUCCESS } else { FAILURE })
}

fn take(host: &ChannelHandle, count: u32) -> CliResult<Vec<Block>> {
    (0..count)
        .map(|_| {
            host.get(Wait::NoWait)
                .map_err(|err| block_error("get failed", err))
        })
        .collect()
}

/// Count the free blocks by taking them all, then give them back.
fn drain_free(host: &ChannelHandle) -> CliResult<u32> {
    let mut blocks = Vec::new();
    loop {
        match host.get(Wait::NoWait) {
            Ok(block) => blocks.push(block),
            Err(BlockError::Empty) => break,
            Err(err) => return Err(block_error("get after recovery failed", err)),
        }
    }
    let count = blocks.len() as u32;
    for block in blocks {
        host.put(block)
            .map_err(|rejected| block_error("put failed", rejected.error))?;
    }
    Ok(count)
}

fn print_recover(output: &RecoverOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => {
            let mut table = new_table(vec!["", "STATE", "POOL-TX", "RING-TX", "ON LOAN"]);
            for (label, occupancy) in [("before", &output.before), ("after", &output.after)] {
                table.add_row(vec![
                    label.to_string(),
                    occupancy.state.to_string(),
                    occupancy.pool_tx.to_string(),
                    occupancy.ring_tx.to_string(),
                    occupancy.pending_tx.to_string(),
                ]);
            }
            println!("{table}");
            println!("recovery: {}", recovery_line(&output.report));
            println!(
                "reclaimed {} of {} blocks, {} free after returning held blocks",
                output.reclaimed, output.blocks, output.free_after_return
            );
        }
        OutputFormat::Pretty => {
            println!(
                "before: pool-tx={} ring-tx={} on-loan={}",
                output.before.pool_tx, output.before.ring_tx, output.before.pending_tx
            );
            println!(
                "after:  pool-tx={} ring-tx={} on-loan={}",
                output.after.pool_tx, output.after.ring_tx, output.after.pending_tx
            );
            println!("recovery: {}", recovery_line(&output.report));
            println!(
                "result: {} (reclaimed={} free_after_return={})",
                if output.ok { "ok" } else { "mismatch" },
                output.reclaimed,
                output.free_after_return
            );
        }
    }
}
