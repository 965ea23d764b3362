use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sblock_core::{Block, BlockError, ChannelConfig, ChannelHandle, Wait};
use serde::Serialize;
use tracing::{debug, info};

use crate::cmd::LoopbackArgs;
use crate::domains::{Domains, PEER, SETTLE};
use crate::exit::{
    block_error, io_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS, TIMEOUT, USAGE,
};
use crate::output::{new_table, print_json, schema_id, OutputFormat};

const SEQ_BYTES: usize = 8;
const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct ConsumerStats {
    received: u64,
    bytes: u64,
    mismatches: u64,
}

#[derive(Debug, Serialize)]
struct LoopbackReport {
    schema_id: String,
    channel: u8,
    block_size: u32,
    blocks: u32,
    batch: u32,
    sent: u64,
    received: u64,
    mismatches: u64,
    bytes: u64,
    elapsed_ms: u64,
    blocks_per_sec: f64,
    mib_per_sec: f64,
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    if (args.block_size as usize) < SEQ_BYTES {
        return Err(CliError::new(
            USAGE,
            format!("--block-size must be at least {SEQ_BYTES}"),
        ));
    }
    if args.batch > args.blocks {
        return Err(CliError::new(
            USAGE,
            format!("--batch {} exceeds pool of {} blocks", args.batch, args.blocks),
        ));
    }

    let mut config = ChannelConfig::new(PEER, args.channel)
        .with_tx(args.block_size, args.blocks)
        .with_rx(args.block_size, args.blocks);
    if let Some(priority) = args.rt_priority {
        config = config.with_realtime_priority(priority);
    }

    let domains = Domains::new()?;
    let (host, companion) = domains.open_channel(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    if args.count == 0 {
        install_ctrlc_handler(running.clone())?;
    }
    let sent = Arc::new(AtomicU64::new(0));
    let producer_done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let sent = sent.clone();
        let producer_done = producer_done.clone();
        thread::Builder::new()
            .name("loopback-rx".to_string())
            .spawn(move || consume(&companion, &sent, &producer_done))
            .map_err(|err| io_error("consumer thread spawn failed", err))?
    };

    let start = Instant::now();
    let pumped = pump(&host, &args, &running, &sent);
    producer_done.store(true, Ordering::Release);
    let stats = consumer
        .join()
        .map_err(|_| CliError::new(INTERNAL, "consumer thread panicked"))??;
    pumped?;
    let elapsed = start.elapsed();

    let report = LoopbackReport {
        schema_id: schema_id("loopback-report"),
        channel: args.channel,
        block_size: args.block_size,
        blocks: args.blocks,
        batch: args.batch,
        sent: sent.load(Ordering::Acquire),
        received: stats.received,
        mismatches: stats.mismatches,
        bytes: stats.bytes,
        elapsed_ms: elapsed.as_millis().try_into().unwrap_or(u64::MAX),
        blocks_per_sec: per_second(stats.received as f64, elapsed),
        mib_per_sec: per_second(stats.bytes as f64 / (1024.0 * 1024.0), elapsed),
    };
    info!(
        sent = report.sent,
        received = report.received,
        mismatches = report.mismatches,
        elapsed_ms = report.elapsed_ms,
        "loopback finished"
    );
    print_report(&report, format);

    if report.mismatches > 0 || report.received != report.sent {
        Ok(DATA_INVALID)
    } else {
        Ok(SUCCESS)
    }
}

fn pump(
    host: &ChannelHandle,
    args: &LoopbackArgs,
    running: &AtomicBool,
    sent: &AtomicU64,
) -> CliResult<()> {
    let batched = args.batch > 1;
    let mut seq = 0u64;
    while running.load(Ordering::SeqCst) && (args.count == 0 || seq < args.count) {
        let remaining = if args.count == 0 {
            u64::from(args.batch)
        } else {
            args.count - seq
        };
        let mut queued = 0;
        for _ in 0..remaining.min(u64::from(args.batch)) {
            let Some(mut block) = next_block(host, running)? else {
                break;
            };
            fill(&mut block, seq).map_err(|err| block_error("block fill failed", err))?;
            let result = if batched {
                host.send_prepare(block)
            } else {
                host.send(block)
            };
            result.map_err(|rejected| block_error("send failed", rejected.error))?;
            seq += 1;
            queued += 1;
        }
        if batched && queued > 0 {
            host.send_finish()
                .map_err(|err| block_error("send finish failed", err))?;
        }
        sent.store(seq, Ordering::Release);
    }
    debug!(sent = seq, "producer stopped");
    Ok(())
}

/// Wait for a free block, giving up on Ctrl-C or when the peer stalls.
fn next_block(host: &ChannelHandle, running: &AtomicBool) -> CliResult<Option<Block>> {
    let stalled_at = Instant::now() + SETTLE;
    loop {
        match host.get(Wait::Timeout(POLL)) {
            Ok(block) => return Ok(Some(block)),
            Err(err) if err.is_transient() && !matches!(err, BlockError::NotReady) => {
                if !running.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                if Instant::now() >= stalled_at {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("no free block within {SETTLE:?}: {err}"),
                    ));
                }
            }
            Err(err) => return Err(block_error("get failed", err)),
        }
    }
}

fn fill(block: &mut Block, seq: u64) -> sblock_core::Result<()> {
    block.set_len(block.capacity())?;
    let payload = block.as_mut_slice();
    payload[..SEQ_BYTES].copy_from_slice(&seq.to_le_bytes());
    payload[SEQ_BYTES..].fill(seq as u8);
    Ok(())
}

fn intact(block: &Block, seq: u64) -> bool {
    let payload = block.as_slice();
    payload.len() == block.capacity()
        && payload[..SEQ_BYTES] == seq.to_le_bytes()
        && payload[SEQ_BYTES..].iter().all(|&byte| byte == seq as u8)
}

fn consume(
    companion: &ChannelHandle,
    sent: &AtomicU64,
    producer_done: &AtomicBool,
) -> CliResult<ConsumerStats> {
    let mut stats = ConsumerStats::default();
    loop {
        match companion.receive(Wait::Timeout(POLL)) {
            Ok(block) => {
                if !intact(&block, stats.received) {
                    stats.mismatches += 1;
                }
                stats.received += 1;
                stats.bytes += block.len() as u64;
                companion
                    .release(block)
                    .map_err(|rejected| block_error("release failed", rejected.error))?;
            }
            Err(err) if err.is_transient() && !matches!(err, BlockError::NotReady) => {
                if producer_done.load(Ordering::Acquire)
                    && stats.received >= sent.load(Ordering::Acquire)
                {
                    return Ok(stats);
                }
            }
            Err(err) => return Err(block_error("receive failed", err)),
        }
    }
}

fn per_second(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}

fn print_report(report: &LoopbackReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = new_table(vec![
                "SENT",
                "RECEIVED",
                "MISMATCHES",
                "BATCH",
                "ELAPSED",
                "BLOCKS/S",
                "MIB/S",
            ]);
            table.add_row(vec![
                report.sent.to_string(),
                report.received.to_string(),
                report.mismatches.to_string(),
                report.batch.to_string(),
                format!("{} ms", report.elapsed_ms),
                format!("{:.0}", report.blocks_per_sec),
                format!("{:.1}", report.mib_per_sec),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "channel={} sent={} received={} mismatches={} batch={} elapsed={}ms rate={:.0} blocks/s ({:.1} MiB/s)",
                report.channel,
                report.sent,
                report.received,
                report.mismatches,
                report.batch,
                report.elapsed_ms,
                report.blocks_per_sec,
                report.mib_per_sec
            );
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_second_handles_zero_elapsed() {
        assert_eq!(per_second(10.0, Duration::ZERO), 0.0);
        assert_eq!(per_second(10.0, Duration::from_secs(2)), 5.0);
    }
}
