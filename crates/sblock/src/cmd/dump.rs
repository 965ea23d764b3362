use std::time::{Duration, Instant};

use sblock_core::{Block, ChannelConfig, ChannelHandle, RegistrySnapshot, SharedPoolConfig, Wait};
use serde::Serialize;

use crate::cmd::DumpArgs;
use crate::domains::{Domains, PEER, SETTLE};
use crate::exit::{block_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{
    add_queue_rows, new_table, print_json, schema_id, OutputFormat, QUEUE_HEADER,
};

const POOL_CHANNEL: u8 = 0;
const BLOCK_SIZE: u32 = 256;
const BLOCKS: u32 = 4;
const SHARED_BLOCKS: u32 = 8;

#[derive(Serialize)]
struct DumpOutput<'a> {
    schema_id: String,
    domain: &'static str,
    #[serde(flatten)]
    snapshot: &'a RegistrySnapshot,
}

pub fn run(args: DumpArgs, format: OutputFormat) -> CliResult<i32> {
    let domains = Domains::new()?;
    let _pools = if args.shared {
        let config = SharedPoolConfig::new(PEER, POOL_CHANNEL)
            .with_tx(BLOCK_SIZE, SHARED_BLOCKS)
            .with_rx(BLOCK_SIZE, SHARED_BLOCKS);
        Some(domains.open_shared_pool(&config)?)
    } else {
        None
    };

    let mut open = Vec::new();
    for channel in 1..=args.channels {
        let config = ChannelConfig::new(PEER, channel)
            .with_tx(BLOCK_SIZE, BLOCKS)
            .with_rx(BLOCK_SIZE, BLOCKS)
            .with_shared_pool(args.shared);
        let (host, companion) = domains.open_channel(&config)?;
        let on_loan = populate(&host, &companion)?;
        open.push((host, companion, on_loan));
    }

    let (domain, registry) = if args.companion {
        ("companion", &domains.companion)
    } else {
        ("host", &domains.host)
    };
    let snapshot = registry.snapshot();

    match format {
        OutputFormat::Json => print_json(&DumpOutput {
            schema_id: schema_id("registry-dump"),
            domain,
            snapshot: &snapshot,
        }),
        OutputFormat::Table => print_tables(&snapshot),
        OutputFormat::Pretty => print!("{snapshot}"),
    }
    Ok(SUCCESS)
}

/// Leave one block in flight and one on loan so the pointers are not all zero.
fn populate(host: &ChannelHandle, companion: &ChannelHandle) -> CliResult<Block> {
    let mut block = host
        .get(Wait::NoWait)
        .map_err(|err| block_error("get failed", err))?;
    block
        .write(b"dump")
        .map_err(|err| block_error("write failed", err))?;
    host.send(block)
        .map_err(|rejected| block_error("send failed", rejected.error))?;
    let on_loan = host
        .get(Wait::NoWait)
        .map_err(|err| block_error("get failed", err))?;

    let deadline = Instant::now() + SETTLE;
    while companion.arrived_count() == 0 {
        if Instant::now() >= deadline {
            return Err(CliError::new(TIMEOUT, "block never arrived at companion"));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(on_loan)
}

fn print_tables(snapshot: &RegistrySnapshot) {
    if snapshot.channels.is_empty() && snapshot.shared_pools.is_empty() {
        println!("no channels");
        return;
    }

    let mut objects = new_table(vec![
        "PEER", "CHANNEL", "KIND", "ROLE", "STATE", "REGION", "PENDING TX", "PENDING RX",
    ]);
    let mut queues = new_table(QUEUE_HEADER.to_vec());
    for pool in &snapshot.shared_pools {
        objects.add_row(vec![
            pool.peer_id.to_string(),
            pool.channel_id.to_string(),
            "shared pool".to_string(),
            pool.role.to_string(),
            pool.state.to_string(),
            region(pool.region_base),
            pool.pending_tx.to_string(),
            pool.pending_rx.to_string(),
        ]);
        add_queue_rows(&mut queues, &format!("pool {}", pool.channel_id), &pool.queues);
    }
    for channel in &snapshot.channels {
        let kind = if channel.shared_pool { "member" } else { "channel" };
        objects.add_row(vec![
            channel.peer_id.to_string(),
            channel.channel_id.to_string(),
            kind.to_string(),
            channel.role.to_string(),
            channel.state.to_string(),
            region(channel.region_base),
            channel.pending_tx.to_string(),
            channel.pending_rx.to_string(),
        ]);
        add_queue_rows(&mut queues, &format!("ch {}", channel.channel_id), &channel.queues);
    }
    println!("{objects}");
    println!("{queues}");
}

fn region(base: Option<u32>) -> String {
    base.map_or_else(|| "unmapped".to_string(), |base| format!("{base:#010x}"))
}
