use std::thread;
use std::time::Duration;

use sblock_shmem::{PhysAddr, PhysicalMemory, SharedRegion, ShmemProvider, PAGE_SIZE};
use sblock_signal::{SignalLink, SignalMessage, SignalPort, EVENT_BLOCK_SEND};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, schema_id, OutputFormat};

const PROBE_CHANNEL: u8 = 0;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: String,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        shared_mapping_check(),
        physical_window_check(),
        signal_link_check(),
        realtime_check(args.rt_priority),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: schema_id("doctor-report"),
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("sblock doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<20} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
    }
}

/// Two mappings of one region must observe each other's writes.
fn shared_mapping_check() -> CheckResult {
    const NAME: &str = "shared_mapping";
    let region = match SharedRegion::anonymous(PhysAddr(0x1000_0000), PAGE_SIZE) {
        Ok(region) => region,
        Err(err) => return CheckResult::new(NAME, CheckStatus::Fail, err.to_string()),
    };
    let alias = region.clone();
    region.store_u32(0, 0x5b10_c4ed);
    if alias.load_u32(0) == 0x5b10_c4ed {
        CheckResult::new(NAME, CheckStatus::Pass, format!("{PAGE_SIZE}-byte shared mapping"))
    } else {
        CheckResult::new(NAME, CheckStatus::Fail, "write not visible through second handle")
    }
}

fn physical_window_check() -> CheckResult {
    const NAME: &str = "physical_window";
    let memory = PhysicalMemory::new();
    let result = memory.alloc(PAGE_SIZE).and_then(|region| {
        let mapped = memory.map(region.phys_base(), region.len());
        memory.free(&region);
        mapped.map(|mapped| (region.phys_base(), mapped.same_mapping(&region)))
    });
    match result {
        Ok((base, true)) => {
            CheckResult::new(NAME, CheckStatus::Pass, format!("alloc/map/free at {base}"))
        }
        Ok((base, false)) => CheckResult::new(
            NAME,
            CheckStatus::Fail,
            format!("map of {base} returned a different mapping"),
        ),
        Err(err) => CheckResult::new(NAME, CheckStatus::Fail, err.to_string()),
    }
}

/// Open a channel across a socketpair and bounce one event over it.
fn signal_link_check() -> CheckResult {
    const NAME: &str = "signal_link";
    let (local, remote) = match SignalPort::pair() {
        Ok(pair) => pair,
        Err(err) => return CheckResult::new(NAME, CheckStatus::Fail, err.to_string()),
    };
    let peer = thread::spawn(move || -> sblock_signal::Result<SignalMessage> {
        remote.open(PROBE_CHANNEL, Some(PROBE_TIMEOUT))?;
        let msg = remote.recv(PROBE_CHANNEL, Some(PROBE_TIMEOUT))?;
        remote.send(msg)?;
        Ok(msg)
    });

    let result = local
        .open(PROBE_CHANNEL, Some(PROBE_TIMEOUT))
        .and_then(|()| local.send(SignalMessage::event(PROBE_CHANNEL, EVENT_BLOCK_SEND, 7)))
        .and_then(|()| local.recv(PROBE_CHANNEL, Some(PROBE_TIMEOUT)));
    let peer = peer.join();

    match (result, peer) {
        (Ok(echo), Ok(Ok(_))) if echo.is_event(EVENT_BLOCK_SEND) && echo.value == 7 => {
            CheckResult::new(NAME, CheckStatus::Pass, "socketpair handshake and event echo")
        }
        (Ok(echo), _) => CheckResult::new(
            NAME,
            CheckStatus::Fail,
            format!("unexpected echo: {}", echo.kind.name()),
        ),
        (Err(err), _) => CheckResult::new(NAME, CheckStatus::Fail, err.to_string()),
    }
}

/// Event threads run fine without real-time scheduling, so a refusal only
/// warns.
fn realtime_check(priority: i32) -> CheckResult {
    const NAME: &str = "realtime_scheduling";
    let probe = thread::spawn(move || sblock_core::sched::probe_realtime(priority));
    match probe.join() {
        Ok(Ok(())) => CheckResult::new(
            NAME,
            CheckStatus::Pass,
            format!("SCHED_FIFO priority {priority} permitted"),
        ),
        Ok(Err(err)) => CheckResult::new(
            NAME,
            CheckStatus::Warn,
            format!("SCHED_FIFO priority {priority} refused: {err}"),
        ),
        Err(_) => CheckResult::new(NAME, CheckStatus::Fail, "probe thread panicked"),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}
