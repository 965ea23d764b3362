//! Host and companion domains wired together inside one process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sblock_core::{
    ChannelConfig, ChannelHandle, ChannelState, Registry, SharedPool, SharedPoolConfig, Wait,
};
use sblock_shmem::PhysicalMemory;
use sblock_signal::SignalPort;

use crate::exit::{block_error, signal_error, CliError, CliResult, TIMEOUT};

pub const PEER: u8 = 1;
pub const SETTLE: Duration = Duration::from_secs(5);

pub struct Domains {
    pub host: Registry,
    pub companion: Registry,
}

impl Domains {
    pub fn new() -> CliResult<Self> {
        let (host_link, companion_link) =
            SignalPort::pair().map_err(|err| signal_error("signal link setup failed", err))?;
        let memory = Arc::new(PhysicalMemory::new());

        let host = Registry::new();
        host.attach_peer(PEER, Arc::new(host_link), memory.clone())
            .map_err(|err| block_error("host attach failed", err))?;
        let companion = Registry::new();
        companion
            .attach_peer(PEER, Arc::new(companion_link), memory)
            .map_err(|err| block_error("companion attach failed", err))?;
        Ok(Self { host, companion })
    }

    /// Create `config` on the host, its mirror on the companion, and wait for
    /// both ends to come up.
    pub fn open_channel(
        &self,
        config: &ChannelConfig,
    ) -> CliResult<(ChannelHandle, ChannelHandle)> {
        let host = self
            .host
            .create(config.clone())
            .map_err(|err| block_error("host channel create failed", err))?;
        let companion = self.open_companion(config)?;
        host.wait_ready(Wait::Timeout(SETTLE))
            .map_err(|err| block_error("host channel not ready", err))?;
        Ok((host, companion))
    }

    pub fn open_companion(&self, config: &ChannelConfig) -> CliResult<ChannelHandle> {
        let companion = self
            .companion
            .create(config.mirrored())
            .map_err(|err| block_error("companion channel create failed", err))?;
        companion
            .wait_ready(Wait::Timeout(SETTLE))
            .map_err(|err| block_error("companion channel not ready", err))?;
        Ok(companion)
    }

    pub fn open_shared_pool(
        &self,
        config: &SharedPoolConfig,
    ) -> CliResult<(SharedPool, SharedPool)> {
        let host = self
            .host
            .create_shared_pool(config.clone())
            .map_err(|err| block_error("host shared pool create failed", err))?;
        let companion = self
            .companion
            .create_shared_pool(config.mirrored())
            .map_err(|err| block_error("companion shared pool create failed", err))?;
        host.wait_ready(Wait::Timeout(SETTLE))
            .map_err(|err| block_error("host shared pool not ready", err))?;
        companion
            .wait_ready(Wait::Timeout(SETTLE))
            .map_err(|err| block_error("companion shared pool not ready", err))?;
        Ok((host, companion))
    }
}

/// Poll until `handle` reaches `state`.
pub fn wait_for_state(handle: &ChannelHandle, state: ChannelState) -> CliResult<()> {
    let deadline = Instant::now() + SETTLE;
    while handle.state() != state {
        if Instant::now() >= deadline {
            return Err(CliError::new(
                TIMEOUT,
                format!(
                    "channel {} stayed {} instead of {state}",
                    handle.channel_id(),
                    handle.state()
                ),
            ));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}
