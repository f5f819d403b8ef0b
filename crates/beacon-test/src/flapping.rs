//! Flapping registration client
//!
//! Registers one instance, stays connected for a while, drops the
//! connection without unregistering, stays away for a while, and starts
//! over. Up and down times are drawn from a seeded RNG so runs repeat.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use beacon_core::InstanceInfo;
use beacon_replication::{RegistrationClient, RegistrationMessage, ReplicationError};
use beacon_transport::MemoryNetwork;

/// Flapping schedule
#[derive(Clone, Debug)]
pub struct FlapSchedule {
    /// Connected time, in milliseconds
    pub up_ms: RangeInclusive<u64>,
    /// Disconnected time, in milliseconds
    pub down_ms: RangeInclusive<u64>,
    pub ack_timeout: Duration,
}

impl Default for FlapSchedule {
    fn default() -> Self {
        FlapSchedule {
            up_ms: 200..=1_000,
            down_ms: 50..=500,
            ack_timeout: Duration::from_secs(1),
        }
    }
}

impl FlapSchedule {
    fn sample_up(&self, rng: &mut StdRng) -> Duration {
        Duration::from_millis(rng.gen_range(self.up_ms.clone()))
    }

    fn sample_down(&self, rng: &mut StdRng) -> Duration {
        Duration::from_millis(rng.gen_range(self.down_ms.clone()))
    }
}

/// Handle to a running flapping client
pub struct FlappingClient {
    cycles: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl FlappingClient {
    /// Start flapping `info` against the registration listener on `addr`
    pub fn start(
        network: MemoryNetwork<RegistrationMessage>,
        addr: SocketAddr,
        info: InstanceInfo,
        schedule: FlapSchedule,
        seed: u64,
    ) -> Self {
        let cycles = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(flap(
            network,
            addr,
            info,
            schedule,
            StdRng::seed_from_u64(seed),
            Arc::clone(&cycles),
            Arc::clone(&failures),
        ));
        FlappingClient {
            cycles,
            failures,
            task,
        }
    }

    /// Completed connect / register / disconnect rounds
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Rounds where connecting or registering failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for FlappingClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn flap(
    network: MemoryNetwork<RegistrationMessage>,
    addr: SocketAddr,
    info: InstanceInfo,
    schedule: FlapSchedule,
    mut rng: StdRng,
    cycles: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
) {
    loop {
        let registered = async {
            let client = RegistrationClient::connect(&network, addr, schedule.ack_timeout).await?;
            client.register(info.clone()).await?;
            Ok::<_, ReplicationError>(client)
        }
        .await;

        match registered {
            Ok(client) => {
                tokio::time::sleep(schedule.sample_up(&mut rng)).await;
                client.disconnect();
                let round = cycles.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(id = info.id(), round, "flapping client went away");
            }
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                debug!(id = info.id(), error = %e, "flapping client could not register");
            }
        }
        tokio::time::sleep(schedule.sample_down(&mut rng)).await;
    }
}
