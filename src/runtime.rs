// 50 Hz control loop with command watchdog
//
// Joint commands arrive over zenoh, are checked for staleness, and are
// routed to the platform. Each tick also dispatches inbound CAN traffic,
// refreshes the fault latch, and publishes joint telemetry and health.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{
    CMD_TIMEOUT, HEARTBEAT_PERIOD, LOOP_HZ, TOPIC_CMD_JOINTS, TOPIC_HEALTH, TOPIC_STATE_JOINTS,
};
use crate::messages::{JointCommand, JointCommands, JointState, PlatformHealth};
use crate::platform::Platform;

pub struct Runtime {
    targets: HashMap<u8, f64>,
    cmd_received_at: Option<Instant>,
    homed: bool,
    health: PlatformHealth,
}

impl Runtime {
    pub fn new(homed: bool) -> Self {
        Self {
            targets: HashMap::new(),
            cmd_received_at: None,
            homed,
            health: PlatformHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> PlatformHealth {
        self.health
    }

    /// Merge a command batch; joints not in the batch keep their last target
    fn on_commands(&mut self, batch: JointCommands) {
        for cmd in batch {
            self.targets.insert(cmd.node_id, cmd.vel_rad_s);
        }
        self.cmd_received_at = Some(Instant::now());
    }

    /// Velocity for every joint in `ids`, zeroed unless everything is healthy
    fn compute_commands(&mut self, ids: &[u8], fault_latched: bool) -> Vec<JointCommand> {
        let stale = match self.cmd_received_at {
            Some(at) => at.elapsed() > CMD_TIMEOUT,
            None => true,
        };

        let health = if !self.homed {
            PlatformHealth::Unhomed
        } else if fault_latched {
            PlatformHealth::Fault
        } else if stale {
            PlatformHealth::CmdStale
        } else {
            PlatformHealth::Ok
        };

        if health != self.health {
            match health {
                PlatformHealth::Ok => info!("Commands active"),
                PlatformHealth::CmdStale => warn!("Commands stale, stopping platform"),
                PlatformHealth::Fault => warn!("Platform fault, stopping platform"),
                PlatformHealth::Unhomed => warn!("Platform not homed, commands ignored"),
            }
        }
        self.health = health;

        ids.iter()
            .map(|&node_id| JointCommand {
                node_id,
                vel_rad_s: match health {
                    PlatformHealth::Ok => self.targets.get(&node_id).copied().unwrap_or(0.0),
                    _ => 0.0,
                },
            })
            .collect()
    }
}

/// Host heartbeat plus a status poll, once per heartbeat period
///
/// Status replies are what the nodes' error flags are built from, so drive
/// faults raised after startup reach the fault latch on a later dispatch.
fn keep_alive(platform: &Platform, last: &mut Instant) {
    if last.elapsed() >= HEARTBEAT_PERIOD {
        platform.send_heartbeat();
        platform.request_status();
        *last = Instant::now();
    }
}

/// Bring the platform up on a blocking thread; true when ready for commands
async fn bring_up(platform: Arc<Platform>, skip_homing: bool) -> Result<bool, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        if skip_homing {
            info!("Homing skipped, restarting drives");
            platform.send_net_start();
            let ok = platform.reset();
            platform.start_watchdog(true);
            ok
        } else {
            platform.init_and_home()
        }
    })
    .await
}

pub async fn run(
    platform: Arc<Platform>,
    skip_homing: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let homed = bring_up(platform.clone(), skip_homing).await?;
    if !homed {
        error!("Platform bring-up failed, holding all joints at zero");
    }

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_JOINTS).await?;
    let pub_joints = session.declare_publisher(TOPIC_STATE_JOINTS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let ids = platform.present_ids();
    let mut runtime = Runtime::new(homed);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let mut last_heartbeat = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout, {} joints",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis(),
        ids.len()
    );
    info!("Subscribed to: {}", TOPIC_CMD_JOINTS);
    info!("Publishing to: {}, {}", TOPIC_STATE_JOINTS, TOPIC_HEALTH);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping platform");
                break;
            }
        }

        // 1. Drain all pending commands (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<JointCommands>(&payload) {
                Ok(batch) => runtime.on_commands(batch),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Inbound CAN traffic and fault latch
        platform.drain_and_dispatch();
        let latched = platform.check_fault();

        // 3. Route commands (includes watchdog logic)
        for cmd in runtime.compute_commands(&ids, latched) {
            platform.set_velocity(cmd.node_id, cmd.vel_rad_s);
        }

        keep_alive(&platform, &mut last_heartbeat);

        // 4. Publish telemetry from the last dispatch, then request the next sample
        let states: Vec<JointState> = ids
            .iter()
            .map(|&node_id| {
                let (pos_rad, vel_rad_s) = platform.position_velocity(node_id);
                JointState {
                    node_id,
                    pos_rad,
                    vel_rad_s,
                }
            })
            .collect();
        // SYNC is a broadcast, one request triggers every node
        if let Some(&first) = ids.first() {
            platform.request_position_velocity(first);
        }
        pub_joints.put(serde_json::to_string(&states)?).await?;

        // 5. Publish health
        pub_health.put(serde_json::to_string(&runtime.health())?).await?;
    }

    for &node_id in &ids {
        platform.set_velocity(node_id, 0.0);
    }
    platform.shutdown();
    Ok(())
}
