//! Deterministic in-memory provisioning gateway.
//!
//! Used by the daemon's `--simulate` mode and by tests. Every operation
//! takes a fixed number of status polls to complete; failures and hangs
//! are injected explicitly, never at random.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use accelgrid_state::ClusterType;

use crate::gateway::{GatewayError, GatewayFuture, ProvisionPhase, ProvisioningGateway};

/// Gateway operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimOp {
    Create,
    Resize,
    Delete,
    Status,
}

#[derive(Debug, Clone)]
pub struct SimInstance {
    pub type_id: String,
    pub node_count: u32,
    pub polls_remaining: u32,
    pub deleting: bool,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    instances: BTreeMap<String, SimInstance>,
    /// Remaining injected failures per operation.
    failures: HashMap<SimOp, u32>,
    /// Instances whose operations never complete.
    stuck: HashMap<String, bool>,
    stuck_all: bool,
    calls: HashMap<SimOp, u32>,
}

pub struct SimulatedGateway {
    polls_until_ready: u32,
    delay: Duration,
    state: Mutex<SimState>,
}

impl SimulatedGateway {
    /// Operations complete on the `polls_until_ready + 1`-th status call.
    pub fn new(polls_until_ready: u32) -> Self {
        Self {
            polls_until_ready,
            delay: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `times` calls of `op` with `Unavailable`.
    pub fn fail_next(&self, op: SimOp, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// Keep every operation in progress forever.
    pub fn set_stuck(&self, stuck: bool) {
        self.lock().stuck_all = stuck;
    }

    /// Keep one instance in progress forever.
    pub fn set_instance_stuck(&self, instance_id: &str, stuck: bool) {
        self.lock().stuck.insert(instance_id.to_string(), stuck);
    }

    pub fn calls(&self, op: SimOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn instance(&self, instance_id: &str) -> Option<SimInstance> {
        self.lock().instances.get(instance_id).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and consume an injected failure if one is pending.
    fn begin(&self, op: SimOp) -> Result<(), GatewayError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Unavailable(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ProvisioningGateway for SimulatedGateway {
    fn create<'a>(
        &'a self,
        cluster_type: &'a ClusterType,
        node_count: u32,
    ) -> GatewayFuture<'a, String> {
        Box::pin(async move {
            self.pause().await;
            self.begin(SimOp::Create)?;
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("sim-{:04}", state.next_id);
            state.instances.insert(
                id.clone(),
                SimInstance {
                    type_id: cluster_type.id.clone(),
                    node_count,
                    polls_remaining: self.polls_until_ready,
                    deleting: false,
                },
            );
            debug!(instance = %id, template = %cluster_type.id, node_count, "simulated create");
            Ok(id)
        })
    }

    fn resize<'a>(&'a self, instance_id: &'a str, node_count: u32) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.begin(SimOp::Resize)?;
            let mut state = self.lock();
            let instance = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| GatewayError::NotFound(instance_id.to_string()))?;
            instance.node_count = node_count;
            instance.polls_remaining = self.polls_until_ready;
            debug!(instance = %instance_id, node_count, "simulated resize");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, instance_id: &'a str) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.begin(SimOp::Delete)?;
            let mut state = self.lock();
            let instance = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| GatewayError::NotFound(instance_id.to_string()))?;
            instance.deleting = true;
            instance.polls_remaining = self.polls_until_ready;
            debug!(instance = %instance_id, "simulated delete");
            Ok(())
        })
    }

    fn status<'a>(&'a self, instance_id: &'a str) -> GatewayFuture<'a, ProvisionPhase> {
        Box::pin(async move {
            self.pause().await;
            self.begin(SimOp::Status)?;
            let mut state = self.lock();
            let stuck = state.stuck_all || state.stuck.get(instance_id).copied().unwrap_or(false);
            let Some(instance) = state.instances.get_mut(instance_id) else {
                return Ok(ProvisionPhase::NotFound);
            };
            if stuck {
                return Ok(ProvisionPhase::InProgress);
            }
            if instance.polls_remaining > 0 {
                instance.polls_remaining -= 1;
                return Ok(ProvisionPhase::InProgress);
            }
            if instance.deleting {
                state.instances.remove(instance_id);
                return Ok(ProvisionPhase::NotFound);
            }
            Ok(ProvisionPhase::Ready {
                node_count: instance.node_count,
            })
        })
    }
}
