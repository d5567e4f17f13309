//! In-process worker group
//!
//! Workers running as tasks on one runtime synchronize through a shared
//! [`tokio::sync::Barrier`]. A reduction is two barrier rounds: every member
//! deposits its contribution, the barrier leader folds the slots, and a
//! second barrier guarantees the folded result is visible to every member
//! before any of them can start the next reduction.

use crate::{Collective, ReduceOp};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tracing::{debug, warn};
use trainer_core::{Error, Result};

struct Shared {
    world_size: u32,
    timeout: Duration,
    barrier: Barrier,
    slots: Mutex<Vec<f64>>,
    result: RwLock<f64>,
}

/// Factory for in-process worker groups.
pub struct LocalGroup;

impl LocalGroup {
    /// Create a group of `world_size` members sharing one barrier.
    ///
    /// Returns one handle per rank, in rank order. All members must
    /// participate in every barrier/reduce or the waiters time out.
    pub fn create(world_size: u32, timeout: Duration) -> Vec<LocalGroupMember> {
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            barrier: Barrier::new(world_size as usize),
            slots: Mutex::new(vec![0.0; world_size as usize]),
            result: RwLock::new(0.0),
        });

        (0..world_size)
            .map(|rank| LocalGroupMember {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One worker's handle into a [`LocalGroup`].
pub struct LocalGroupMember {
    rank: u32,
    shared: Arc<Shared>,
}

impl LocalGroupMember {
    async fn wait_barrier(&self) -> Result<bool> {
        let timeout = self.shared.timeout;
        match tokio::time::timeout(timeout, self.shared.barrier.wait()).await {
            Ok(result) => Ok(result.is_leader()),
            Err(_) => {
                warn!(
                    rank = self.rank,
                    timeout_ms = timeout.as_millis() as u64,
                    "barrier wait timed out"
                );
                Err(Error::BarrierTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl Collective for LocalGroupMember {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.shared.world_size
    }

    async fn barrier(&self) -> Result<()> {
        self.wait_barrier().await?;
        Ok(())
    }

    async fn all_reduce(&self, value: f64, op: ReduceOp) -> Result<f64> {
        self.shared.slots.lock()[self.rank as usize] = value;

        // Round one: all contributions deposited. The leader folds.
        let is_leader = self.wait_barrier().await?;
        if is_leader {
            let slots = self.shared.slots.lock();
            let folded = op.fold(&slots);
            *self.shared.result.write() = folded;
            debug!(rank = self.rank, ?op, folded, "reduction folded");
        }

        // Round two: result visible to every member before anyone proceeds.
        self.wait_barrier().await?;
        Ok(*self.shared.result.read())
    }
}
