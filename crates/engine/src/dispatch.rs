//! Algorithm registry and lifecycle-point dispatcher
//!
//! The dispatch table is resolved at registration time: for each point, the
//! subscribed algorithms ordered by (priority, registration index)
//! ascending. Firing a point is atomic with respect to the loop: every
//! subscriber runs, or the first failure aborts the point and propagates.

use std::collections::HashMap;

use checkpoint::ManifestEntry;
use tracing::{debug, trace};
use trainer_core::{Error, LifecyclePoint, Result, State};

use crate::algorithm::{Algorithm, Directive, DispatchContext};

#[derive(Debug, Clone, Copy)]
struct Slot {
    priority: i32,
    index: usize,
}

/// Owns the registered algorithms and fires lifecycle points at them.
#[derive(Default)]
pub struct Dispatcher {
    algorithms: Vec<Box<dyn Algorithm>>,
    table: HashMap<LifecyclePoint, Vec<Slot>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an algorithm. Registration order is the tie-break for equal
    /// priorities and the order of the checkpoint manifest.
    pub fn register(&mut self, algorithm: Box<dyn Algorithm>) -> Result<()> {
        let id = algorithm.id().to_string();
        if self.algorithms.iter().any(|a| a.id() == id) {
            return Err(Error::DuplicateAlgorithm { algorithm: id });
        }

        let index = self.algorithms.len();
        let subscriptions = algorithm.subscriptions();
        self.algorithms.push(algorithm);

        for sub in &subscriptions {
            let slots = self.table.entry(sub.point).or_default();
            slots.push(Slot {
                priority: sub.priority,
                index,
            });
            slots.sort_by_key(|s| (s.priority, s.index));
        }

        debug!(algorithm = %id, subscriptions = subscriptions.len(), "algorithm registered");
        Ok(())
    }

    /// Number of registered algorithms.
    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }

    /// (id, schema_version) pairs in registration order, as recorded into
    /// checkpoints.
    pub fn manifest(&self) -> Vec<ManifestEntry> {
        self.algorithms
            .iter()
            .map(|a| ManifestEntry {
                id: a.id().to_string(),
                schema_version: a.schema_version(),
            })
            .collect()
    }

    /// Fire a lifecycle point with no staged values.
    pub async fn fire(
        &mut self,
        point: LifecyclePoint,
        state: &mut State,
        ctx: &DispatchContext,
    ) -> Result<Directive> {
        self.fire_with(point, state, ctx, |_| Ok(())).await
    }

    /// Fire a lifecycle point, first running `stage` inside the freshly
    /// opened dispatch window. The loop uses the staging hook to publish the
    /// values a point makes visible (batch, outputs, loss) through the same
    /// guarded setters algorithms use.
    ///
    /// Subscribers run sequentially in table order. The strongest directive
    /// wins. Any failure closes the window and aborts the point.
    pub async fn fire_with<F>(
        &mut self,
        point: LifecyclePoint,
        state: &mut State,
        ctx: &DispatchContext,
        stage: F,
    ) -> Result<Directive>
    where
        F: FnOnce(&mut State) -> Result<()>,
    {
        state.open_window(point)?;

        let result = self.run_point(point, state, ctx, stage).await;
        state.close_window();

        result
    }

    async fn run_point<F>(
        &mut self,
        point: LifecyclePoint,
        state: &mut State,
        ctx: &DispatchContext,
        stage: F,
    ) -> Result<Directive>
    where
        F: FnOnce(&mut State) -> Result<()>,
    {
        stage(state)?;

        let slots = match self.table.get(&point) {
            Some(slots) => slots.clone(),
            None => return Ok(Directive::Continue),
        };

        let mut strongest = Directive::Continue;
        for slot in slots {
            let algorithm = &mut self.algorithms[slot.index];
            trace!(point = %point, algorithm = %algorithm.id(), "dispatching");

            let directive =
                algorithm
                    .apply(point, state, ctx)
                    .await
                    .map_err(|e| Error::Dispatch {
                        algorithm: algorithm.id().to_string(),
                        point,
                        message: e.to_string(),
                    })?;
            strongest = strongest.max(directive);
        }

        Ok(strongest)
    }
}
