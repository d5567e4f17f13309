//! Lifecycle points of the training loop
//!
//! The loop fires a fixed, totally ordered sequence of named points; the
//! dispatcher invokes subscribed algorithms at each one. The set is closed:
//! extension happens by subscribing to these points, never by adding ad-hoc
//! ones at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named moment in the training loop at which algorithms may run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecyclePoint {
    /// Start of a training epoch
    BeforeEpoch,

    /// A batch is about to be processed
    BeforeBatch,

    /// The batch has been pulled from the data source and is visible in State
    AfterDataloader,

    /// Forward pass is about to run
    BeforeForward,

    /// Forward outputs are visible in State
    AfterForward,

    /// Loss computation is about to run
    BeforeLoss,

    /// Loss value is visible in State
    AfterLoss,

    /// Backward pass is about to run
    BeforeBackward,

    /// Gradients have been computed
    AfterBackward,

    /// Optimizer step is about to run
    BeforeOptimizerStep,

    /// Optimizer step has completed
    AfterOptimizerStep,

    /// The batch is done; mandatory cleanup point
    AfterBatch,

    /// End of a training epoch
    AfterEpoch,

    /// Start of an evaluation phase
    EvalStart,

    /// One evaluation batch has been processed
    EvalBatch,

    /// End of an evaluation phase
    EvalEnd,
}

impl LifecyclePoint {
    /// The fixed per-batch firing order.
    ///
    /// Every training batch fires exactly this sequence, in this order,
    /// whether or not anything subscribes to a given point.
    pub const BATCH_SEQUENCE: [LifecyclePoint; 11] = [
        LifecyclePoint::BeforeBatch,
        LifecyclePoint::AfterDataloader,
        LifecyclePoint::BeforeForward,
        LifecyclePoint::AfterForward,
        LifecyclePoint::BeforeLoss,
        LifecyclePoint::AfterLoss,
        LifecyclePoint::BeforeBackward,
        LifecyclePoint::AfterBackward,
        LifecyclePoint::BeforeOptimizerStep,
        LifecyclePoint::AfterOptimizerStep,
        LifecyclePoint::AfterBatch,
    ];

    /// Returns true for evaluation-phase points.
    pub fn is_eval(&self) -> bool {
        matches!(
            self,
            LifecyclePoint::EvalStart | LifecyclePoint::EvalBatch | LifecyclePoint::EvalEnd
        )
    }

    /// Returns true for closing points that must still fire when an
    /// algorithm signals a batch skip.
    pub fn is_closing(&self) -> bool {
        matches!(self, LifecyclePoint::AfterBatch | LifecyclePoint::AfterEpoch)
    }

    /// Returns true for points that fire once per epoch rather than once
    /// per batch.
    pub fn is_epoch_level(&self) -> bool {
        matches!(self, LifecyclePoint::BeforeEpoch | LifecyclePoint::AfterEpoch)
    }

    /// Stable lowercase name, used in logs and dispatch diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePoint::BeforeEpoch => "before_epoch",
            LifecyclePoint::BeforeBatch => "before_batch",
            LifecyclePoint::AfterDataloader => "after_dataloader",
            LifecyclePoint::BeforeForward => "before_forward",
            LifecyclePoint::AfterForward => "after_forward",
            LifecyclePoint::BeforeLoss => "before_loss",
            LifecyclePoint::AfterLoss => "after_loss",
            LifecyclePoint::BeforeBackward => "before_backward",
            LifecyclePoint::AfterBackward => "after_backward",
            LifecyclePoint::BeforeOptimizerStep => "before_optimizer_step",
            LifecyclePoint::AfterOptimizerStep => "after_optimizer_step",
            LifecyclePoint::AfterBatch => "after_batch",
            LifecyclePoint::AfterEpoch => "after_epoch",
            LifecyclePoint::EvalStart => "eval_start",
            LifecyclePoint::EvalBatch => "eval_batch",
            LifecyclePoint::EvalEnd => "eval_end",
        }
    }
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
