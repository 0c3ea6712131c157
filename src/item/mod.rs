/*! Work items: the unit of exchange between algorithms and evaluators

This module provides the central trait [WorkItem], which captures
everything the broker connector and the gradient-descent driver need
from a candidate solution: routing identity, the dirty-flag lifecycle,
fitness access, and projection/injection of the active floating-point
parameters. A concrete implementation over a bounded `f64` vector is
provided by [NumericItem].
*/

use derive_more::Display;
use rand::RngCore;

/// Routing identity stamped on a work item by the broker connector
/// before submission: the connector-local submission counter and the
/// item's index in the submitted range.
///
/// The submission counter increases monotonically per connector and
/// never resets, so returns from earlier submissions remain
/// distinguishable from the current one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
#[display(fmt = "{}/{}", submission, position)]
pub struct CourtierId {
    /// The connector-local submission counter at stamping time.
    pub submission: u32,
    /// The item's index in the caller's sequence at submission time.
    pub position: u32,
}

/// The fitness tuple of a work item: the evaluator's raw output and
/// its transformed counterpart.
///
/// The transformation hook exists for constraint handling layered on
/// top of this crate; [NumericItem] uses the identity transform.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Fitness {
    pub raw: f64,
    pub transformed: f64,
}

impl Fitness {
    /// The least useful fitness for the given optimization sense,
    /// used to seed best-so-far accounting.
    pub fn worst(direction: Direction) -> Self {
        Fitness {
            raw: direction.worst(),
            transformed: direction.worst(),
        }
    }
}

/// Selects which half of the [Fitness] tuple a query refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FitnessKind {
    Raw,
    Transformed,
}

/// Controls whether a fitness query on a dirty item may trigger
/// evaluation.
///
/// `Prevent` is used wherever a stale value would corrupt the caller's
/// bookkeeping; querying a dirty item under `Prevent` is an invariant
/// violation and panics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReevalPolicy {
    Allow,
    Prevent,
}

/// The optimization sense of a population.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Direction {
    /// Whether fitness `a` beats fitness `b` in this direction.
    pub fn is_better(self, a: f64, b: f64) -> bool {
        match self {
            Direction::Minimize => a < b,
            Direction::Maximize => a > b,
        }
    }

    /// The worst representable fitness value for this direction.
    pub fn worst(self) -> f64 {
        match self {
            Direction::Minimize => f64::INFINITY,
            Direction::Maximize => f64::NEG_INFINITY,
        }
    }
}

/// The capability set required of anything that travels through the
/// broker and the gradient-descent driver.
///
/// Lifecycle: an item is *dirty* whenever its parameters may have
/// changed since the last evaluation. The driver marks items dirty by
/// assigning parameters; evaluators clear the flag via
/// [WorkItem::process]. While an item is in flight through a buffer
/// port it stays dirty; once it returns processed, its fitness tuple
/// belongs to the current parameter vector.
pub trait WorkItem {
    /// The routing id of the last submission this item took part in,
    /// if any.
    fn courtier_id(&self) -> Option<CourtierId>;

    /// Stamp the routing id. Called by the connector immediately
    /// before the item enters a buffer port.
    fn set_courtier_id(&mut self, id: CourtierId);

    /// Whether the fitness tuple is stale with respect to the current
    /// parameters.
    fn is_dirty(&self) -> bool;

    /// Force the dirty flag. Evaluation is the only way to clear it.
    fn mark_dirty(&mut self);

    /// Evaluate the item in place: compute the fitness tuple for the
    /// current parameters and clear the dirty flag. This is the
    /// entry point used by broker consumers.
    fn process(&mut self);

    /// Query one half of the fitness tuple.
    ///
    /// Idempotent when the item is clean. On a dirty item the policy
    /// decides: `Allow` evaluates first, `Prevent` panics.
    fn fitness(&mut self, kind: FitnessKind, policy: ReevalPolicy) -> f64;

    /// The stored fitness tuple, regardless of the dirty flag.
    fn current_fitness(&self) -> Fitness;

    /// The transformed fitness folded into minimization sense:
    /// smaller is always better. Must only be called on clean items.
    fn min_only_fitness(&self) -> f64;

    /// The optimization sense this item was built with.
    fn direction(&self) -> Direction;

    /// The number of active floating-point parameters.
    fn n_active_doubles(&self) -> usize;

    /// Project the active floating-point parameters into `out`
    /// (cleared first).
    fn streamline_active_doubles(&self, out: &mut Vec<f64>);

    /// Inject a full set of active floating-point parameters and mark
    /// the item dirty. The slice length must match
    /// [WorkItem::n_active_doubles].
    fn assign_active_doubles(&mut self, values: &[f64]);

    /// Report the per-parameter lower and upper boundaries (cleared
    /// first).
    fn active_boundaries(&self, lower: &mut Vec<f64>, upper: &mut Vec<f64>);

    /// Re-initialize the parameters at random within their
    /// boundaries, used to diversify cloned starting points.
    fn random_init(&mut self, rng: &mut dyn RngCore);
}

mod numeric;

pub use numeric::{ItemError, NumericItem};
