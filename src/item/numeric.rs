use std::fmt;
use std::sync::Arc;

use rand::{Rng, RngCore};
use thiserror::Error;

use super::{CourtierId, Direction, Fitness, FitnessKind, ReevalPolicy, WorkItem};
use crate::objective::Objective;

/// Error type returned when a [NumericItem] cannot be constructed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ItemError {
    /// Parameter and boundary vectors disagree in length.
    #[error("mismatched lengths: {params} parameters, {lower} lower bounds, {upper} upper bounds")]
    MismatchedLengths {
        params: usize,
        lower: usize,
        upper: usize,
    },
    /// A lower boundary exceeds its upper counterpart.
    #[error("inverted boundaries at parameter {index}: {lower} > {upper}")]
    InvertedBoundaries {
        index: usize,
        lower: f64,
        upper: f64,
    },
}

/// A work item over a bounded vector of `f64` parameters with a
/// shared objective handle.
///
/// All parameters are considered active. The transformed fitness is
/// the raw objective value (identity transform); maximization is
/// expressed through [Direction] and folded into minimization sense
/// by [WorkItem::min_only_fitness].
#[derive(Clone)]
pub struct NumericItem {
    params: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    objective: Arc<dyn Objective>,
    direction: Direction,
    fitness: Fitness,
    dirty: bool,
    courtier_id: Option<CourtierId>,
}

impl NumericItem {
    /// Construct an item with per-parameter boundaries. The item
    /// starts dirty with a worst-case fitness tuple.
    pub fn new(
        params: Vec<f64>,
        lower: Vec<f64>,
        upper: Vec<f64>,
        objective: Arc<dyn Objective>,
    ) -> Result<Self, ItemError> {
        if params.len() != lower.len() || params.len() != upper.len() {
            return Err(ItemError::MismatchedLengths {
                params: params.len(),
                lower: lower.len(),
                upper: upper.len(),
            });
        }
        for (index, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo > hi {
                return Err(ItemError::InvertedBoundaries {
                    index,
                    lower: lo,
                    upper: hi,
                });
            }
        }
        let direction = Direction::Minimize;
        Ok(NumericItem {
            params,
            lower,
            upper,
            objective,
            direction,
            fitness: Fitness::worst(direction),
            dirty: true,
            courtier_id: None,
        })
    }

    /// Construct an item whose parameters all share the boundary
    /// `[lower, upper]`.
    pub fn with_uniform_bounds(
        params: Vec<f64>,
        lower: f64,
        upper: f64,
        objective: Arc<dyn Objective>,
    ) -> Result<Self, ItemError> {
        let n = params.len();
        Self::new(params, vec![lower; n], vec![upper; n], objective)
    }

    /// Switch the optimization sense. Resets the stored fitness to
    /// the new worst case, so the item must be re-evaluated.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self.fitness = Fitness::worst(direction);
        self.dirty = true;
        self
    }

    /// Read access to the parameter vector.
    pub fn params(&self) -> &[f64] {
        &self.params
    }
}

impl fmt::Debug for NumericItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumericItem")
            .field("params", &self.params)
            .field("fitness", &self.fitness)
            .field("dirty", &self.dirty)
            .field("courtier_id", &self.courtier_id)
            .finish_non_exhaustive()
    }
}

impl WorkItem for NumericItem {
    fn courtier_id(&self) -> Option<CourtierId> {
        self.courtier_id
    }

    fn set_courtier_id(&mut self, id: CourtierId) {
        self.courtier_id = Some(id);
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn process(&mut self) {
        let raw = self.objective.value(&self.params);
        self.fitness = Fitness {
            raw,
            transformed: raw,
        };
        self.dirty = false;
    }

    fn fitness(&mut self, kind: FitnessKind, policy: ReevalPolicy) -> f64 {
        if self.dirty {
            match policy {
                ReevalPolicy::Allow => self.process(),
                ReevalPolicy::Prevent => {
                    panic!("fitness of a dirty work item queried under ReevalPolicy::Prevent")
                }
            }
        }
        match kind {
            FitnessKind::Raw => self.fitness.raw,
            FitnessKind::Transformed => self.fitness.transformed,
        }
    }

    fn current_fitness(&self) -> Fitness {
        self.fitness
    }

    fn min_only_fitness(&self) -> f64 {
        debug_assert!(!self.dirty, "min-only fitness of a dirty work item");
        match self.direction {
            Direction::Minimize => self.fitness.transformed,
            Direction::Maximize => -self.fitness.transformed,
        }
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn n_active_doubles(&self) -> usize {
        self.params.len()
    }

    fn streamline_active_doubles(&self, out: &mut Vec<f64>) {
        out.clear();
        out.extend_from_slice(&self.params);
    }

    fn assign_active_doubles(&mut self, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.params.len(),
            "assigned parameter vector has the wrong length"
        );
        self.params.copy_from_slice(values);
        self.dirty = true;
    }

    fn active_boundaries(&self, lower: &mut Vec<f64>, upper: &mut Vec<f64>) {
        lower.clear();
        lower.extend_from_slice(&self.lower);
        upper.clear();
        upper.extend_from_slice(&self.upper);
    }

    fn random_init(&mut self, rng: &mut dyn RngCore) {
        for (param, (&lo, &hi)) in self
            .params
            .iter_mut()
            .zip(self.lower.iter().zip(self.upper.iter()))
        {
            *param = lo + rng.gen::<f64>() * (hi - lo);
        }
        self.dirty = true;
    }
}
