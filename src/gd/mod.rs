/*! Steepest descent from several starting points within one population

The driver keeps `n_starting_points` parents and, for each parent, one
child per active floating-point parameter. Children are copies of
their parent perturbed by a range-normalized finite step in exactly
one coordinate, so a one-sided difference quotient per coordinate
falls out of a single evaluation sweep over the population. Parents
then step against the resulting gradient estimate.

Population layout: indices `[0, N)` hold the parents; the children of
parent `i` occupy `[N + i*D, N + (i+1)*D)`, where child `j` differs
from the parent in parameter `j` only.

Evaluation is pluggable through the [Evaluation] trait: on the calling
thread ([Serial]), on a worker pool ([MultiThreaded]), or through the
broker connector ([Brokered]).
*/

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::algorithm::{Algorithm, DriverError, State};
use crate::connector::ConnectorError;
use crate::item::{Direction, Fitness, FitnessKind, ReevalPolicy, WorkItem};

mod brokered;
mod serial;
mod threaded;

pub use brokered::Brokered;
pub use serial::Serial;
pub use threaded::MultiThreaded;

/// The default number of simultaneous starting points.
pub const DEFAULT_N_STARTING_POINTS: usize = 1;
/// The default finite step, in per mill of each parameter's range.
pub const DEFAULT_FINITE_STEP: f64 = 0.001;
/// The default step size, in per mill of each parameter's range.
pub const DEFAULT_STEP_SIZE: f64 = 0.1;

/// The seam between the driver and its evaluation back ends.
///
/// `run` evaluates every item of the population in place and reports
/// whether the results of the current iteration are complete. The
/// in-process back ends always report completeness; the brokered one
/// reports what [work_on][crate::connector::BrokerConnector::work_on]
/// observed.
pub trait Evaluation<T: WorkItem> {
    fn run(
        &mut self,
        population: &mut Vec<T>,
        after_first_iteration: bool,
    ) -> Result<bool, ConnectorError>;
}

#[derive(Serialize)]
struct ParentRecord {
    params: Vec<f64>,
    raw: f64,
    transformed: f64,
}

#[derive(Serialize)]
struct ParentSnapshot {
    iteration: u32,
    parents: Vec<ParentRecord>,
}

/// Gradient descent over a population of work items, generic in the
/// evaluation back end.
pub struct GradientDescent<T, E> {
    population: Vec<T>,
    evaluation: E,
    n_starting_points: usize,
    n_fp_params: usize,
    step_size: f64,
    finite_step: f64,
    /// `step_size / finite_step`; recomputed in [Algorithm::init].
    step_ratio: f64,
    lower: Vec<f64>,
    upper: Vec<f64>,
    /// Per-parameter finite step, normalized to the parameter range;
    /// recomputed in [Algorithm::init].
    adjusted_step: Vec<f64>,
    state: State,
    iteration: u32,
    /// Whether the previous evaluation sweep returned complete
    /// results. An incomplete brokered iteration leaves the parents'
    /// fitness stale, so the next parent update must be skipped.
    last_evaluation_complete: bool,
    rng: StdRng,
}

impl<T, E> GradientDescent<T, E>
where
    T: WorkItem + Clone,
    E: Evaluation<T>,
{
    /// Create a driver from at least one starting item and an
    /// evaluation back end. Validation happens in [Algorithm::init].
    pub fn new(starting_items: Vec<T>, evaluation: E) -> Self {
        GradientDescent {
            population: starting_items,
            evaluation,
            n_starting_points: DEFAULT_N_STARTING_POINTS,
            n_fp_params: 0,
            step_size: DEFAULT_STEP_SIZE,
            finite_step: DEFAULT_FINITE_STEP,
            step_ratio: DEFAULT_STEP_SIZE / DEFAULT_FINITE_STEP,
            lower: Vec::new(),
            upper: Vec::new(),
            adjusted_step: Vec::new(),
            state: State::PreInit,
            iteration: 0,
            last_evaluation_complete: true,
            rng: StdRng::from_entropy(),
        }
    }

    /// Set the number of simultaneous starting points.
    pub fn set_n_starting_points(&mut self, n: usize) {
        self.n_starting_points = n.max(1);
    }

    /// The number of simultaneous starting points.
    pub fn n_starting_points(&self) -> usize {
        self.n_starting_points
    }

    /// Set the size of the finite step of the difference quotient, in
    /// per mill of each parameter's range. Validated in
    /// [Algorithm::init].
    pub fn set_finite_step(&mut self, finite_step: f64) {
        self.finite_step = finite_step;
    }

    /// The configured finite step.
    pub fn finite_step(&self) -> f64 {
        self.finite_step
    }

    /// Set the multiplier applied to the difference quotient when
    /// stepping a parent. Validated in [Algorithm::init].
    pub fn set_step_size(&mut self, step_size: f64) {
        self.step_size = step_size;
    }

    /// The configured step size.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Seed the generator used to diversify cloned starting points,
    /// for reproducible runs.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// The current iteration counter.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Read access to the population; parents come first.
    pub fn population(&self) -> &[T] {
        &self.population
    }

    /// Mutable access to the evaluation back end, e.g. to configure
    /// the connector behind [Brokered].
    pub fn evaluation_mut(&mut self) -> &mut E {
        &mut self.evaluation
    }

    /// Bring the population to its working size `N * (D + 1)`: clone
    /// and diversify the exemplar if starting points are missing,
    /// truncate surplus ones, then append `D` clones per parent.
    fn adjust_population(&mut self) {
        let n_start = self.population.len();
        if n_start < self.n_starting_points {
            for _ in 0..self.n_starting_points - n_start {
                let mut clone = self.population[0].clone();
                // Make sure the extra starting points differ.
                clone.random_init(&mut self.rng);
                self.population.push(clone);
            }
        } else {
            self.population.truncate(self.n_starting_points);
        }

        for i in 0..self.n_starting_points {
            for _ in 0..self.n_fp_params {
                let clone = self.population[i].clone();
                self.population.push(clone);
            }
        }
    }

    /// Copy each parent into its children and perturb child `j` in
    /// parameter `j` by the adjusted finite step.
    fn update_child_parameters(&mut self) {
        let (n, d) = (self.n_starting_points, self.n_fp_params);
        let mut parm_vec = Vec::with_capacity(d);
        for i in 0..n {
            self.population[i].streamline_active_doubles(&mut parm_vec);
            for j in 0..d {
                let child_pos = n + i * d + j;
                let mut child = self.population[i].clone();
                let original = parm_vec[j];
                parm_vec[j] += self.adjusted_step[j];
                child.assign_active_doubles(&parm_vec);
                parm_vec[j] = original;
                self.population[child_pos] = child;
            }
        }
    }

    /// Perform a steepest-descent step on each parent, using the
    /// difference quotient between the parent and its children from
    /// the previous evaluation sweep.
    fn update_parent_individuals(&mut self) {
        let (n, d) = (self.n_starting_points, self.n_fp_params);
        let mut parm_vec = Vec::with_capacity(d);
        for i in 0..n {
            debug_assert!(
                !self.population[i].is_dirty(),
                "parent {i} carries a stale fitness"
            );
            self.population[i].streamline_active_doubles(&mut parm_vec);
            let parent_fitness = self.population[i].min_only_fitness();
            for j in 0..d {
                let child_pos = n + i * d + j;
                let child_fitness = self.population[child_pos].min_only_fitness();
                parm_vec[j] -= self.step_ratio * (child_fitness - parent_fitness);
            }
            self.population[i].assign_active_doubles(&parm_vec);
        }
    }

    /// Best fitness over the parents, by transformed fitness in the
    /// population's optimization sense.
    fn best_parent_fitness(&mut self) -> Fitness {
        let direction = self.prefers();
        let mut best = Fitness::worst(direction);
        let mut best_min_only = f64::INFINITY;
        for i in 0..self.n_starting_points {
            let parent = &mut self.population[i];
            let candidate = Fitness {
                raw: parent.fitness(FitnessKind::Raw, ReevalPolicy::Prevent),
                transformed: parent.fitness(FitnessKind::Transformed, ReevalPolicy::Prevent),
            };
            let min_only = parent.min_only_fitness();
            if min_only < best_min_only {
                best_min_only = min_only;
                best = candidate;
            }
        }
        best
    }
}

impl<T, E> Algorithm for GradientDescent<T, E>
where
    T: WorkItem + Clone,
    E: Evaluation<T>,
{
    fn init(&mut self) -> Result<(), DriverError> {
        assert_eq!(self.state, State::PreInit, "init() called twice");

        if self.population.is_empty() {
            return Err(DriverError::EmptyPopulation);
        }

        self.n_fp_params = self.population[0].n_active_doubles();
        if self.n_fp_params == 0 {
            return Err(DriverError::NoActiveParameters);
        }
        for (index, item) in self.population.iter().enumerate().skip(1) {
            let found = item.n_active_doubles();
            if found != self.n_fp_params {
                return Err(DriverError::DimensionMismatch {
                    index,
                    expected: self.n_fp_params,
                    found,
                });
            }
        }

        if self.step_size <= 0.0 || self.step_size > 1000.0 {
            return Err(DriverError::StepSizeOutOfRange(self.step_size));
        }
        if self.finite_step <= 0.0 || self.finite_step > 1000.0 {
            return Err(DriverError::FiniteStepOutOfRange(self.finite_step));
        }

        self.adjust_population();

        self.population[0].active_boundaries(&mut self.lower, &mut self.upper);

        self.step_ratio = self.step_size / self.finite_step;
        let finite_step_ratio = self.finite_step / 1000.0;
        self.adjusted_step = self
            .lower
            .iter()
            .zip(self.upper.iter())
            .map(|(&lo, &hi)| finite_step_ratio * (hi - lo))
            .collect();

        debug!(
            "gradient descent over {} starting points, {} parameters, population {}",
            self.n_starting_points,
            self.n_fp_params,
            self.population.len()
        );

        self.state = State::Running;
        Ok(())
    }

    fn cycle_logic(&mut self) -> Result<Fitness, DriverError> {
        assert_eq!(self.state, State::Running, "cycle_logic() outside Running");

        // Parents can only step once their children have been
        // evaluated, and only on fresh fitness values.
        if self.iteration > 0 && self.last_evaluation_complete {
            self.update_parent_individuals();
        }

        self.update_child_parameters();

        let complete = self
            .evaluation
            .run(&mut self.population, self.iteration > 0)?;
        self.last_evaluation_complete = complete;
        self.iteration += 1;

        if !complete {
            // The evaluation layer left the population untouched; the
            // unchanged parents are resubmitted next iteration.
            debug!(
                "iteration {}: incomplete evaluation, parents unchanged",
                self.iteration
            );
            return Ok(Fitness::worst(self.prefers()));
        }

        Ok(self.best_parent_fitness())
    }

    fn finalize(&mut self) {
        self.state = State::Halted;
    }

    fn state(&self) -> State {
        self.state
    }

    fn n_processable_items(&self) -> usize {
        self.population.len()
    }

    fn prefers(&self) -> Direction {
        self.population
            .first()
            .map(|item| item.direction())
            .unwrap_or(Direction::Minimize)
    }

    fn checkpoint(&self) -> Vec<u8> {
        let parents = self.population[..self.n_starting_points.min(self.population.len())]
            .iter()
            .map(|parent| {
                let mut params = Vec::with_capacity(self.n_fp_params);
                parent.streamline_active_doubles(&mut params);
                let fitness = parent.current_fitness();
                ParentRecord {
                    params,
                    raw: fitness.raw,
                    transformed: fitness.transformed,
                }
            })
            .collect();
        let snapshot = ParentSnapshot {
            iteration: self.iteration,
            parents,
        };
        serde_json::to_vec(&snapshot).expect("parent snapshot serialization cannot fail")
    }
}

#[cfg(test)]
mod tests;
