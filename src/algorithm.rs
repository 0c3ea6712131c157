/*! The narrow interface of optimization algorithms and the loop that
drives them

An [Algorithm] exposes exactly what the enclosing loop needs:
initialization, one iteration of business logic returning the best
fitness found, finalization, and a little metadata. [optimize] drives
the life cycle [PreInit -> Running -> Halted][State] against a set of
[HaltCriteria] and hands a checkpoint byte blob to a [CheckpointSink]
after every iteration.
*/

use std::time::{Duration, Instant};

use auto_impl::auto_impl;
use derive_more::Display;
use thiserror::Error;

use crate::connector::ConnectorError;
use crate::item::{Direction, Fitness};

/// Life-cycle state of an algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum State {
    PreInit,
    Running,
    Halted,
}

/// Error type shared by algorithm initialization and iteration.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The population contains no starting item.
    #[error("the population must contain at least one starting item")]
    EmptyPopulation,
    /// The exemplar item exposes no active floating-point parameters.
    #[error("work items carry no active floating point parameters")]
    NoActiveParameters,
    /// The step size is specified in per mill of the parameter range.
    #[error("step size {0} outside the permissible range ]0, 1000]")]
    StepSizeOutOfRange(f64),
    /// The finite step is specified in per mill of the parameter range.
    #[error("finite step {0} outside the permissible range ]0, 1000]")]
    FiniteStepOutOfRange(f64),
    /// A starting item disagrees with the exemplar about the number
    /// of active parameters.
    #[error("work item {index} carries {found} active parameters, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    /// The evaluation layer failed fatally.
    #[error(transparent)]
    Evaluation(#[from] ConnectorError),
}

/// The contract between an optimization algorithm and the enclosing
/// loop.
pub trait Algorithm {
    /// Prepare for optimization: validate the configuration, size the
    /// population, precompute derived quantities. Transitions the
    /// algorithm from [State::PreInit] to [State::Running].
    fn init(&mut self) -> Result<(), DriverError>;

    /// Run one iteration and report the best fitness it produced.
    fn cycle_logic(&mut self) -> Result<Fitness, DriverError>;

    /// Release resources and transition to [State::Halted].
    fn finalize(&mut self);

    /// The algorithm's current life-cycle state.
    fn state(&self) -> State;

    /// The number of items the algorithm submits for processing per
    /// iteration.
    fn n_processable_items(&self) -> usize;

    /// The optimization sense used to compare fitness values.
    fn prefers(&self) -> Direction;

    /// A deterministic byte snapshot of the algorithm's current best
    /// knowledge; identical populations yield identical bytes.
    fn checkpoint(&self) -> Vec<u8>;
}

/// Receives one checkpoint blob per iteration.
#[auto_impl(&mut, Box)]
pub trait CheckpointSink {
    fn store(&mut self, iteration: u32, bytes: &[u8]);
}

/// A sink that throws checkpoints away.
pub struct DiscardSink;

impl CheckpointSink for DiscardSink {
    fn store(&mut self, _iteration: u32, _bytes: &[u8]) {}
}

/// Halt conditions for [optimize]. At least one criterion should be
/// set; otherwise the loop runs until an error occurs.
#[derive(Copy, Clone, Debug, Default)]
pub struct HaltCriteria {
    /// Stop after this many iterations.
    pub max_iterations: Option<u32>,
    /// Stop once this much wall-clock time has passed.
    pub max_duration: Option<Duration>,
    /// Stop after this many consecutive iterations without
    /// improvement of the best fitness.
    pub max_stalls: Option<u32>,
}

impl HaltCriteria {
    /// Convenience: halt on an iteration cap only.
    pub fn iterations(max: u32) -> Self {
        HaltCriteria {
            max_iterations: Some(max),
            ..Default::default()
        }
    }
}

/// Why [optimize] stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum HaltReason {
    IterationCap,
    WallClock,
    Stall,
}

/// The result of a completed optimization run.
#[derive(Clone, Debug)]
pub struct Optimum {
    /// Best fitness observed over all iterations.
    pub best: Fitness,
    /// Number of iterations performed.
    pub iterations: u32,
    /// The halt condition that ended the run.
    pub halted_by: HaltReason,
}

/// Drive an algorithm from initialization to a halt condition.
///
/// Each iteration's best fitness is compared against the best seen so
/// far (in the algorithm's preferred direction) for stall accounting,
/// and the checkpoint bytes are handed to `sink`. On an iteration
/// error the algorithm is finalized before the error is returned.
pub fn optimize<A, S>(
    algorithm: &mut A,
    criteria: HaltCriteria,
    sink: &mut S,
) -> Result<Optimum, DriverError>
where
    A: Algorithm + ?Sized,
    S: CheckpointSink + ?Sized,
{
    algorithm.init()?;
    let direction = algorithm.prefers();
    let started = Instant::now();

    let mut best: Option<Fitness> = None;
    let mut stalls = 0u32;
    let mut iterations = 0u32;

    let halted_by = loop {
        let fitness = match algorithm.cycle_logic() {
            Ok(fitness) => fitness,
            Err(e) => {
                algorithm.finalize();
                return Err(e);
            }
        };
        iterations += 1;

        let improved = match best {
            None => true,
            Some(so_far) => direction.is_better(fitness.transformed, so_far.transformed),
        };
        if improved {
            best = Some(fitness);
            stalls = 0;
        } else {
            stalls += 1;
        }

        sink.store(iterations, &algorithm.checkpoint());

        if criteria.max_iterations.is_some_and(|cap| iterations >= cap) {
            break HaltReason::IterationCap;
        }
        if criteria
            .max_duration
            .is_some_and(|cap| started.elapsed() >= cap)
        {
            break HaltReason::WallClock;
        }
        if criteria.max_stalls.is_some_and(|cap| stalls >= cap) {
            break HaltReason::Stall;
        }
    };

    algorithm.finalize();
    Ok(Optimum {
        // At least one iteration ran, so a best value exists.
        best: best.expect("optimize ran at least one iteration"),
        iterations,
        halted_by,
    })
}
