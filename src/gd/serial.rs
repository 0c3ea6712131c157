use super::Evaluation;
use crate::connector::ConnectorError;
use crate::item::{FitnessKind, ReevalPolicy, WorkItem};

/// Evaluates every item on the calling thread, in index order.
pub struct Serial;

impl<T: WorkItem> Evaluation<T> for Serial {
    fn run(
        &mut self,
        population: &mut Vec<T>,
        after_first_iteration: bool,
    ) -> Result<bool, ConnectorError> {
        for item in population.iter_mut() {
            debug_assert!(
                !after_first_iteration || item.is_dirty(),
                "evaluation sweep over an item that is not dirty"
            );
            item.fitness(FitnessKind::Transformed, ReevalPolicy::Allow);
        }
        Ok(true)
    }
}
