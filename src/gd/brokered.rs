use log::warn;

use super::Evaluation;
use crate::connector::{BrokerConnector, ConnectorError, SubmissionMode};
use crate::item::WorkItem;

/// Evaluates items through a [BrokerConnector] in
/// [SubmissionMode::ExpectFull], so every parent can be rejoined with
/// its children by position after the round trip.
pub struct Brokered<T> {
    connector: BrokerConnector<T>,
}

impl<T: WorkItem + Clone + Send + 'static> Brokered<T> {
    pub fn new(connector: BrokerConnector<T>) -> Self {
        Brokered { connector }
    }

    /// The connector, e.g. for configuring timeouts and the
    /// resubmission cap.
    pub fn connector_mut(&mut self) -> &mut BrokerConnector<T> {
        &mut self.connector
    }
}

impl<T: WorkItem + Clone + Send + 'static> Evaluation<T> for Brokered<T> {
    fn run(
        &mut self,
        population: &mut Vec<T>,
        after_first_iteration: bool,
    ) -> Result<bool, ConnectorError> {
        debug_assert!(
            !after_first_iteration || population.iter().all(WorkItem::is_dirty),
            "evaluation sweep over an item that is not dirty"
        );

        let end = population.len();
        let complete = self
            .connector
            .work_on(population, 0, end, SubmissionMode::ExpectFull)?;
        if !complete {
            warn!("incomplete brokered evaluation sweep, population left untouched");
        }
        Ok(complete)
    }
}
