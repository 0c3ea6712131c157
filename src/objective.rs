/*! The fitness-function seam between work items and evaluators */

use auto_impl::auto_impl;

/// A scalar objective function over a vector of floating-point
/// parameters.
///
/// Implementations must be callable from any thread: local worker
/// pools and broker consumers evaluate items concurrently, and a
/// population shares one objective handle across all of its items.
///
/// Smaller-is-better versus larger-is-better is not a property of the
/// objective; it is expressed by the item's
/// [Direction][crate::item::Direction].
#[auto_impl(&, Box, Arc)]
pub trait Objective: Send + Sync {
    /// Evaluate the objective at the given parameter vector.
    fn value(&self, params: &[f64]) -> f64;
}
