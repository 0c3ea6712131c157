/*!
# Population Descent

This crate implements population-based gradient descent on top of a
brokered, distributed evaluation layer. Candidate solutions are plain
*work items* carrying a bounded vector of floating-point parameters and
a fitness tuple; fitness computation is decoupled from the optimization
algorithm and may happen on the calling thread, on a local worker pool,
or behind a broker that fans work out to consumer threads.

## Scope

The crate is a low-level library: it provides the broker plumbing
(buffer ports, the broker itself, the per-algorithm connector), the
gradient-descent driver in three evaluation flavors, and the narrow
[Algorithm][algorithm::Algorithm] interface with an enclosing optimize
loop. It deliberately does not provide a command-line tool, a
configuration-file format, or a network transport; higher-level
facilities may be built on this foundation.

## Structure

- [item]: the work-item capability set and a concrete numeric item
- [objective]: the fitness-function seam
- [broker]: buffer ports and the consumer-driven broker
- [connector]: per-algorithm submission gateway with adaptive waits
- [pool]: a fire-and-wait worker pool
- [gd]: the gradient-descent driver and its evaluation strategies
- [algorithm]: the algorithm interface, halt criteria, and optimize loop
*/

pub mod algorithm;
pub mod broker;
pub mod connector;
pub mod gd;
pub mod item;
pub mod objective;
pub mod pool;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::item::NumericItem;
    use crate::objective::Objective;

    /// The classic sphere function, `f(x) = sum x_j^2`.
    pub struct Sphere;

    impl Objective for Sphere {
        fn value(&self, params: &[f64]) -> f64 {
            params.iter().map(|x| x * x).sum()
        }
    }

    /// An objective that ignores its input, for stall and bookkeeping tests.
    pub struct Flat;

    impl Objective for Flat {
        fn value(&self, _params: &[f64]) -> f64 {
            42.0
        }
    }

    // helper function for sphere items with the [-10, 10] default range
    pub fn sphere_item(params: &[f64]) -> NumericItem {
        NumericItem::with_uniform_bounds(params.to_vec(), -10.0, 10.0, Arc::new(Sphere))
            .expect("valid test item")
    }
}
