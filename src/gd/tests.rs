use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use assert_approx_eq::assert_approx_eq;

use super::{Brokered, GradientDescent, MultiThreaded, Serial};
use crate::algorithm::{
    optimize, Algorithm, CheckpointSink, DiscardSink, DriverError, HaltCriteria, HaltReason, State,
};
use crate::broker::BufferPort;
use crate::connector::BrokerConnector;
use crate::item::{CourtierId, NumericItem, WorkItem};
use crate::tests::{sphere_item, Flat};

type Port = Arc<BufferPort<NumericItem>>;

struct ConsumerGuard {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_consumer<F>(port: &Port, mut serve: F) -> ConsumerGuard
where
    F: FnMut(NumericItem, &BufferPort<NumericItem>) + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let port = Arc::clone(port);
    let stop_flag = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        while !stop_flag.load(Ordering::Acquire) {
            if let Some(item) = port.pop_raw_timed(Duration::from_millis(2)) {
                serve(item, &port);
            }
        }
    });
    ConsumerGuard {
        stop,
        handle: Some(handle),
    }
}

#[test]
fn single_parent_descends_a_quadratic_bowl() {
    let mut driver = GradientDescent::new(vec![sphere_item(&[2.0, 3.0])], Serial);
    driver.init().unwrap();

    // First cycle evaluates the parent and its children; the parent
    // steps at the start of the second cycle.
    driver.cycle_logic().unwrap();
    driver.cycle_logic().unwrap();

    // One-sided difference quotient across a perturbation of
    // h = (finite_step / 1000) * range, stepped with
    // step_ratio = step_size / finite_step. On the [-10, 10] range
    // that amounts to step_size * grad(f) * range / 1000 per
    // coordinate.
    let h = 0.001 / 1000.0 * 20.0;
    let expected_x = 2.0 - 100.0 * ((2.0 + h) * (2.0 + h) + 9.0 - 13.0);
    let expected_y = 3.0 - 100.0 * (4.0 + (3.0 + h) * (3.0 + h) - 13.0);

    let parent = driver.population()[0].params().to_vec();
    assert_approx_eq!(parent[0], expected_x, 1e-9);
    assert_approx_eq!(parent[1], expected_y, 1e-9);
    assert_approx_eq!(parent[0], 1.992, 1e-6);
    assert_approx_eq!(parent[1], 2.988, 1e-6);

    // Further cycles keep descending.
    let mut previous = driver.cycle_logic().unwrap().transformed;
    for _ in 0..5 {
        let best = driver.cycle_logic().unwrap().transformed;
        assert!(best < previous);
        previous = best;
    }
}

#[test]
fn population_is_sized_and_laid_out_per_starting_point() {
    let mut driver = GradientDescent::new(vec![sphere_item(&[1.0, -1.0])], Serial);
    driver.set_n_starting_points(3);
    driver.set_seed(42);
    driver.init().unwrap();

    assert_eq!(driver.population().len(), 3 * (2 + 1));
    assert_eq!(driver.n_processable_items(), 9);

    // Cloned starting points are diversified within the boundaries.
    for parent in &driver.population()[1..3] {
        for &p in parent.params() {
            assert!((-10.0..=10.0).contains(&p));
        }
    }

    driver.cycle_logic().unwrap();

    // Child (i, j) equals parent i except for a finite step in
    // parameter j.
    let h = 0.001 / 1000.0 * 20.0;
    for i in 0..3 {
        let parent = driver.population()[i].params().to_vec();
        for j in 0..2 {
            let child = driver.population()[3 + i * 2 + j].params().to_vec();
            for k in 0..2 {
                if k == j {
                    assert_approx_eq!(child[k], parent[k] + h, 1e-12);
                } else {
                    assert_approx_eq!(child[k], parent[k], 1e-12);
                }
            }
        }
    }
}

#[test]
fn surplus_starting_items_are_truncated() {
    let starts = vec![
        sphere_item(&[1.0]),
        sphere_item(&[2.0]),
        sphere_item(&[3.0]),
    ];
    let mut driver = GradientDescent::new(starts, Serial);
    driver.init().unwrap();
    // N defaults to 1: one parent plus one child per parameter.
    assert_eq!(driver.population().len(), 2);
    assert_eq!(driver.population()[0].params(), &[1.0][..]);
}

#[test]
fn init_rejects_invalid_configurations() {
    let mut empty = GradientDescent::new(Vec::<NumericItem>::new(), Serial);
    assert!(matches!(empty.init(), Err(DriverError::EmptyPopulation)));

    let mut no_params = GradientDescent::new(vec![sphere_item(&[])], Serial);
    assert!(matches!(
        no_params.init(),
        Err(DriverError::NoActiveParameters)
    ));

    let mixed = vec![sphere_item(&[1.0]), sphere_item(&[1.0, 2.0])];
    let mut mismatched = GradientDescent::new(mixed, Serial);
    assert!(matches!(
        mismatched.init(),
        Err(DriverError::DimensionMismatch {
            index: 1,
            expected: 1,
            found: 2
        })
    ));

    let mut bad_step = GradientDescent::new(vec![sphere_item(&[1.0])], Serial);
    bad_step.set_step_size(0.0);
    assert!(matches!(
        bad_step.init(),
        Err(DriverError::StepSizeOutOfRange(s)) if s == 0.0
    ));

    let mut bad_finite = GradientDescent::new(vec![sphere_item(&[1.0])], Serial);
    bad_finite.set_finite_step(1000.5);
    assert!(matches!(
        bad_finite.init(),
        Err(DriverError::FiniteStepOutOfRange(s)) if s == 1000.5
    ));
}

#[test]
fn life_cycle_follows_the_state_machine() {
    let mut driver = GradientDescent::new(vec![sphere_item(&[1.0])], Serial);
    assert_eq!(driver.state(), State::PreInit);
    driver.init().unwrap();
    assert_eq!(driver.state(), State::Running);
    driver.cycle_logic().unwrap();
    assert_eq!(driver.state(), State::Running);
    driver.finalize();
    assert_eq!(driver.state(), State::Halted);
}

#[test]
fn optimize_halts_on_the_iteration_cap() {
    let mut driver = GradientDescent::new(vec![sphere_item(&[3.0, 4.0])], Serial);
    let report = optimize(&mut driver, HaltCriteria::iterations(5), &mut DiscardSink).unwrap();
    assert_eq!(report.iterations, 5);
    assert_eq!(report.halted_by, HaltReason::IterationCap);
    assert!(report.best.transformed < 25.0);
    assert_eq!(driver.state(), State::Halted);
}

#[test]
fn optimize_halts_on_stalls() {
    let item = NumericItem::with_uniform_bounds(vec![1.0], -10.0, 10.0, Arc::new(Flat)).unwrap();
    let mut driver = GradientDescent::new(vec![item], Serial);
    let criteria = HaltCriteria {
        max_stalls: Some(3),
        ..Default::default()
    };
    let report = optimize(&mut driver, criteria, &mut DiscardSink).unwrap();
    // The first iteration "improves" on nothing; the next three stall.
    assert_eq!(report.iterations, 4);
    assert_eq!(report.halted_by, HaltReason::Stall);
    assert_eq!(report.best.transformed, 42.0);
}

#[test]
fn optimize_halts_on_wall_clock() {
    let mut driver = GradientDescent::new(vec![sphere_item(&[1.0])], Serial);
    let criteria = HaltCriteria {
        max_duration: Some(Duration::ZERO),
        ..Default::default()
    };
    let report = optimize(&mut driver, criteria, &mut DiscardSink).unwrap();
    assert_eq!(report.iterations, 1);
    assert_eq!(report.halted_by, HaltReason::WallClock);
}

struct MemorySink {
    entries: Vec<(u32, Vec<u8>)>,
}

impl CheckpointSink for MemorySink {
    fn store(&mut self, iteration: u32, bytes: &[u8]) {
        self.entries.push((iteration, bytes.to_vec()));
    }
}

#[test]
fn checkpoints_are_deterministic_and_delivered_each_iteration() {
    let mut driver = GradientDescent::new(vec![sphere_item(&[1.0, 2.0])], Serial);
    driver.init().unwrap();
    driver.cycle_logic().unwrap();
    // Same population, same bytes.
    assert_eq!(driver.checkpoint(), driver.checkpoint());

    let mut sink = MemorySink {
        entries: Vec::new(),
    };
    let mut driver = GradientDescent::new(vec![sphere_item(&[1.0, 2.0])], Serial);
    optimize(&mut driver, HaltCriteria::iterations(3), &mut sink).unwrap();
    assert_eq!(sink.entries.len(), 3);
    let iterations: Vec<u32> = sink.entries.iter().map(|(i, _)| *i).collect();
    assert_eq!(iterations, vec![1, 2, 3]);
    for (_, bytes) in &sink.entries {
        let parsed: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(parsed["parents"].as_array().unwrap().len(), 1);
    }
}

#[test]
fn multi_threaded_evaluation_matches_serial() {
    let starts = || vec![sphere_item(&[1.0, 2.0, 3.0]), sphere_item(&[-4.0, 0.0, 2.0])];

    let mut serial = GradientDescent::new(starts(), Serial);
    serial.set_n_starting_points(2);
    optimize(&mut serial, HaltCriteria::iterations(5), &mut DiscardSink).unwrap();

    let mut threaded = GradientDescent::new(starts(), MultiThreaded::new(4));
    threaded.set_n_starting_points(2);
    optimize(&mut threaded, HaltCriteria::iterations(5), &mut DiscardSink).unwrap();

    for (a, b) in serial.population()[..2]
        .iter()
        .zip(threaded.population()[..2].iter())
    {
        for (x, y) in a.params().iter().zip(b.params().iter()) {
            assert_approx_eq!(x, y, 1e-12);
        }
    }
}

#[test]
fn brokered_descent_completes_under_packet_loss() {
    let port: Port = Arc::new(BufferPort::new(256));
    // Drop every tenth distinct work item on its first delivery;
    // resubmitted copies are served normally.
    let _consumer = {
        let mut seen: HashSet<CourtierId> = HashSet::new();
        let mut fresh = 0usize;
        spawn_consumer(&port, move |mut item, port| {
            let id = item.courtier_id().unwrap();
            if seen.insert(id) {
                fresh += 1;
                if fresh % 10 == 0 {
                    return;
                }
            }
            item.process();
            port.push_processed(item);
        })
    };

    let mut connector = BrokerConnector::from_port(Arc::clone(&port));
    connector.set_max_resubmissions(3);

    let starts = vec![
        sphere_item(&[1.0, 2.0, 3.0, 4.0, 5.0]),
        sphere_item(&[5.0, 4.0, 3.0, 2.0, 1.0]),
        sphere_item(&[-1.0, -2.0, -3.0, -4.0, -5.0]),
        sphere_item(&[2.0, 2.0, 2.0, 2.0, 2.0]),
    ];
    let initial_best = 20.0; // f of the best starting point
    let mut driver = GradientDescent::new(starts, Brokered::new(connector));
    driver.set_n_starting_points(4);

    let report = optimize(&mut driver, HaltCriteria::iterations(4), &mut DiscardSink).unwrap();
    assert_eq!(report.iterations, 4);
    assert!(report.best.transformed <= initial_best);
    for parent in &driver.population()[..4] {
        assert!(!parent.is_dirty());
    }
}

#[test]
fn brokered_descent_runs_against_a_real_broker() {
    let broker = crate::broker::Broker::new(2);
    let connector = BrokerConnector::new(&broker);

    let mut driver = GradientDescent::new(
        vec![sphere_item(&[2.0, 3.0])],
        Brokered::new(connector),
    );
    let report = optimize(&mut driver, HaltCriteria::iterations(3), &mut DiscardSink).unwrap();

    assert_eq!(report.iterations, 3);
    assert!(report.best.transformed <= 13.0);
    assert!(!driver.population()[0].is_dirty());
}

#[test]
fn incomplete_brokered_iteration_is_skipped_not_fatal() {
    let port: Port = Arc::new(BufferPort::new(64));
    let pass_all = Arc::new(AtomicBool::new(false));
    let _consumer = {
        let pass_all = Arc::clone(&pass_all);
        spawn_consumer(&port, move |mut item, port| {
            let position = item.courtier_id().map(|id| id.position);
            if pass_all.load(Ordering::Acquire) || position == Some(0) {
                item.process();
                port.push_processed(item);
            }
        })
    };

    let mut connector = BrokerConnector::from_port(Arc::clone(&port));
    connector.set_max_resubmissions(0);
    let mut driver = GradientDescent::new(
        vec![sphere_item(&[2.0, 3.0])],
        Brokered::new(connector),
    );
    driver.init().unwrap();

    // Only position 0 returns: the sweep is incomplete, the
    // population stays untouched, and the cycle reports a worst-case
    // fitness instead of failing.
    let first = driver.cycle_logic().unwrap();
    assert!(first.transformed.is_infinite());
    assert_eq!(driver.population()[0].params(), &[2.0, 3.0][..]);
    assert!(driver.population()[0].is_dirty());

    // Once deliveries recover, the next sweep completes; the parent
    // update is skipped because its fitness was stale.
    pass_all.store(true, Ordering::Release);
    let second = driver.cycle_logic().unwrap();
    assert_eq!(second.transformed, 13.0);
    assert_eq!(driver.population()[0].params(), &[2.0, 3.0][..]);

    // With fresh fitness values in place, the following cycle steps.
    driver.cycle_logic().unwrap();
    assert_ne!(driver.population()[0].params(), &[2.0, 3.0][..]);
}
