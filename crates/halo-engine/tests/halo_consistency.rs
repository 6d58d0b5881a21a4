//! Integration test: after every sync, each ghost cell holds its owner's
//! value, and repeated syncs change nothing.

use halo_core::{Coord, ScheduleParams};
use halo_engine::{ClusterConfig, DistributedSimState};
use halo_field::{DenseGrid, FieldHandle};
use halo_partition::PartitionPolicy;
use halo_test_utils::{registry, run_cluster, torus, Ticker};

fn label(cell: &[i32]) -> f64 {
    (cell[0] * 100 + cell[1]) as f64
}

/// Every halo cell, with the value stored locally for it.
fn snapshot(sim: &DistributedSimState, heat: FieldHandle<DenseGrid<f64>>) -> Vec<(Coord, f64)> {
    let field = sim.field(heat).unwrap();
    let world = field.world().clone();
    field
        .halo()
        .cells()
        .map(|cell| {
            let canonical = world.wrap(&cell);
            let value = field.get_local(&canonical).unwrap().unwrap();
            (canonical, value)
        })
        .collect()
}

fn run(policy: PartitionPolicy, n: usize) {
    let config = ClusterConfig {
        end_time: Some(3.0),
        ..torus(&[20, 16], n, policy)
    };
    let results = run_cluster(config, registry(), |mut sim| {
        let heat = sim.register_grid::<f64>("heat").unwrap();
        sim.field_mut(heat)
            .unwrap()
            .update_owned(|cell, v| *v = label(cell))
            .unwrap();
        if sim.pid().is_root() {
            sim.add_agent(
                Ticker::default(),
                &[1.0, 1.0],
                Some(ScheduleParams::repeating(0.0, 1.0, 0)),
            )
            .unwrap();
        }
        sim.start().unwrap();
        let after_start = snapshot(&sim, heat);
        sim.run().unwrap();
        let after_run = snapshot(&sim, heat);
        sim.shutdown().unwrap();
        (after_start, after_run)
    });

    for (after_start, after_run) in results {
        for (cell, value) in &after_start {
            assert_eq!(*value, label(cell), "cell {cell:?}");
        }
        assert_eq!(after_start, after_run);
    }
}

#[test]
fn ghosts_match_owners_on_a_grid_split() {
    run(PartitionPolicy::UniformGrid, 4);
}

#[test]
fn ghosts_match_owners_on_a_quad_tree() {
    run(PartitionPolicy::QuadTree, 4);
}

#[test]
fn a_single_process_torus_wraps_onto_itself() {
    run(PartitionPolicy::UniformGrid, 1);
}
