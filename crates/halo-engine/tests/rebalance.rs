//! Integration test: load balancing moves partition boundaries without
//! losing or duplicating agents or field objects.

use halo_core::{ProcessId, ScheduleParams};
use halo_engine::{BalanceConfig, ClusterConfig, CostMetric, DistributedSimState};
use halo_partition::PartitionPolicy;
use halo_test_utils::{registry, run_cluster, torus, RandomWalker, Ticker, Walker};

const AGENTS: usize = 40;

fn skewed(policy: PartitionPolicy) -> ClusterConfig {
    ClusterConfig {
        end_time: Some(12.0),
        seed: 7,
        balance: Some(BalanceConfig {
            interval: 2,
            skew_threshold: 1.1,
            window: 1,
            metric: CostMetric::AgentCount,
        }),
        ..torus(&[40, 40], 4, policy)
    }
}

fn run(policy: PartitionPolicy) {
    let results = run_cluster(skewed(policy), registry(), |mut sim| {
        let bodies = sim.register_continuous::<u32>("bodies").unwrap();
        if sim.pid().is_root() {
            for i in 0..AGENTS {
                let position = [2.0 + (i % 8) as f64, 2.0 + (i / 8) as f64];
                sim.add_agent_in(
                    RandomWalker::new(0.5),
                    bodies,
                    &position,
                    i as u32,
                    Some(ScheduleParams::repeating(1.0, 1.0, 0)),
                )
                .unwrap();
            }
        }
        let initial = sim.table().clone();
        sim.run().unwrap();

        let table = sim.table().clone();
        table.validate().unwrap();
        let field = sim.field(bodies).unwrap();
        let mut ids = field.owned_ids().unwrap();
        ids.sort();
        let mut residents: Vec<_> = sim.agent_ids().collect();
        residents.sort();
        let owners_agree = sim.agent_ids().all(|id| {
            let position = sim.agent_position(id).unwrap();
            table.owner_of_position(position).unwrap() == sim.pid()
        });
        sim.shutdown().unwrap();
        (initial, table, ids, residents, owners_agree)
    });

    let (initial, table, ..) = &results[0];
    assert!(table.version() > initial.version(), "skewed load must trigger a rebalance");
    assert_ne!(table.rects(), initial.rects());

    let mut all_agents = Vec::new();
    let mut all_entries = Vec::new();
    for (_, t, ids, residents, owners_agree) in &results {
        assert_eq!(t, table, "every process must hold the same table");
        assert!(owners_agree);
        assert_eq!(ids, residents, "each agent's field entry lives with it");
        all_agents.extend(residents.iter().copied());
        all_entries.extend(ids.iter().copied());
    }
    all_agents.sort();
    all_agents.dedup();
    assert_eq!(all_agents.len(), AGENTS);
    assert_eq!(all_entries.len(), AGENTS);
}

#[test]
fn quad_tree_rebalance_conserves_agents() {
    run(PartitionPolicy::QuadTree);
}

#[test]
fn grid_rebalance_conserves_agents() {
    run(PartitionPolicy::UniformGrid);
}

const TICKERS: usize = 7;

type Walkers = Vec<(Vec<f64>, Option<ScheduleParams>)>;

/// Position and pending event of every resident left of the ticker column.
fn walkers(sim: &DistributedSimState) -> Walkers {
    sim.agent_ids()
        .filter_map(|id| {
            let position = sim.agent_position(id)?.to_vec();
            (position[0] < 30.0).then(|| (position, sim.pending_event(id)))
        })
        .collect()
}

struct Handover {
    pid: ProcessId,
    crossed: ProcessId,
    owner: ProcessId,
    rebalanced: bool,
    version: u64,
    first: Walkers,
    count: usize,
    last: Walkers,
    final_count: usize,
}

fn holders(results: &[Handover], pick: fn(&Handover) -> &Walkers) -> Vec<ProcessId> {
    results.iter().filter(|r| !pick(r).is_empty()).map(|r| r.pid).collect()
}

#[test]
fn agent_arriving_on_a_rebalance_step_keeps_its_schedule() {
    // Two slabs split at x = 20. The walker crosses into p1 on step 1,
    // where the tickers make p1 hot; the same step's rebalance moves the
    // cut to x = 30 and hands the walker straight back to p0.
    let config = ClusterConfig {
        end_time: Some(3.5),
        balance: Some(BalanceConfig {
            interval: 1,
            skew_threshold: 1.1,
            window: 1,
            metric: CostMetric::AgentCount,
        }),
        ..torus(&[40, 20], 2, PartitionPolicy::UniformGrid)
    };
    let results = run_cluster(config, registry(), |mut sim| {
        if sim.pid().is_root() {
            sim.add_agent(
                Walker::new(&[0.2, 0.0]),
                &[19.9, 10.0],
                Some(ScheduleParams::repeating(1.0, 1.0, 0)),
            )
            .unwrap();
            for k in 0..TICKERS {
                sim.add_agent(
                    Ticker::default(),
                    &[35.5, 1.5 + 2.0 * k as f64],
                    Some(ScheduleParams::repeating(1.0, 1.0, 0)),
                )
                .unwrap();
            }
        }
        sim.start().unwrap();
        let crossed = sim.table().owner_of_position(&[20.1, 10.0]).unwrap();

        assert!(sim.step().unwrap());
        let rebalanced = sim.metrics().rebalanced;
        let version = sim.table().version();
        let owner = sim.table().owner_of_position(&[20.1, 10.0]).unwrap();
        let first = walkers(&sim);
        let count = sim.agent_count();

        while sim.step().unwrap() {}
        let last = walkers(&sim);
        let final_count = sim.agent_count();
        sim.shutdown().unwrap();
        Handover {
            pid: sim.pid(),
            crossed,
            owner,
            rebalanced,
            version,
            first,
            count,
            last,
            final_count,
        }
    });

    assert_eq!(results[0].crossed, ProcessId(1), "the walker's step must cross the initial cut");
    assert_eq!(results[0].owner, ProcessId(0), "the rebalance must move the cut past the walker");
    for r in &results {
        assert!(r.rebalanced, "{}: step 1 must rebalance", r.pid);
        assert_eq!(r.version, 1);
    }

    assert_eq!(holders(&results, |r| &r.first), vec![ProcessId(0)]);
    let (position, schedule) = &results[0].first[0];
    assert!((position[0] - 20.1).abs() < 1e-9);
    assert_eq!(position[1], 10.0);
    assert_eq!(*schedule, Some(ScheduleParams::repeating(2.0, 1.0, 0)));
    assert_eq!(results.iter().map(|r| r.count).sum::<usize>(), TICKERS + 1);

    // It keeps stepping from its new home at t = 2 and 3.
    assert_eq!(holders(&results, |r| &r.last), vec![ProcessId(0)]);
    assert!((results[0].last[0].0[0] - 20.5).abs() < 1e-9);
    assert_eq!(results.iter().map(|r| r.final_count).sum::<usize>(), TICKERS + 1);
}
