//! Property tests for partition coverage, halo containment and ownership
//! agreement across independently built tables.

use halo_core::{ProcessId, Rect};
use halo_partition::{build_scheme, PartitionError, PartitionPolicy, PartitionTable};
use proptest::prelude::*;

fn policy_strategy() -> impl Strategy<Value = PartitionPolicy> {
    prop_oneof![
        Just(PartitionPolicy::UniformGrid),
        Just(PartitionPolicy::QuadTree)
    ]
}

fn assert_tiles(table: &PartitionTable) -> Result<(), TestCaseError> {
    let world = table.world();
    let mut hits = vec![0u8; world.volume()];
    for r in table.rects() {
        for cell in r.cells() {
            let idx = world.linear_index(&cell).expect("owned cell inside the domain");
            hits[idx] += 1;
        }
    }
    prop_assert!(hits.iter().all(|&h| h == 1), "cells covered 0 or 2+ times");
    Ok(())
}

fn assert_halo_margin(table: &PartitionTable) -> Result<(), TestCaseError> {
    let aoi = table.aoi();
    let world = table.world();
    for (i, owned) in table.rects().iter().enumerate() {
        let halo = table.halo_rect(ProcessId(i as u32)).unwrap();
        prop_assert!(halo.contains_rect(owned));
        for a in 0..owned.ndim() {
            let lo_margin = owned.min[a] - halo.min[a];
            let hi_margin = halo.max[a] - owned.max[a];
            if table.is_toroidal() {
                prop_assert_eq!(lo_margin, aoi);
                prop_assert_eq!(hi_margin, aoi);
            } else {
                prop_assert_eq!(lo_margin, aoi.min(owned.min[a] - world.min[a]));
                prop_assert_eq!(hi_margin, aoi.min(world.max[a] - owned.max[a]));
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn partitions_tile_the_domain(
        w in 8i32..80,
        h in 8i32..80,
        procs in 1usize..12,
        aoi in 0i32..3,
        toroidal in any::<bool>(),
        policy in policy_strategy(),
    ) {
        let Ok(scheme) = build_scheme(policy, Rect::from_extents(&[w, h]), aoi, toroidal, procs) else {
            // Some combinations are legitimately too small to split.
            return Ok(());
        };
        let table = scheme.table();
        prop_assert_eq!(table.num_processes(), procs);
        assert_tiles(table)?;
        assert_halo_margin(table)?;
    }

    #[test]
    fn independent_tables_agree_on_owners(
        procs in 1usize..10,
        points in proptest::collection::vec((-50.0f64..150.0, -50.0f64..150.0), 1..64),
        policy in policy_strategy(),
    ) {
        let world = Rect::from_extents(&[100, 100]);
        let a = build_scheme(policy, world.clone(), 2, true, procs).unwrap();
        let b = build_scheme(policy, world, 2, true, procs).unwrap();
        for (x, y) in points {
            let pa = a.table().owner_of_position(&[x, y]).unwrap();
            let pb = b.table().owner_of_position(&[x, y]).unwrap();
            prop_assert_eq!(pa, pb);
            let wrapped = a.table().canonical_position(&[x, y]).unwrap();
            prop_assert!(a.table().rect(pa).unwrap().contains_position(&wrapped));
        }
    }

    #[test]
    fn rebalanced_tables_stay_valid(
        costs in proptest::collection::vec(0.0f64..100.0, 8),
        rounds in 1usize..6,
        policy in policy_strategy(),
    ) {
        let mut scheme = build_scheme(policy, Rect::from_extents(&[120, 90]), 2, false, 8).unwrap();
        for _ in 0..rounds {
            let _ = scheme.rebalance(&costs);
            prop_assert_eq!(scheme.table().num_processes(), 8);
            assert_tiles(scheme.table())?;
            assert_halo_margin(scheme.table())?;
        }
    }
}

#[test]
fn two_by_two_scenario_owners() {
    let scheme = build_scheme(
        PartitionPolicy::UniformGrid,
        Rect::from_extents(&[100, 100]),
        5,
        true,
        4,
    )
    .unwrap();
    let t = scheme.table();
    let from = t.owner_of_position(&[49.9, 50.0]).unwrap();
    let to = t.owner_of_position(&[50.1, 50.0]).unwrap();
    assert_ne!(from, to);
    assert!(t.neighbors(from).contains(&to));
}

#[test]
fn an_oversized_aoi_is_flagged_at_init() {
    for policy in [PartitionPolicy::UniformGrid, PartitionPolicy::QuadTree] {
        let err = build_scheme(policy, Rect::from_extents(&[20, 20]), 5, true, 9)
            .err()
            .expect("nine partitions of a 20x20 domain cannot hold a radius of 5");
        match err {
            PartitionError::AoiTooLarge { aoi, min_extent, .. } => {
                assert_eq!(aoi, 5);
                assert!(min_extent < 10, "{policy:?}: {min_extent}");
            }
            other => panic!("{policy:?}: expected AoiTooLarge, got {other}"),
        }
    }
}

#[test]
fn a_domain_smaller_than_the_process_count_is_not_splittable() {
    for policy in [PartitionPolicy::UniformGrid, PartitionPolicy::QuadTree] {
        let err = build_scheme(policy, Rect::from_extents(&[2, 2]), 0, false, 5)
            .err()
            .expect("four cells cannot host five partitions");
        assert!(matches!(err, PartitionError::NotSplittable { .. }), "{policy:?}: {err}");
    }
}
