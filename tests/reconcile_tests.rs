mod util;

use mesh_redistribute::algs::reconcile::{RegionKey, RegionMap, reconcile};
use mesh_redistribute::config::RedistConfig;
use mesh_redistribute::data::{GlobalRegionId, Origin, WorkItem};
use proptest::prelude::*;
use util::run_group;

/// An item created on `rank` as `(rank, local_id)`, labelled `region`.
fn labelled(rank: u32, local_id: u64, region: u64) -> WorkItem<()> {
    let mut it = WorkItem::new(0, local_id, 1.0, ()).with_region(region);
    it.origin = Origin { rank, local_id };
    it
}

fn all_items() -> Vec<WorkItem<()>> {
    vec![
        labelled(2, 0, 7),
        labelled(0, 1, 3),
        labelled(1, 2, 3),
        labelled(0, 3, 3),
        labelled(0, 4, 1),
        labelled(2, 5, 0),
    ]
}

/// Spread `items` round-robin over `n` workers, starting at `offset`.
fn spread(items: &[WorkItem<()>], n: usize, offset: usize) -> Vec<Vec<WorkItem<()>>> {
    let mut out = vec![Vec::new(); n];
    for (i, it) in items.iter().enumerate() {
        out[(i + offset) % n].push(it.clone());
    }
    out
}

fn reconcile_over(n: usize, parts: Vec<Vec<WorkItem<()>>>) -> Vec<(RegionMap, Vec<WorkItem<()>>)> {
    let parts = &parts;
    run_group(n, RedistConfig::default(), move |w| {
        let mut items = parts[w.rank()].clone();
        let pass = w.begin_pass().unwrap();
        let map = reconcile(&w, &pass, &mut items).unwrap();
        pass.finish();
        (map, items)
    })
}

#[test]
fn same_ids_for_two_and_three_workers() {
    let two = reconcile_over(2, spread(&all_items(), 2, 0));
    let three = reconcile_over(3, spread(&all_items(), 3, 1));
    let expected = RegionMap::from_keys(all_items().iter().filter_map(RegionKey::of));
    for (map, _) in two.iter().chain(three.iter()) {
        assert_eq!(map, &expected);
    }
    assert_eq!(expected.len(), 5);
    assert_eq!(expected.lookup(RegionKey::new(0, 1)), GlobalRegionId(0));
    assert_eq!(expected.lookup(RegionKey::new(2, 7)), GlobalRegionId(4));

    let ids = |sets: &[(RegionMap, Vec<WorkItem<()>>)]| {
        let mut v: Vec<(u64, GlobalRegionId)> = sets
            .iter()
            .flat_map(|(_, items)| items.iter().map(|it| (it.origin.local_id, it.global_region)))
            .collect();
        v.sort();
        v
    };
    assert_eq!(ids(&two[..]), ids(&three[..]));
}

#[test]
fn workers_without_regions_still_agree() {
    let mut parts = spread(&all_items(), 3, 0);
    parts[1].iter_mut().for_each(|it| it.region = None);
    let out = reconcile_over(3, parts);
    for (map, items) in &out {
        assert_eq!(map, &out[0].0);
        for it in items.iter().filter(|it| it.region.is_none()) {
            assert!(it.global_region.is_none());
        }
    }
}

proptest! {
    #[test]
    fn prop_map_is_independent_of_submission_order(
        keys in proptest::collection::vec((0u32..4, 0u64..16), 0..40),
        shuffle_seed in any::<u64>(),
    ) {
        let keys: Vec<RegionKey> = keys.into_iter().map(|(r, l)| RegionKey::new(r, l)).collect();
        let mut shuffled = keys.clone();
        // deterministic Fisher-Yates driven by the seed
        let mut s = shuffle_seed | 1;
        for i in (1..shuffled.len()).rev() {
            s ^= s << 13;
            s ^= s >> 7;
            s ^= s << 17;
            shuffled.swap(i, (s % (i as u64 + 1)) as usize);
        }
        let a = RegionMap::from_keys(keys.clone());
        let b = RegionMap::from_keys(shuffled);
        prop_assert_eq!(&a, &b);
        for k in keys {
            let id = a.lookup(k);
            prop_assert!(!id.is_none());
            prop_assert_eq!(a.keys()[id.0 as usize], k);
        }
        prop_assert!(a.keys().windows(2).all(|w| w[0] < w[1]));
    }
}
