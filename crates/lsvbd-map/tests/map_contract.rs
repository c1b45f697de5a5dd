//! The ordered-map contract, exercised uniformly across all four back-ends.

use lsvbd_map::{MapError, MapKind, Mapping, SectorMap};

fn all_maps() -> impl Iterator<Item = SectorMap> {
    MapKind::ALL.into_iter().map(SectorMap::new)
}

#[test]
fn empty_map_answers_negatively() {
    for map in all_maps() {
        let kind = map.kind();
        assert!(map.is_empty(), "{kind}");
        assert_eq!(map.len(), 0, "{kind}");
        assert_eq!(map.lookup(200), None, "{kind}");
        assert_eq!(map.predecessor(200), None, "{kind}");
        assert_eq!(map.greatest_key(), None, "{kind}");
    }
}

#[test]
fn lookup_returns_what_insert_stored() {
    for map in all_maps() {
        let kind = map.kind();
        map.insert(200, Mapping::new(32, 4096)).unwrap();
        map.insert(208, Mapping::new(40, 4096)).unwrap();
        map.insert(216, Mapping::new(48, 2048)).unwrap();

        assert_eq!(map.lookup(200), Some(Mapping::new(32, 4096)), "{kind}");
        assert_eq!(map.lookup(208), Some(Mapping::new(40, 4096)), "{kind}");
        assert_eq!(map.lookup(216), Some(Mapping::new(48, 2048)), "{kind}");
        assert_eq!(map.lookup(204), None, "{kind}");
        assert_eq!(map.len(), 3, "{kind}");
    }
}

#[test]
fn remove_unmaps_and_tolerates_absent_keys() {
    for map in all_maps() {
        let kind = map.kind();
        map.insert(200, Mapping::new(32, 4096)).unwrap();
        map.remove(200);
        assert_eq!(map.lookup(200), None, "{kind}");
        assert!(map.is_empty(), "{kind}");
        // Absent keys are a warning, not a failure.
        map.remove(200);
        map.remove(999);
        assert!(map.is_empty(), "{kind}");
    }
}

#[test]
fn predecessor_is_the_adjacent_smaller_key() {
    // Keys stay within two adjacent 2048-sector chunks so the hashed
    // back-end's one-bucket-back probe always reaches the answer.
    let keys = [100u64, 200, 300, 2050, 2100, 2200];
    for map in all_maps() {
        let kind = map.kind();
        for (i, &k) in keys.iter().enumerate() {
            map.insert(k, Mapping::new(32 + i as u64 * 8, 4096)).unwrap();
        }

        assert_eq!(map.predecessor(100), None, "{kind}");
        assert_eq!(map.predecessor(50), None, "{kind}");
        for pair in keys.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            let got = map.predecessor(hi).map(|(k, _)| k);
            assert_eq!(got, Some(lo), "{kind}: predecessor({hi})");
            // Interior probes resolve to the key they fall after.
            let got = map.predecessor(lo + 1).map(|(k, _)| k);
            assert_eq!(got, Some(lo), "{kind}: predecessor({})", lo + 1);
        }
    }
}

#[test]
fn predecessor_carries_the_mapped_value() {
    for map in all_maps() {
        let kind = map.kind();
        map.insert(200, Mapping::new(32, 4096)).unwrap();
        let (key, value) = map.predecessor(202).expect("interior probe");
        assert_eq!(key, 200, "{kind}");
        assert_eq!(value, Mapping::new(32, 4096), "{kind}");
    }
}

#[test]
fn greatest_key_tracks_inserts() {
    for map in all_maps() {
        let kind = map.kind();
        map.insert(300, Mapping::new(32, 512)).unwrap();
        assert_eq!(map.greatest_key(), Some(300), "{kind}");
        map.insert(100, Mapping::new(33, 512)).unwrap();
        assert_eq!(map.greatest_key(), Some(300), "{kind}");
        map.insert(500, Mapping::new(34, 512)).unwrap();
        assert_eq!(map.greatest_key(), Some(500), "{kind}");
    }
}

#[test]
fn tree_backends_track_greatest_through_removal() {
    // The caching back-ends intentionally keep a high-water mark; the trees
    // answer by traversal and must follow removals exactly.
    for kind in [MapKind::BTree, MapKind::RbTree] {
        let map = SectorMap::new(kind);
        map.insert(100, Mapping::new(32, 512)).unwrap();
        map.insert(200, Mapping::new(33, 512)).unwrap();
        map.remove(200);
        assert_eq!(map.greatest_key(), Some(100), "{kind}");
        map.remove(100);
        assert_eq!(map.greatest_key(), None, "{kind}");
    }
}

#[test]
fn duplicate_insert_is_reported_not_silently_dropped() {
    for map in all_maps() {
        let kind = map.kind();
        map.insert(200, Mapping::new(32, 4096)).unwrap();
        match map.insert(200, Mapping::new(40, 4096)) {
            // Tree and hashed back-ends refuse.
            Err(MapError::DuplicateKey(200)) => {
                assert_eq!(map.lookup(200), Some(Mapping::new(32, 4096)), "{kind}");
            }
            // The skip list's insert is also its update primitive.
            Ok(()) => {
                assert_eq!(kind, MapKind::SkipList);
                assert_eq!(map.lookup(200), Some(Mapping::new(40, 4096)), "{kind}");
            }
            Err(other) => panic!("{kind}: unexpected error {other:?}"),
        }
        assert_eq!(map.len(), 1, "{kind}");
    }
}

#[test]
fn key_zero_is_rejected_by_lock_free_backends() {
    for kind in [MapKind::SkipList, MapKind::Hashed] {
        let map = SectorMap::new(kind);
        assert_eq!(
            map.insert(0, Mapping::new(32, 512)),
            Err(MapError::ReservedKey),
            "{kind}"
        );
        assert!(map.is_empty(), "{kind}");
    }
}

#[test]
fn engine_style_rewrite_cycle() {
    // The write path never issues a true duplicate: it removes, then
    // inserts the fresh mapping. Every back-end must survive that cycle.
    for map in all_maps() {
        let kind = map.kind();
        map.insert(200, Mapping::new(32, 4096)).unwrap();
        map.remove(200);
        map.insert(200, Mapping::new(40, 2048)).unwrap();
        assert_eq!(map.lookup(200), Some(Mapping::new(40, 2048)), "{kind}");
        assert_eq!(map.len(), 1, "{kind}");
    }
}
