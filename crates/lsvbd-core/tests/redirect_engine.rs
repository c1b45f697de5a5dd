//! Redirection-engine behavior pinned sector by sector: classification,
//! allocation, exact-match and interior resolution, splitting, and the
//! passthrough paths.

use std::sync::Arc;

use lsvbd_core::{
    CloneRecord, Engine, IoOp, IoRequest, MapKind, RecordingSink, Registry, VbdError,
    SECTOR_OFFSET,
};

fn setup(kind: MapKind) -> (Engine, Arc<RecordingSink>) {
    let registry = Registry::new();
    registry.set_data_structure(kind.tag()).unwrap();
    let sink = Arc::new(RecordingSink::new());
    registry
        .bind_with_sink(1, "mem0".to_string(), sink.clone())
        .unwrap();
    (Engine::new(registry), sink)
}

fn run(engine: &Engine, op: IoOp, lba: u64, bytes: usize) {
    let request = IoRequest::new("lsvbd1", op, lba, vec![0xA5; bytes]);
    let done = request.completion.clone();
    engine.submit(request);
    done.wait().unwrap();
}

fn record(op: IoOp, target_sector: u64, len_bytes: u32, payload_offset: u32) -> CloneRecord {
    CloneRecord {
        op,
        target_sector,
        len_bytes,
        payload_offset,
    }
}

/// Scenarios A through E as one continuing history on a fresh device.
fn scenario_a_through_e(kind: MapKind) {
    let (engine, sink) = setup(kind);
    let registry = engine.registry().clone();
    let map_len = |n| {
        assert_eq!(
            registry.device_at(0).unwrap().map().len(),
            n,
            "{kind}: map length"
        )
    };

    // A: read on an empty map is system I/O, unredirected and unmapped.
    assert_eq!(registry.log_head(), SECTOR_OFFSET, "{kind}");
    run(&engine, IoOp::Read, 100, 4096);
    assert_eq!(sink.take(), vec![record(IoOp::Read, 100, 4096, 0)], "{kind}: A");
    map_len(0);

    // B: first write allocates 8 sectors at the offset.
    run(&engine, IoOp::Write, 200, 4096);
    assert_eq!(registry.log_head(), 40, "{kind}: B allocator");
    assert_eq!(sink.take(), vec![record(IoOp::Write, 32, 4096, 0)], "{kind}: B");
    map_len(1);

    // C: exact-match read, no split.
    run(&engine, IoOp::Read, 200, 4096);
    assert_eq!(sink.take(), vec![record(IoOp::Read, 32, 4096, 0)], "{kind}: C");

    // D: interior read two sectors into the write; fits the segment tail.
    run(&engine, IoOp::Read, 202, 2048);
    assert_eq!(sink.take(), vec![record(IoOp::Read, 34, 2048, 0)], "{kind}: D");

    // E: rewriting the same LBA allocates again and replaces the mapping.
    run(&engine, IoOp::Write, 200, 2048);
    assert_eq!(registry.log_head(), 44, "{kind}: E allocator");
    assert_eq!(sink.take(), vec![record(IoOp::Write, 40, 2048, 0)], "{kind}: E");
    map_len(1);
    assert_eq!(
        registry.device_at(0).unwrap().map().lookup(200).unwrap(),
        lsvbd_core::Mapping::new(40, 2048),
        "{kind}: E mapping"
    );
}

/// Scenario F continues from B only: a second write, then a read spanning
/// both segments splits and re-targets at the mapped boundary.
fn scenario_f(kind: MapKind) {
    let (engine, sink) = setup(kind);

    run(&engine, IoOp::Write, 200, 4096);
    run(&engine, IoOp::Write, 208, 4096);
    assert_eq!(engine.registry().log_head(), 48, "{kind}: F allocator");
    sink.take();

    run(&engine, IoOp::Read, 200, 8192);
    assert_eq!(
        sink.take(),
        vec![
            record(IoOp::Read, 32, 4096, 0),
            record(IoOp::Read, 40, 4096, 4096),
        ],
        "{kind}: F"
    );
}

#[test]
fn end_to_end_scenarios_on_every_backend() {
    for kind in MapKind::ALL {
        scenario_a_through_e(kind);
        scenario_f(kind);
    }
}

#[test]
fn single_sector_write_advances_allocator_by_one() {
    let (engine, sink) = setup(MapKind::SkipList);
    run(&engine, IoOp::Write, 300, 512);
    assert_eq!(engine.registry().log_head(), SECTOR_OFFSET + 1);
    assert_eq!(sink.take(), vec![record(IoOp::Write, 32, 512, 0)]);
}

#[test]
fn duplicate_writes_advance_once_each_and_keep_latest_mapping() {
    let (engine, sink) = setup(MapKind::Hashed);
    for _ in 0..3 {
        run(&engine, IoOp::Write, 200, 4096);
    }
    // Three writes, eight sectors each: no double-advance, no skipped range.
    assert_eq!(engine.registry().log_head(), SECTOR_OFFSET + 24);
    let clones = sink.take();
    assert_eq!(clones.len(), 3);
    assert_eq!(clones[2].target_sector, SECTOR_OFFSET + 16);

    let device = engine.registry().device_at(0).unwrap();
    assert_eq!(device.map().len(), 1);
    assert_eq!(
        device.map().lookup(200).unwrap().pba_start,
        SECTOR_OFFSET + 16
    );
}

#[test]
fn write_pba_ranges_are_pairwise_disjoint() {
    let (engine, sink) = setup(MapKind::SkipList);
    // Rewrites included: every accepted write gets a private range.
    for (lba, sectors) in [(200u64, 8u32), (200, 4), (512, 1), (9000, 16), (200, 8)] {
        run(&engine, IoOp::Write, lba, (sectors * 512) as usize);
    }
    let mut ranges: Vec<(u64, u64)> = sink
        .take()
        .iter()
        .map(|c| (c.target_sector, c.target_sector + u64::from(c.len_bytes / 512)))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping ranges {pair:?}");
    }
}

#[test]
fn read_above_greatest_key_passes_through() {
    let (engine, sink) = setup(MapKind::SkipList);
    run(&engine, IoOp::Write, 200, 4096);
    sink.take();

    // 5000 is beyond every mapped key: bring-up probe semantics.
    run(&engine, IoOp::Read, 5000, 4096);
    assert_eq!(sink.take(), vec![record(IoOp::Read, 5000, 4096, 0)]);
}

#[test]
fn read_at_sector_zero_passes_through() {
    let (engine, sink) = setup(MapKind::SkipList);
    run(&engine, IoOp::Write, 200, 4096);
    sink.take();

    run(&engine, IoOp::Read, 0, 512);
    assert_eq!(sink.take(), vec![record(IoOp::Read, 0, 512, 0)]);
}

#[test]
fn read_below_all_mappings_without_predecessor_passes_through() {
    let (engine, sink) = setup(MapKind::BTree);
    run(&engine, IoOp::Write, 200, 4096);
    sink.take();

    // 50 < 200 <= greatest, not system I/O, but it has no predecessor:
    // the clone completes unredirected.
    run(&engine, IoOp::Read, 50, 1024);
    assert_eq!(sink.take(), vec![record(IoOp::Read, 50, 1024, 0)]);
}

#[test]
fn interior_read_spilling_past_segment_end_splits() {
    let (engine, sink) = setup(MapKind::RbTree);
    run(&engine, IoOp::Write, 200, 4096); // pba 32..40
    run(&engine, IoOp::Write, 208, 4096); // pba 40..48
    sink.take();

    // Starts 2 sectors into the first segment, runs 2 sectors into the
    // second: first piece covers the segment tail, remainder re-targets.
    run(&engine, IoOp::Read, 202, 4096);
    assert_eq!(
        sink.take(),
        vec![
            record(IoOp::Read, 34, 3072, 0),
            record(IoOp::Read, 40, 1024, 3072),
        ]
    );
}

#[test]
fn exact_read_longer_than_chain_finishes_past_last_segment() {
    let (engine, sink) = setup(MapKind::SkipList);
    run(&engine, IoOp::Write, 200, 4096); // pba 32..40, nothing at 208
    sink.take();

    run(&engine, IoOp::Read, 200, 8192);
    // The remainder completes contiguously past the segment boundary.
    assert_eq!(
        sink.take(),
        vec![
            record(IoOp::Read, 32, 4096, 0),
            record(IoOp::Read, 40, 4096, 4096),
        ]
    );
}

#[test]
fn three_segment_read_re_targets_twice() {
    let (engine, sink) = setup(MapKind::Hashed);
    run(&engine, IoOp::Write, 200, 4096); // pba 32
    run(&engine, IoOp::Write, 208, 2048); // pba 40
    run(&engine, IoOp::Write, 212, 4096); // pba 44
    sink.take();

    run(&engine, IoOp::Read, 200, 4096 + 2048 + 4096);
    assert_eq!(
        sink.take(),
        vec![
            record(IoOp::Read, 32, 4096, 0),
            record(IoOp::Read, 40, 2048, 4096),
            record(IoOp::Read, 44, 4096, 6144),
        ]
    );
}

#[test]
fn unknown_opcode_is_passed_through_unmodified() {
    let (engine, sink) = setup(MapKind::SkipList);
    run(&engine, IoOp::Write, 200, 4096);
    sink.take();

    run(&engine, IoOp::Other(9), 200, 4096);
    assert_eq!(sink.take(), vec![record(IoOp::Other(9), 200, 4096, 0)]);
    // No allocation, no mapping change.
    assert_eq!(engine.registry().log_head(), 40);
    assert_eq!(engine.registry().device_at(0).unwrap().map().len(), 1);
}

#[test]
fn missing_device_fails_the_original() {
    let registry = Registry::new();
    let engine = Engine::new(registry);
    let request = IoRequest::new("lsvbd9", IoOp::Read, 100, vec![0; 512]);
    let done = request.completion.clone();
    engine.submit(request);
    match done.wait() {
        Err(VbdError::NoSuchDevice(name)) => assert_eq!(name, "lsvbd9"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
