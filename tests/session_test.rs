mod common;

use std::sync::Arc;

use common::{bbox, box_vector, init, FailingOn, GeometryExtractor, Saturating, WrongWidth};
use ndarray::Array1;
use visprompt::cache::{AggregationError, CacheError, DecodeError, RejectReason, SessionState};
use visprompt::{
    Admission, CacheSession, ClassName, Detection, EmbeddingAggregator, ImageRef, PromptEntry, RebuildStatus, Region,
    SessionConfig, SessionError, SessionEvent, TableSource,
};

fn session(capacity: usize) -> CacheSession {
    CacheSession::new(SessionConfig::default().with_capacity(capacity)).unwrap()
}

fn volatile(image: &str, class_id: u32, confidence: f32) -> PromptEntry {
    PromptEntry::volatile(image, vec![Region::new(bbox(confidence * 100.0, 5.0), class_id)], confidence)
}

fn unit(v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    v / norm
}

#[test]
fn test_seed_rows_follow_class_id_order() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let mut session = session(15);
    let report = session.add_seed(
        PromptEntry::seed(
            "a.jpg",
            vec![Region::new(bbox(0.0, 0.0), 3), Region::new(bbox(20.0, 0.0), 1)],
        ),
        &GeometryExtractor::new(),
    )?;
    assert_eq!(report.status, RebuildStatus::Committed);

    assert_eq!(session.registry().order(), &[3, 1]);
    let aligner = session.get_aligner();
    assert_eq!(aligner.row_to_class(), &[1, 3]);
    assert_eq!(session.decode(0)?, 1);
    assert_eq!(session.decode(1)?, 3);
    assert_eq!(aligner.row_of(1), Some(0));
    assert_eq!(aligner.row_of(3), Some(1));
    assert_eq!(session.decode(2), Err(DecodeError { row: 2, rows: 2 }));
    Ok(())
}

#[test]
fn test_volatile_replacement_and_rejection() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(2);
    session.add_or_replace_volatile(volatile("a.jpg", 0, 0.5), &extractor)?;
    session.add_or_replace_volatile(volatile("b.jpg", 0, 0.6), &extractor)?;

    let report = session.add_or_replace_volatile(volatile("c.jpg", 0, 0.55), &extractor)?;
    assert_eq!(
        report.admission,
        Admission::Accepted {
            slot: 0,
            replaced: Some(0.5)
        }
    );
    let confidences: Vec<f32> = session.entries().iter().map(|e| e.group_confidence).collect();
    assert_eq!(confidences, vec![0.55, 0.6]);

    let generation = session.generation();
    let report = session.add_or_replace_volatile(volatile("d.jpg", 0, 0.52), &extractor)?;
    assert_eq!(
        report.admission,
        Admission::Rejected(RejectReason::NotStronger {
            offered: 0.52,
            minimum: 0.55
        })
    );
    assert_eq!(report.status, RebuildStatus::Unchanged);
    assert_eq!(session.generation(), generation);
    Ok(())
}

#[test]
fn test_failed_extraction_reverts_to_committed_table() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let mut session = session(15);
    let extractor = GeometryExtractor::new();
    for (image, x) in [("a.jpg", 0.0), ("b.jpg", 30.0), ("c.jpg", 60.0)] {
        session.add_seed(PromptEntry::seed(image, vec![Region::new(bbox(x, 0.0), 2)]), &extractor)?;
    }
    let before = session.get_active_table();
    let values = before.view().to_owned();

    let report = session.add_or_replace_volatile(volatile("d.jpg", 2, 0.9), &FailingOn::images(&["b.jpg"]))?;
    match report.status {
        RebuildStatus::Degraded { source, error } => {
            assert_eq!(source, TableSource::Reverted);
            assert!(matches!(error, AggregationError::Extraction { entry: 1, .. }));
        }
        other => panic!("expected a degraded rebuild, got {:?}", other),
    }

    let after = session.get_active_table();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.view(), values.view());
    assert_eq!(session.entries().len(), 4);
    Ok(())
}

#[test]
fn test_class_vector_is_normalized_mean() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(15);
    let first = bbox(0.0, 0.0);
    let second = bbox(40.0, 90.0);
    session.add_seed(PromptEntry::seed("a.jpg", vec![Region::new(first, 7)]), &extractor)?;
    session.add_seed(PromptEntry::seed("b.jpg", vec![Region::new(second, 7)]), &extractor)?;

    let table = session.get_active_table();
    let row = table.row(0).ok_or("missing row")?.to_owned();
    let expected = unit((box_vector(&first) + box_vector(&second)) / 2.0);
    for (a, b) in row.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-6);
    }

    let alone = unit(box_vector(&first));
    assert!(row.iter().zip(alone.iter()).any(|(a, b)| (a - b).abs() > 1e-3));
    Ok(())
}

#[test]
fn test_registry_is_monotonic() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(4).with_class_names(vec!["cat".into(), "dog".into()]);
    let mut seen: Vec<(u32, ClassName)> = Vec::new();

    let ids = [1u32, 5, 1, 0, 9, 5, 2, 0, 7];
    for (step, &class_id) in ids.iter().enumerate() {
        let entry = volatile(&format!("{}.jpg", step), class_id, 0.5 + step as f32 * 0.05);
        session.add_or_replace_volatile(entry, &extractor)?;

        let registry = session.registry();
        assert!(registry.len() >= seen.len());
        for (id, name) in &seen {
            assert_eq!(registry.name_of(*id), Some(name));
        }
        seen = registry.iter().map(|(id, name)| (id, name.clone())).collect();
    }

    let registry = session.registry();
    assert_eq!(registry.name_of(1), Some(&ClassName::Known("dog".into())));
    assert_eq!(registry.name_of(9), Some(&ClassName::Synthesized(9)));
    assert_eq!(registry.name_of(9).map(|n| n.to_string()), Some("unknown_9".into()));
    Ok(())
}

#[test]
fn test_capacity_bound_and_seed_protection() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(3);
    session.add_seed(PromptEntry::seed("seed.jpg", vec![Region::new(bbox(0.0, 0.0), 0)]), &extractor)?;

    for step in 0..10 {
        let confidence = ((step * 37) % 100) as f32 / 100.0;
        let before_min = session.entries().min_volatile_confidence();
        let report = session.add_or_replace_volatile(volatile(&format!("{}.jpg", step), 1, confidence), &extractor)?;

        assert!(session.entries().len() <= 3);
        assert_eq!(session.entries().seed_count(), 1);
        if let Admission::Accepted {
            replaced: Some(replaced),
            ..
        } = report.admission
        {
            assert_eq!(Some(replaced), before_min);
            let min = session.entries().min_volatile_confidence().ok_or("no volatile entries")?;
            assert!(min >= replaced);
        }
    }

    // A seed pushes out the weakest volatile entry
    let weakest = session.entries().min_volatile_confidence();
    let report = session.add_seed(PromptEntry::seed("seed2.jpg", vec![Region::new(bbox(5.0, 5.0), 0)]), &extractor)?;
    assert_eq!(report.evicted.map(|e| e.group_confidence), weakest);
    assert_eq!(session.entries().seed_count(), 2);
    assert_eq!(session.entries().len(), 3);
    Ok(())
}

#[test]
fn test_seeds_beyond_capacity_are_refused() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(1);
    session.add_seed(PromptEntry::seed("a.jpg", vec![Region::new(bbox(0.0, 0.0), 0)]), &extractor)?;
    let generation = session.generation();

    let result = session.add_seed(PromptEntry::seed("b.jpg", vec![Region::new(bbox(1.0, 0.0), 1)]), &extractor);
    assert!(matches!(
        result,
        Err(SessionError::Cache(CacheError::SeedCapacityExceeded { capacity: 1, .. }))
    ));
    assert_eq!(session.generation(), generation);
    assert!(!session.registry().contains(1));
    Ok(())
}

#[test]
fn test_aggregation_is_idempotent_and_normalized() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(15);
    for (step, class_id) in [4u32, 2, 4, 8, 2].into_iter().enumerate() {
        let entry = PromptEntry::seed(
            format!("{}.jpg", step),
            vec![
                Region::new(bbox(step as f32 * 11.0, 3.0), class_id),
                Region::new(bbox(step as f32 * 7.0, 40.0), class_id + 1),
            ],
        );
        session.add_seed(entry, &extractor)?;
    }

    let snapshot = session.snapshot();
    let aggregator = EmbeddingAggregator::new(512);
    let (first, _) = aggregator.aggregate(snapshot.entries(), snapshot.aligner(), &extractor)?;
    let (second, _) = aggregator.aggregate(snapshot.entries(), snapshot.aligner(), &extractor)?;
    assert!(first.max_abs_diff(&second).ok_or("shape differs")? < 1e-6);
    assert!(first.max_abs_diff(snapshot.table()).ok_or("shape differs")? < 1e-6);

    for norm in snapshot.table().row_norms() {
        assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-5);
    }

    let registry = snapshot.registry();
    for row in 0..snapshot.table().rows() {
        let class_id = snapshot.decode(row)?;
        assert!(registry.contains(class_id));
        assert_eq!(snapshot.aligner().row_of(class_id), Some(row));
    }
    Ok(())
}

#[test]
fn test_dimension_change_is_absorbed() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let mut session = session(15);
    session.add_seed(PromptEntry::seed("a.jpg", vec![Region::new(bbox(0.0, 0.0), 1)]), &GeometryExtractor::new())?;
    let before = session.get_active_table();

    let report = session.add_seed(PromptEntry::seed("b.jpg", vec![Region::new(bbox(9.0, 0.0), 4)]), &WrongWidth(6))?;
    assert!(matches!(
        report.status,
        RebuildStatus::Degraded {
            source: TableSource::ZeroFilled,
            ..
        }
    ));
    let table = session.get_active_table();
    assert_eq!((table.rows(), table.dim()), (2, 4));
    assert!(table.is_all_zero());

    // The old reference is untouched
    assert_eq!(before.rows(), 1);
    assert!(!before.is_all_zero());
    Ok(())
}

#[test]
fn test_promotion_closes_the_loop() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(15);
    session.add_seed(
        PromptEntry::seed(
            "a.jpg",
            vec![Region::new(bbox(0.0, 0.0), 6), Region::new(bbox(20.0, 0.0), 2)],
        ),
        &extractor,
    )?;

    let image = ImageRef::new("b.jpg");
    let detection = Detection::new(bbox(50.0, 50.0), 1, 0.92);
    let report = session.promote_detection_to_prompt(&detection, &image, &extractor)?;
    assert!(report.admission.is_accepted());
    assert_eq!(report.status, RebuildStatus::Committed);

    let promoted = session.entries().iter().last().ok_or("no entries")?;
    assert!(!promoted.is_seed);
    assert_eq!(promoted.group_confidence, 0.92);
    assert_eq!(promoted.class_ids().collect::<Vec<_>>(), vec![6]);

    let out_of_range = Detection::new(bbox(1.0, 1.0), 5, 0.99);
    assert!(matches!(
        session.promote_detection_to_prompt(&out_of_range, &image, &extractor),
        Err(SessionError::Decode(DecodeError { row: 5, rows: 2 }))
    ));
    Ok(())
}

#[test]
fn test_grouped_promotion_and_decoding() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(15).with_class_names(vec!["a".into(), "b".into()]);
    session.add_seed(
        PromptEntry::seed(
            "a.jpg",
            vec![Region::new(bbox(0.0, 0.0), 0), Region::new(bbox(20.0, 0.0), 1)],
        ),
        &extractor,
    )?;

    let detections = vec![
        Detection::new(bbox(1.0, 1.0), 0, 0.9),
        Detection::new(bbox(2.0, 2.0), 7, 0.95),
        Detection::new(bbox(3.0, 3.0), 1, 0.8),
        Detection::new(bbox(4.0, 4.0), 1, 0.3),
    ];

    let labeled = session.decode_detections(&detections);
    assert_eq!(labeled.len(), 3);
    assert_eq!(labeled[1].class_name, ClassName::Known("b".into()));

    session.promote_detections(&detections, &ImageRef::new("b.jpg"), &extractor)?;
    let promoted = session.entries().iter().last().ok_or("no entries")?;
    assert_eq!(promoted.regions.len(), 2);
    assert!((promoted.group_confidence - 0.85).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_nan_score_does_not_sink_the_group() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let extractor = GeometryExtractor::new();
    let mut session = session(15);
    session.add_seed(
        PromptEntry::seed(
            "a.jpg",
            vec![Region::new(bbox(0.0, 0.0), 0), Region::new(bbox(20.0, 0.0), 1)],
        ),
        &extractor,
    )?;

    let detections = vec![
        Detection::new(bbox(1.0, 1.0), 0, 0.9),
        Detection::new(bbox(2.0, 2.0), 1, f32::NAN),
        Detection::new(bbox(3.0, 3.0), 1, 0.8),
    ];
    let report = session.promote_detections(&detections, &ImageRef::new("b.jpg"), &extractor)?;
    assert_eq!(report.status, RebuildStatus::Committed);

    let promoted = session.entries().iter().last().ok_or("no entries")?;
    assert_eq!(promoted.regions.len(), 2);
    assert!((promoted.group_confidence - 0.85).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_large_embeddings_commit_finite_rows() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let mut session = session(15);
    let report = session.add_seed(
        PromptEntry::seed(
            "a.jpg",
            vec![Region::new(bbox(0.0, 0.0), 0), Region::new(bbox(20.0, 0.0), 0)],
        ),
        &Saturating(3.0e38),
    )?;
    assert_eq!(report.status, RebuildStatus::Committed);

    let table = session.get_active_table();
    let row = table.row(0).ok_or("missing row")?;
    assert!(row.iter().all(|v| v.is_finite()));
    assert!(table.row_norms().iter().all(|n| (n - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn test_events_follow_state_machine() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let mut session = session(15);
    let mut events = session.subscribe();
    session.add_seed(PromptEntry::seed("a.jpg", vec![Region::new(bbox(0.0, 0.0), 1)]), &GeometryExtractor::new())?;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    let states: Vec<SessionState> = received
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Mutating,
            SessionState::Rebuilding,
            SessionState::Committed,
            SessionState::Idle
        ]
    );
    assert!(received.contains(&SessionEvent::EntryExtracted {
        generation: 1,
        entry: 0,
        total: 1
    }));
    assert!(received.contains(&SessionEvent::Committed {
        generation: 1,
        source: TableSource::Fresh,
        degraded: false
    }));
    assert_eq!(session.state(), SessionState::Idle);
    Ok(())
}
