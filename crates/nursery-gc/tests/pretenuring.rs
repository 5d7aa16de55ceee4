//! Pretenuring advice from per-type promotion samples.

use nursery_gc::{CollectReason, NurseryConfig, ObjectKind, Runtime, TypeId, Value};

fn rooted_chain(rt: &mut Runtime, ty: TypeId, len: usize) {
    let mut head = Value::NULL;
    for _ in 0..len {
        let node = rt.new_object(ty, 0);
        unsafe { node.set_field(32, head) };
        head = Value::from_cell(node);
    }
    rt.roots_mut().add(head);
}

#[test]
fn test_hot_type_reported_on_full_store_buffer() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let hot = rt.register_type("Hot", ObjectKind::Plain, 48, &[32]);
    let cold = rt.register_type("Cold", ObjectKind::Plain, 48, &[32]);

    rooted_chain(&mut rt, hot, 3100);
    rooted_chain(&mut rt, cold, 100);

    let mut out = Vec::new();
    let metrics = rt
        .collect(CollectReason::FullStoreBuffer, Some(&mut out))
        .unwrap();
    assert!(metrics.pretenure_triggered);
    assert_eq!(out, vec![hot]);
    assert!(rt.take_pretenure_candidates().is_empty());
}

#[test]
fn test_count_threshold_is_exclusive() {
    let config = NurseryConfig::default().pretenure_thresholds(0.8, 3000);
    let mut rt = Runtime::new(config).unwrap();
    let ty = rt.register_type("Warm", ObjectKind::Plain, 48, &[32]);

    rooted_chain(&mut rt, ty, 2900);
    let mut out = Vec::new();
    let metrics = rt
        .collect(CollectReason::FullStoreBuffer, Some(&mut out))
        .unwrap();
    assert!(metrics.pretenure_triggered);
    assert!(out.is_empty());
}

#[test]
fn test_low_rate_api_collection_does_not_report() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = rt.register_type("Hot", ObjectKind::Plain, 48, &[32]);

    rooted_chain(&mut rt, ty, 3100);
    let mut out = Vec::new();
    let metrics = rt.collect(CollectReason::Api, Some(&mut out)).unwrap();
    assert!(!metrics.pretenure_triggered);
    assert!(out.is_empty());
}

#[test]
fn test_high_rate_reports_to_runtime() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = rt.register_type("Hot", ObjectKind::Plain, 48, &[32]);

    // 14000 promoted 64-byte blocks exceed 80% of one chunk.
    rooted_chain(&mut rt, ty, 14_000);
    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert!(metrics.promotion_rate > 0.8);
    assert!(metrics.pretenure_triggered);
    assert_eq!(rt.take_pretenure_candidates(), vec![ty]);
    assert!(rt.take_pretenure_candidates().is_empty());
}

#[test]
fn test_samples_reset_each_cycle() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = rt.register_type("Hot", ObjectKind::Plain, 48, &[32]);

    rooted_chain(&mut rt, ty, 2000);
    rt.collect(CollectReason::Api, None).unwrap();

    rooted_chain(&mut rt, ty, 2000);
    let mut out = Vec::new();
    rt.collect(CollectReason::FullStoreBuffer, Some(&mut out))
        .unwrap();
    assert!(out.is_empty());
}
