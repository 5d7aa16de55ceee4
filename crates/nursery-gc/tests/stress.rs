//! Stress collection and poisoning, available with the `test-util` feature.

use nursery_gc::test_util::StressCollector;
use nursery_gc::{CollectReason, NurseryConfig, ObjectKind, Runtime, Value, POISON_BYTE};

#[test]
fn test_stress_collector_keeps_list_intact() {
    let mut rt = Runtime::new(NurseryConfig::default().poison(true)).unwrap();
    let ty = rt.register_type("Node", ObjectKind::Plain, 48, &[32]);
    let root = rt.roots_mut().add(Value::NULL);
    let mut stress = StressCollector::new(7);

    for i in 0..500 {
        let node = rt.new_object(ty, 0);
        unsafe {
            node.set_field(32, rt.roots().get(root).unwrap());
            node.set_field(40, Value::from_int(i));
        }
        rt.roots_mut().set(root, Value::from_cell(node));
        stress.after_allocation(&mut rt);
    }
    assert_eq!(stress.collections(), 500 / 7);

    let mut expected = 499;
    let mut cursor = rt.roots().get(root).unwrap();
    while let Some(node) = cursor.as_cell() {
        unsafe {
            assert_eq!(node.field(40).as_int(), Some(expected));
            cursor = node.field(32);
        }
        expected -= 1;
    }
    assert_eq!(expected, -1);
}

#[test]
fn test_swept_nursery_is_poisoned() {
    let mut rt = Runtime::new(NurseryConfig::default().poison(true)).unwrap();
    let ty = rt.register_type("Node", ObjectKind::Plain, 48, &[32]);

    let dead = rt.new_object(ty, 0);
    unsafe { dead.set_field(40, Value::from_int(1)) };
    rt.collect(CollectReason::Api, None).unwrap();

    let bytes = dead.addr() as *const u8;
    for offset in 0..48 {
        assert_eq!(unsafe { bytes.add(offset).read() }, POISON_BYTE);
    }
}

#[test]
fn test_stress_collector_respects_suppression() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = rt.register_type("Node", ObjectKind::Plain, 48, &[32]);
    let mut stress = StressCollector::new(1);

    rt.with_gc_suppressed(|rt| {
        rt.new_object(ty, 0);
        assert!(stress.after_allocation(rt).is_none());
    });
    rt.new_object(ty, 0);
    assert!(stress.after_allocation(&mut rt).is_some());
    assert_eq!(stress.collections(), 1);
}
