//! Minor collection tests: reachability, forwarding and the store buffer.

use std::cell::RefCell;
use std::rc::Rc;

use nursery_gc::{
    CellPtr, CollectReason, MinorTracer, NurseryConfig, ObjectKind, RootSource, Runtime,
    StoreBuffer, SystemBuffers, TenuredHeap, TypeId, Value,
};

/// Header plus `next` at 32 and an untraced payload word at 40.
fn item_type(rt: &mut Runtime) -> TypeId {
    rt.register_type("Item", ObjectKind::Plain, 48, &[32])
}

/// Header plus two reference fields.
fn pair_type(rt: &mut Runtime) -> TypeId {
    rt.register_type("Pair", ObjectKind::Plain, 48, &[32, 40])
}

fn cell_of(value: Option<Value>) -> CellPtr {
    value.and_then(Value::as_cell).expect("expected a cell")
}

#[test]
fn test_unreachable_object_is_not_promoted() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);
    let start = rt.nursery().start();

    let garbage = rt.new_object(ty, 0);
    assert_eq!(garbage.addr(), start);

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 0);
    assert_eq!(metrics.bytes_promoted, 0);
    assert!(rt.nursery().is_empty());
    assert_eq!(rt.tenured().bytes_allocated(), 0);

    let next = rt.new_object(ty, 0);
    assert_eq!(next.addr(), start);
}

#[test]
fn test_mutual_references_promoted_once() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = pair_type(&mut rt);

    let a = rt.new_object(ty, 0);
    let b = rt.new_object(ty, 0);
    unsafe {
        a.set_field(32, Value::from_cell(b));
        b.set_field(32, Value::from_cell(a));
    }
    let root = rt.roots_mut().add(Value::from_cell(a));

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 2);

    let new_a = cell_of(rt.roots().get(root));
    let new_b = cell_of(Some(unsafe { new_a.field(32) }));
    assert!(!rt.nursery().is_inside(new_a.addr()));
    assert!(!rt.nursery().is_inside(new_b.addr()));
    assert_ne!(new_a, new_b);
    assert_eq!(cell_of(Some(unsafe { new_b.field(32) })), new_a);
    unsafe {
        assert!(new_a.field(40).is_null());
        assert!(new_b.field(40).is_null());
    }
}

#[test]
fn test_shared_target_promoted_once() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = pair_type(&mut rt);

    let shared = rt.new_object(ty, 0);
    let left = rt.new_object(ty, 0);
    let right = rt.new_object(ty, 0);
    unsafe {
        left.set_field(32, Value::from_cell(shared));
        right.set_field(32, Value::from_cell(shared));
    }
    let l = rt.roots_mut().add(Value::from_cell(left));
    let r = rt.roots_mut().add(Value::from_cell(right));

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 3);

    let from_left = unsafe { cell_of(rt.roots().get(l)).field(32) };
    let from_right = unsafe { cell_of(rt.roots().get(r)).field(32) };
    assert_eq!(from_left, from_right);
}

#[test]
fn test_long_chain_reaches_fixed_point() {
    const LEN: isize = 10_000;

    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);

    let mut head = Value::NULL;
    for i in 0..LEN {
        let node = rt.new_object(ty, 0);
        unsafe {
            node.set_field(32, head);
            node.set_field(40, Value::from_int(i));
        }
        head = Value::from_cell(node);
    }
    let root = rt.roots_mut().add(head);

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 10_000);

    let mut expected = LEN - 1;
    let mut cursor = rt.roots().get(root).unwrap();
    while let Some(node) = cursor.as_cell() {
        assert!(!rt.nursery().is_inside(node.addr()));
        unsafe {
            assert_eq!(node.field(40).as_int(), Some(expected));
            cursor = node.field(32);
        }
        expected -= 1;
    }
    assert_eq!(expected, -1);
    assert!(rt.nursery().is_empty());
}

#[test]
fn test_integers_and_tenured_roots_are_untouched() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);

    let tenured = rt.new_tenured_object(ty, 0);
    let int_root = rt.roots_mut().add(Value::from_int(7));
    let tenured_root = rt.roots_mut().add(Value::from_cell(tenured));
    rt.new_object(ty, 0);

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 0);
    assert_eq!(rt.roots().get(int_root), Some(Value::from_int(7)));
    assert_eq!(rt.roots().get(tenured_root), Some(Value::from_cell(tenured)));
}

#[test]
fn test_field_barrier_keeps_target_alive() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);

    let old = rt.new_tenured_object(ty, 0);
    let root = rt.roots_mut().add(Value::from_cell(old));
    let young = rt.new_object(ty, 0);
    unsafe {
        young.set_field(40, Value::from_int(42));
        rt.write_field(old, 32, Value::from_cell(young));
    }
    assert_eq!(rt.store_buffer().len(), 1);

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 1);
    assert!(rt.store_buffer().is_empty());

    let old = cell_of(rt.roots().get(root));
    let promoted = cell_of(Some(unsafe { old.field(32) }));
    assert!(!rt.nursery().is_inside(promoted.addr()));
    assert_eq!(unsafe { promoted.field(40) }, Value::from_int(42));
}

#[test]
fn test_barrier_skips_young_owners_and_old_targets() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);

    let old = rt.new_tenured_object(ty, 0);
    let other_old = rt.new_tenured_object(ty, 0);
    let young = rt.new_object(ty, 0);
    let other_young = rt.new_object(ty, 0);
    unsafe {
        rt.write_field(old, 32, Value::from_cell(other_old));
        rt.write_field(young, 32, Value::from_cell(other_young));
        rt.write_field(old, 32, Value::from_int(3));
    }
    assert!(rt.store_buffer().is_empty());
}

#[test]
fn test_slot_and_element_barriers() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let bag = rt.register_type("Bag", ObjectKind::Plain, 32, &[]);
    let list = rt.register_type("List", ObjectKind::Array, 32, &[]);
    let leaf = item_type(&mut rt);

    let old_bag = rt.new_tenured_object(bag, 4);
    let old_list = rt.new_tenured_array(list, 4);
    unsafe { old_list.set_element_len(2) };

    let a = rt.new_object(leaf, 0);
    let b = rt.new_object(leaf, 0);
    unsafe {
        rt.write_slot(old_bag, 2, Value::from_cell(a));
        rt.write_element(old_list, 1, Value::from_cell(b));
    }
    assert_eq!(rt.store_buffer().len(), 2);

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 2);
    unsafe {
        let a = cell_of(Some(old_bag.slot(2)));
        let b = cell_of(Some(old_list.element(1)));
        assert!(!rt.nursery().is_inside(a.addr()));
        assert!(!rt.nursery().is_inside(b.addr()));
        assert!(old_bag.slot(0).is_null());
    }
}

#[test]
fn test_whole_cell_edge() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = pair_type(&mut rt);

    let old = rt.new_tenured_object(ty, 0);
    let x = rt.new_object(ty, 0);
    let y = rt.new_object(ty, 0);
    unsafe {
        old.set_field(32, Value::from_cell(x));
        old.set_field(40, Value::from_cell(y));
        rt.store_buffer_mut().put_whole_cell(old);
    }

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert_eq!(metrics.objects_promoted, 2);
    unsafe {
        assert!(!rt.nursery().is_inside(old.field(32).bits()));
        assert!(!rt.nursery().is_inside(old.field(40).bits()));
    }
}

struct StackRoots(Rc<RefCell<Vec<Value>>>);

impl RootSource for StackRoots {
    fn mark_nursery_edges(&mut self, tracer: &mut MinorTracer<'_>) {
        for value in self.0.borrow_mut().iter_mut() {
            tracer.trace_value(value);
        }
    }
}

#[test]
fn test_root_source_is_marked() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);
    let stack = Rc::new(RefCell::new(Vec::new()));
    rt.add_root_source(Box::new(StackRoots(Rc::clone(&stack))));

    let cell = rt.new_object(ty, 0);
    unsafe { cell.set_field(40, Value::from_int(5)) };
    stack.borrow_mut().push(Value::from_cell(cell));

    rt.collect(CollectReason::Api, None).unwrap();

    let moved = cell_of(stack.borrow().first().copied());
    assert!(!rt.nursery().is_inside(moved.addr()));
    assert_eq!(unsafe { moved.field(40) }, Value::from_int(5));
}

#[test]
fn test_collect_is_noop_when_empty_or_suppressed() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);

    assert!(rt.collect(CollectReason::Api, None).is_none());

    rt.new_object(ty, 0);
    let result = rt.with_gc_suppressed(|rt| {
        assert!(rt.is_gc_suppressed());
        rt.collect(CollectReason::Api, None)
    });
    assert!(result.is_none());
    assert!(!rt.is_gc_suppressed());
    assert!(!rt.nursery().is_empty());

    assert!(rt.collect(CollectReason::EvictNursery, None).is_some());
    assert!(rt.nursery().is_empty());
}

#[test]
fn test_suppression_lifted_when_closure_panics() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = item_type(&mut rt);
    rt.new_object(ty, 0);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.with_gc_suppressed(|rt| {
            rt.with_gc_suppressed(|_| panic!("mutator failed"));
        });
    }));
    assert!(result.is_err());
    assert!(!rt.is_gc_suppressed());
    assert!(rt.collect(CollectReason::Api, None).is_some());
    assert!(rt.nursery().is_empty());
}

#[test]
fn test_exhaustion_collects_and_retries() {
    let config = NurseryConfig::default().max_chunks(1).initial_chunks(1);
    let mut rt = Runtime::new(config).unwrap();
    let ty = item_type(&mut rt);

    // 48-byte cells, so one chunk holds fewer than 22_000 of them.
    for _ in 0..30_000 {
        let cell = rt.new_object(ty, 0);
        assert!(rt.nursery().is_inside(cell.addr()));
    }
    let metrics = rt.last_metrics().unwrap();
    assert_eq!(metrics.reason, CollectReason::OutOfNursery);
    assert_eq!(metrics.objects_promoted, 0);
}

#[test]
fn test_full_store_buffer_triggers_collection() {
    let mut rt = Runtime::new(NurseryConfig::default())
        .unwrap()
        .with_store_buffer(StoreBuffer::with_capacity_limit(4));
    let ty = item_type(&mut rt);

    let owners: Vec<_> = (0..4).map(|_| rt.new_tenured_object(ty, 0)).collect();
    let roots: Vec<_> = owners
        .iter()
        .map(|&owner| rt.roots_mut().add(Value::from_cell(owner)))
        .collect();
    for &owner in &owners {
        let young = rt.new_object(ty, 0);
        unsafe { rt.write_field(owner, 32, Value::from_cell(young)) };
    }
    assert!(rt.store_buffer().is_full());

    rt.new_object(ty, 0);
    let metrics = rt.last_metrics().unwrap();
    assert_eq!(metrics.reason, CollectReason::FullStoreBuffer);
    assert_eq!(metrics.objects_promoted, 4);
    assert!(metrics.pretenure_triggered);
    assert!(!rt.store_buffer().is_full());

    for root in roots {
        let owner = cell_of(rt.roots().get(root));
        assert!(!rt.nursery().is_inside(unsafe { owner.field(32) }.bits()));
    }
}

#[test]
fn test_tenured_limit_disables_nursery() {
    let mut rt = Runtime::with_parts(
        NurseryConfig::default(),
        Box::new(TenuredHeap::with_limit(1)),
        Box::new(SystemBuffers::new()),
    )
    .unwrap();
    let ty = item_type(&mut rt);

    let cell = rt.new_object(ty, 0);
    rt.roots_mut().add(Value::from_cell(cell));

    let metrics = rt.collect(CollectReason::Api, None).unwrap();
    assert!(metrics.nursery_disabled);
    assert!(!rt.nursery().is_enabled());
    assert!(rt.nursery().is_empty());

    let fallback = rt.new_object(ty, 0);
    assert!(!rt.nursery().is_inside(fallback.addr()));
    assert!(rt.collect(CollectReason::Api, None).is_none());

    rt.nursery_mut().enable();
    let young = rt.new_object(ty, 0);
    assert!(rt.nursery().is_inside(young.addr()));
}

#[test]
fn test_metrics_are_recorded() {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = pair_type(&mut rt);
    let before = nursery_gc::global_metrics().total_collections();

    let cell = rt.new_object(ty, 0);
    rt.roots_mut().add(Value::from_cell(cell));
    let metrics = rt.collect(CollectReason::Api, None).unwrap();

    assert_eq!(metrics.total_collections, 1);
    assert_eq!(metrics.nursery_used, 48);
    assert_eq!(metrics.bytes_promoted, 64);
    assert_eq!(rt.last_metrics(), Some(metrics));
    assert!(nursery_gc::global_metrics().total_collections() > before);
    assert!(nursery_gc::gc_history().total_recorded() >= 1);
}
