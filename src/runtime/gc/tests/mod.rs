//! GC unit tests
//!
//! Reachability, slot reuse and finalizer resurrection on a bare heap.

use crate::runtime::context::Context;
use crate::runtime::error::ScriptResult;
use crate::runtime::gc::{Closure, GcConfig, GcState, Heap, Object, ThreadState};
use crate::runtime::table::Table;
use crate::runtime::value::{Key, Value};

fn noop(_: &Context) -> ScriptResult<usize> {
    Ok(0)
}

fn heap() -> Heap {
    Heap::new(GcConfig::default())
}

#[cfg(test)]
mod gc_config_tests {
    use super::*;

    #[test]
    fn test_gc_config_default() {
        let config = GcConfig::default();
        assert!(config.enabled);
        assert_eq!(config.collection_threshold, 4096);
    }

    #[test]
    fn test_should_collect_follows_threshold() {
        let mut heap = Heap::new(GcConfig {
            enabled: true,
            collection_threshold: 2,
        });
        assert!(heap.should_collect());
        heap.collect(&[]);
        assert!(!heap.should_collect());
        heap.alloc(Object::Table(Table::new()));
        heap.alloc(Object::Table(Table::new()));
        assert!(heap.should_collect());
    }

    #[test]
    fn test_disabled_collector_never_triggers() {
        let mut heap = Heap::new(GcConfig {
            enabled: false,
            collection_threshold: 0,
        });
        heap.alloc(Object::Table(Table::new()));
        assert!(!heap.should_collect());
    }
}

#[cfg(test)]
mod gc_reachability_tests {
    use super::*;

    #[test]
    fn test_unreachable_table_is_freed() {
        let mut heap = heap();
        let before = heap.live_objects();
        let garbage = heap.alloc(Object::Table(Table::new()));
        assert_eq!(heap.live_objects(), before + 1);

        heap.collect(&[]);
        assert!(!heap.is_live(garbage));
        assert_eq!(heap.live_objects(), before);
        assert_eq!(heap.stats().cycles, 1);
        assert_eq!(heap.state(), GcState::Idle);
    }

    #[test]
    fn test_globals_keep_values_alive() {
        let mut heap = heap();
        let kept = heap.alloc(Object::Table(Table::new()));
        let globals = heap.globals();
        heap.table_mut(globals)
            .unwrap()
            .set(Key::from("kept"), Value::Table(kept));

        heap.collect(&[]);
        assert!(heap.is_live(kept));
    }

    #[test]
    fn test_closure_upvalues_are_traced() {
        let mut heap = heap();
        let captured = heap.alloc(Object::Table(Table::new()));
        let closure = heap.alloc(Object::Closure(Closure {
            func: noop,
            upvalues: vec![Value::Table(captured)],
            host_owned: false,
        }));
        let registry = heap.registry();
        heap.table_mut(registry)
            .unwrap()
            .set(Key::from("f"), Value::Function(closure));

        heap.collect(&[]);
        assert!(heap.is_live(closure));
        assert!(heap.is_live(captured));
    }

    #[test]
    fn test_extra_roots_survive() {
        let mut heap = heap();
        let thread = heap.alloc(Object::Thread(ThreadState::default()));
        heap.collect(&[thread]);
        assert!(heap.is_live(thread));
        let collection = heap.collect(&[]);
        assert!(!heap.is_live(thread));
        assert_eq!(collection.threads, vec![thread]);
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let mut heap = heap();
        let old = heap.alloc(Object::Table(Table::new()));
        heap.collect(&[]);
        let new = heap.alloc(Object::Table(Table::new()));
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(heap.table(old).is_err());
        assert!(heap.table(new).is_ok());
    }

    #[test]
    fn test_host_closure_upvalues_reported() {
        let mut heap = heap();
        heap.alloc(Object::Closure(Closure {
            func: noop,
            upvalues: vec![Value::Integer(7), Value::Integer(8)],
            host_owned: true,
        }));
        heap.alloc(Object::Closure(Closure {
            func: noop,
            upvalues: vec![Value::Integer(1)],
            host_owned: false,
        }));
        let collection = heap.collect(&[]);
        assert_eq!(
            collection.host_closures,
            vec![vec![Value::Integer(7), Value::Integer(8)]]
        );
    }
}

#[cfg(test)]
mod gc_finalizer_tests {
    use super::*;

    fn finalizable(heap: &mut Heap) -> (crate::runtime::value::ObjRef, Value) {
        let handler = heap.alloc(Object::Closure(Closure {
            func: noop,
            upvalues: Vec::new(),
            host_owned: false,
        }));
        let mut meta = Table::new();
        meta.set(Key::from("__gc"), Value::Function(handler));
        let meta = heap.alloc(Object::Table(meta));
        let mut table = Table::new();
        table.set_metatable(Some(meta));
        (heap.alloc(Object::Table(table)), Value::Function(handler))
    }

    #[test]
    fn test_finalizable_object_is_resurrected_once() {
        let mut heap = heap();
        let (object, handler) = finalizable(&mut heap);

        let collection = heap.collect(&[]);
        assert_eq!(collection.finalizers, vec![(object, handler)]);
        assert!(heap.is_live(object));

        // Still pending: the finalizer has not reported back yet.
        let collection = heap.collect(&[]);
        assert!(collection.finalizers.is_empty());
        assert!(heap.is_live(object));

        heap.finalizer_done(object);
        heap.collect(&[]);
        assert!(!heap.is_live(object));
        assert_eq!(heap.stats().finalized, 1);
    }

    #[test]
    fn test_reachable_object_is_not_finalized() {
        let mut heap = heap();
        let (object, _) = finalizable(&mut heap);
        let globals = heap.globals();
        heap.table_mut(globals)
            .unwrap()
            .set(Key::from("o"), Value::Table(object));

        let collection = heap.collect(&[]);
        assert!(collection.finalizers.is_empty());
        assert!(heap.is_live(object));
    }
}
