use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arclight_runtime::{Released, Strong, Tracker, TrackerConfig, TrackerError};
use proptest::prelude::*;

// teardownの呼び出し回数を数えるオブジェクトを割り当てるヘルパー関数
fn person(tracker: &Tracker, name: &str) -> (Strong<String>, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let strong = tracker
        .build(name.to_string())
        .label(name)
        .teardown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .allocate()
        .expect("割り当てに失敗");
    (strong, fired)
}

#[test]
fn test_allocation_starts_with_one_strong_reference() {
    let tracker = Tracker::new();
    let (eric, fired) = person(&tracker, "Eric");
    let (jack, _) = person(&tracker, "Jack");

    assert_eq!(eric.strong_count(), 1);
    assert_eq!(jack.strong_count(), 1);
    assert_ne!(eric.id(), jack.id(), "別々のオブジェクトは別の識別子を持つべきです");
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_retain_and_release_track_count() {
    let tracker = Tracker::new();
    let (eric, fired) = person(&tracker, "Eric");

    let jacks_best_friend = tracker.retain(&eric);
    assert_eq!(eric.strong_count(), 2);

    assert_eq!(
        tracker.release(jacks_best_friend),
        Released::Retained { remaining: 1 }
    );
    assert_eq!(eric.strong_count(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0, "まだ破棄されてはいけません");

    assert_eq!(tracker.release(eric), Released::Destroyed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_scope_exit_releases() {
    let tracker = Tracker::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let create_person_instance = |tracker: &Tracker| {
        let counter = Arc::clone(&fired);
        let bella = tracker
            .allocate("Bella".to_string(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(bella.as_str(), "Bella");
        bella.downgrade()
    };

    let weak = create_person_instance(&tracker);
    assert_eq!(fired.load(Ordering::SeqCst), 1, "関数を抜けた時点で破棄されるべきです");
    assert!(weak.load().is_none());
}

#[test]
fn test_teardown_sees_payload_before_it_is_dropped() {
    let tracker = Tracker::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let molly = tracker
        .allocate("Molly".to_string(), move |name: &String| {
            sink.lock().push(format!("{} is being deinitialized", name));
        })
        .unwrap();
    drop(molly);
    assert_eq!(*seen.lock(), vec!["Molly is being deinitialized".to_string()]);
}

#[test]
fn test_weak_load_is_independent_owner() {
    let tracker = Tracker::new();
    let (billy, fired) = person(&tracker, "Billy");
    let weak = tracker.downgrade(&billy);
    assert_eq!(billy.strong_count(), 1);

    let loaded = weak.load().expect("生存中はロードできるべきです");
    assert_eq!(billy.strong_count(), 2);

    // 元の強参照を解放しても、ロードした強参照が対象を生存させる
    drop(billy);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(loaded.as_str(), "Billy");

    drop(loaded);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(weak.load().is_none());
    assert!(weak.clone().load().is_none());
}

#[test]
fn test_unowned_is_distinguishable_from_weak_absent() {
    let tracker = Tracker::new();
    let (danny, _) = person(&tracker, "Danny");
    let weak = danny.downgrade();
    let unowned = tracker.downgrade_unowned(&danny);
    let id = danny.id();

    assert_eq!(unowned.access().as_str(), "Danny");
    drop(danny);

    assert!(weak.load().is_none());
    assert_eq!(unowned.try_access().unwrap_err(), TrackerError::UseAfterFree(id));
}

#[test]
fn test_slot_reuse_does_not_resurrect_old_handles() {
    let tracker = Tracker::new();
    let (first, _) = person(&tracker, "First");
    let weak = first.downgrade();
    let unowned = first.downgrade_unowned();
    let old_id = first.id();
    drop(first);

    let (second, _) = person(&tracker, "Second");
    assert_eq!(second.id().index, old_id.index, "スロットは再利用されるべきです");
    assert!(weak.load().is_none(), "古いweak参照が新しいオブジェクトを指してはいけません");
    assert_eq!(
        unowned.try_access().unwrap_err(),
        TrackerError::UseAfterFree(old_id)
    );
    assert_eq!(tracker.strong_count(old_id), None);
    assert_eq!(tracker.strong_count(second.id()), Some(1));
}

#[test]
fn test_out_of_memory_is_recoverable() {
    let tracker = Tracker::with_config(TrackerConfig::default().with_max_objects(2));
    let (a, _) = person(&tracker, "A");
    let (_b, _) = person(&tracker, "B");

    let err = tracker.allocate("C".to_string(), |_| {}).unwrap_err();
    assert!(matches!(err, TrackerError::OutOfMemory { live: 2, .. }), "{:?}", err);
    assert!(!err.is_programmer_error());

    drop(a);
    assert!(tracker.allocate("C".to_string(), |_| {}).is_ok());
}

#[test]
fn test_panicking_teardown_releases_its_slot() {
    let tracker = Tracker::with_config(TrackerConfig::default().with_max_objects(1));
    let faulty = tracker
        .allocate("Faulty".to_string(), |_| panic!("teardownが失敗しました"))
        .unwrap();
    let weak = faulty.downgrade();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(faulty)));
    assert!(result.is_err(), "teardownのパニックは呼び出し元へ伝播するべきです");
    assert!(weak.load().is_none());
    assert_eq!(tracker.stats().live, 0);

    let (next, _) = person(&tracker, "Next");
    assert_eq!(next.strong_count(), 1, "上限枠は回収されているべきです");
}

#[test]
fn test_raw_double_release_is_detected() {
    let tracker = Tracker::new();
    let (eric, fired) = person(&tracker, "Eric");
    let keeper = eric.retain();
    let id = eric.into_raw();

    assert_eq!(tracker.release_raw(id), Ok(Released::Retained { remaining: 1 }));
    assert_eq!(
        tracker.release_raw(id),
        Err(TrackerError::DoubleRelease(id)),
        "同じ所有権の二度目の解放は検出されるべきです"
    );
    assert_eq!(keeper.strong_count(), 1, "検出時にカウントが変化してはいけません");

    drop(keeper);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.release_raw(id), Err(TrackerError::DoubleRelease(id)));
}

#[test]
fn test_raw_retain_on_dead_object() {
    let tracker = Tracker::new();
    let (jack, _) = person(&tracker, "Jack");
    let id = jack.id();
    drop(jack);
    assert_eq!(tracker.retain_raw(id), Err(TrackerError::UseAfterFree(id)));
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Retain,
    Release,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Retain), Just(Op::Release)]
}

proptest! {
    #[test]
    fn prop_count_equals_retains_plus_one_minus_releases(ops in proptest::collection::vec(op(), 0..64)) {
        let tracker = Tracker::new();
        let (first, fired) = person(&tracker, "Subject");
        let weak = first.downgrade();
        let mut handles = vec![first];
        let mut expected: usize = 1;

        for op in ops {
            if handles.is_empty() {
                break;
            }
            match op {
                Op::Retain => {
                    let copy = handles[0].retain();
                    handles.push(copy);
                    expected += 1;
                }
                Op::Release => {
                    let released = handles.pop().map(Strong::release);
                    expected -= 1;
                    if expected == 0 {
                        prop_assert_eq!(released, Some(Released::Destroyed));
                    } else {
                        prop_assert_eq!(released, Some(Released::Retained { remaining: expected }));
                    }
                }
            }

            if expected > 0 {
                prop_assert_eq!(handles[0].strong_count(), expected);
                prop_assert_eq!(fired.load(Ordering::SeqCst), 0);
            } else {
                prop_assert_eq!(fired.load(Ordering::SeqCst), 1);
                prop_assert!(weak.load().is_none());
            }
        }

        drop(handles);
        prop_assert_eq!(fired.load(Ordering::SeqCst), 1);
        prop_assert_eq!(tracker.stats().live, 0);
    }
}
