#![forbid(unsafe_code)]

use evq_core::{EventType, KeyError, MetaNamespaceKey};
use evq_store::EventQueue;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
struct Obj {
    name: &'static str,
    value: i32,
}

fn obj(name: &'static str, value: i32) -> Obj {
    Obj { name, value }
}

fn name_key(o: &Obj) -> Result<String, KeyError> {
    if o.name.is_empty() {
        return Err(KeyError::MissingName);
    }
    Ok(o.name.to_string())
}

fn queue() -> EventQueue<Obj, fn(&Obj) -> Result<String, KeyError>> {
    EventQueue::new(name_key as fn(&Obj) -> Result<String, KeyError>)
}

#[test]
fn add_then_delete_leaves_no_trace() {
    let q = queue();
    q.add(obj("foo", 10)).unwrap();
    q.delete(obj("foo", 10)).unwrap();
    q.add(obj("zab", 30)).unwrap();

    assert_eq!(q.pop(), Some((EventType::Added, obj("zab", 30))));
    assert!(q.is_empty());
    assert_eq!(q.get_by_key("foo"), None);

    // the dropped object must not come back on resync
    q.resync();
    assert_eq!(q.list_keys(), vec!["zab".to_string()]);
}

#[test]
fn add_then_update_delivers_added_with_latest_payload() {
    let q = queue();
    q.add(obj("foo", 10)).unwrap();
    q.update(obj("foo", 11)).unwrap();
    assert_eq!(q.len(), 1);
    assert_eq!(q.pop(), Some((EventType::Added, obj("foo", 11))));
}

#[test]
fn updates_after_replace_compress_to_modified() {
    let q = queue();
    q.replace(vec![obj("foo", 2)], "1").unwrap();
    q.update(obj("foo", 3)).unwrap();
    q.update(obj("foo", 4)).unwrap();
    assert_eq!(q.pop(), Some((EventType::Modified, obj("foo", 4))));
}

#[test]
fn delete_after_update_carries_last_payload() {
    let q = queue();
    q.replace(vec![obj("foo", 2)], "1").unwrap();
    q.update(obj("foo", 3)).unwrap();
    q.delete(obj("foo", 0)).unwrap();
    assert_eq!(q.pop(), Some((EventType::Deleted, obj("foo", 3))));
    // deletion removes the stored object, so resync has nothing to redeliver
    q.resync();
    assert!(q.is_empty());
}

#[test]
fn delete_of_delivered_object_keeps_known_payload() {
    let q = queue();
    q.add(obj("foo", 1)).unwrap();
    assert_eq!(q.pop(), Some((EventType::Added, obj("foo", 1))));
    q.delete(obj("foo", 9)).unwrap();
    assert_eq!(q.pop(), Some((EventType::Deleted, obj("foo", 1))));
}

#[test]
fn delete_of_unknown_object_uses_incoming_payload() {
    let q = queue();
    q.delete(obj("ghost", 5)).unwrap();
    assert_eq!(q.pop(), Some((EventType::Deleted, obj("ghost", 5))));
}

#[test]
fn compression_never_reorders_keys() {
    let q = queue();
    q.add(obj("a", 1)).unwrap();
    q.add(obj("b", 1)).unwrap();
    q.add(obj("c", 1)).unwrap();
    q.update(obj("a", 2)).unwrap();
    q.update(obj("b", 2)).unwrap();
    assert_eq!(q.list_keys(), vec!["a", "b", "c"]);

    let popped: Vec<_> = std::iter::from_fn(|| q.try_pop()).collect();
    assert_eq!(
        popped,
        vec![
            (EventType::Added, obj("a", 2)),
            (EventType::Added, obj("b", 2)),
            (EventType::Added, obj("c", 1)),
        ]
    );
}

#[test]
fn dropped_key_requeues_at_the_back() {
    let q = queue();
    q.add(obj("a", 1)).unwrap();
    q.add(obj("b", 1)).unwrap();
    q.delete(obj("a", 1)).unwrap();
    q.add(obj("a", 2)).unwrap();
    assert_eq!(q.list_keys(), vec!["b", "a"]);
}

#[test]
fn key_failure_mutates_nothing() {
    let q = queue();
    q.add(obj("a", 1)).unwrap();
    assert_eq!(q.add(obj("", 1)), Err(KeyError::MissingName));
    assert_eq!(q.delete(obj("", 1)), Err(KeyError::MissingName));
    assert_eq!(q.replace(vec![obj("b", 1), obj("", 2)], "7"), Err(KeyError::MissingName));

    assert_eq!(q.list_keys(), vec!["a"]);
    assert!(!q.list_successful_at_least_once());
    assert_eq!(q.last_replace_version(), None);
}

#[test]
fn get_sees_only_queued_keys() {
    let q = queue();
    q.add(obj("foo", 1)).unwrap();
    assert_eq!(q.get(&obj("foo", 0)).unwrap(), Some(obj("foo", 1)));
    assert_eq!(q.get_by_key("foo"), Some(obj("foo", 1)));
    q.pop();
    assert_eq!(q.get_by_key("foo"), None);
    assert_eq!(q.get(&obj("", 0)), Err(KeyError::MissingName));
}

#[test]
fn list_reports_pending_work_only() {
    let q = queue();
    q.add(obj("a", 1)).unwrap();
    q.add(obj("b", 2)).unwrap();
    q.pop();
    assert_eq!(q.list(), vec![obj("b", 2)]);
    assert_eq!(q.list_keys(), vec!["b"]);
    let ids = q.contained_ids();
    assert!(ids.contains("b"));
    assert!(!ids.contains("a"));
}

#[test]
#[should_panic(expected = "invalid watch event transition")]
fn event_after_pending_delete_panics() {
    let q = queue();
    q.add(obj("foo", 1)).unwrap();
    q.pop();
    q.delete(obj("foo", 1)).unwrap();
    q.add(obj("foo", 2)).unwrap();
}

#[test]
fn json_objects_with_namespace_keys() {
    let q: EventQueue<Value, MetaNamespaceKey> = EventQueue::new(MetaNamespaceKey);
    let cm = |v: i64| json!({ "metadata": { "name": "cfg", "namespace": "default" }, "data": { "v": v } });
    q.add(cm(1)).unwrap();
    q.update(cm(2)).unwrap();
    assert_eq!(q.list_keys(), vec!["default/cfg"]);
    let (kind, got) = q.pop().unwrap();
    assert_eq!(kind, EventType::Added);
    assert_eq!(got["data"]["v"], 2);
    assert_eq!(q.add(json!({ "metadata": {} })), Err(KeyError::MissingName));
}

#[test]
fn pending_event_tracks_merged_type() {
    let q = queue();
    assert_eq!(q.pending_event("foo"), None);
    q.update(obj("foo", 1)).unwrap();
    assert_eq!(q.pending_event("foo"), Some(EventType::Modified));
    q.delete(obj("foo", 1)).unwrap();
    assert_eq!(q.pending_event("foo"), Some(EventType::Deleted));
    q.pop();
    assert_eq!(q.pending_event("foo"), None);
}
