//! `spec.md` §8 scenario S6: `--config-remove` on a dotted key removes that
//! entry and leaves siblings intact. Exercised directly against a
//! `SnapshotBackend`, since the dotted-key walk/removal logic lives in
//! `Backend::remove_path`.

use anvil::backend::snapshot::SnapshotBackend;
use anvil::backend::Backend;
use anvil::digest::Digest;

#[test]
fn removing_one_call_leaves_its_sibling_call_intact() {
    let mut backend = SnapshotBackend::new();

    let id1 = backend
        .save_call("compile", Digest::of_bytes(b"args-1"), serde_json::json!(["a.c"]), serde_json::json!("a.o"))
        .unwrap();
    let id2 = backend
        .save_call("compile", Digest::of_bytes(b"args-2"), serde_json::json!(["b.c"]), serde_json::json!("b.o"))
        .unwrap();
    assert_ne!(id1, id2);

    let removed = backend.remove_path(&["compile".to_string(), id1.to_string()]).unwrap();
    assert!(removed);

    let dump = backend.dump().unwrap();
    let calls = dump.get("compile").unwrap().as_object().unwrap();
    assert!(!calls.contains_key(&id1.to_string()));
    assert!(calls.contains_key(&id2.to_string()));
}

#[test]
fn removing_a_whole_function_drops_every_call_under_it() {
    let mut backend = SnapshotBackend::new();
    backend
        .save_call("compile", Digest::of_bytes(b"args-1"), serde_json::json!([]), serde_json::json!(1))
        .unwrap();
    backend
        .save_call("link", Digest::of_bytes(b"args-2"), serde_json::json!([]), serde_json::json!(2))
        .unwrap();

    let removed = backend.remove_path(&["compile".to_string()]).unwrap();
    assert!(removed);

    let dump = backend.dump().unwrap();
    assert!(dump.get("compile").is_none());
    assert!(dump.get("link").is_some(), "an unrelated function's calls must survive");
}

#[test]
fn removing_an_absent_key_reports_nothing_removed() {
    let mut backend = SnapshotBackend::new();
    backend
        .save_call("compile", Digest::of_bytes(b"args-1"), serde_json::json!([]), serde_json::json!(1))
        .unwrap();

    let removed = backend.remove_path(&["does-not-exist".to_string()]).unwrap();
    assert!(!removed);
}
