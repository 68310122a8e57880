//! Tree resources: children listings and subtree moves

use proptest::prelude::*;
use rescache_core::prelude::*;
use rescache_core::{MutationOutcome, NormalizedKey};
use rescache_test_utils::{FileNode, ScriptedNetwork};
use serde_json::{json, Value};
use std::sync::Arc;

fn files(net: &Arc<ScriptedNetwork>) -> TreeResource<FileNode> {
    TreeResource::builder("files")
        .loader(RemoteLoader::new(net.clone(), "stat", "listDir"))
        .build()
}

fn listing(net: &ScriptedNetwork, parent: &str, children: &[&str]) {
    let nodes: Vec<Value> = children.iter().map(|p| FileNode::json(p)).collect();
    net.respond_to("listDir", json!({ "parent": parent }), Value::Array(nodes));
}

fn canonical(entries: Vec<(NormalizedKey, Arc<FileNode>)>) -> Vec<String> {
    entries.into_iter().map(|(k, _)| k.canonical().to_string()).collect()
}

#[tokio::test]
async fn move_keeps_entity_identity() {
    let net = ScriptedNetwork::new();
    listing(&net, "", &["docs", "archive"]);
    listing(&net, "docs", &["docs/a.txt", "docs/b.txt"]);
    listing(&net, "archive", &[]);
    let files = files(&net);
    files.load_children("").await.unwrap();
    files.load_children("docs").await.unwrap();
    files.load_children("archive").await.unwrap();
    let before = files.get("docs/a.txt").unwrap().unwrap();

    files.move_path("docs", "archive/docs").await.unwrap();

    assert!(!files.has("docs/a.txt").unwrap());
    assert!(files.has("archive/docs/a.txt").unwrap());
    let after = files.get("archive/docs/a.txt").unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(canonical(files.children("").unwrap()), vec!["archive"]);
    assert_eq!(canonical(files.children("archive").unwrap()), vec!["archive/docs"]);
    assert_eq!(net.calls(), 3);
}

#[tokio::test]
async fn move_onto_itself_is_a_no_op() {
    let net = ScriptedNetwork::new();
    listing(&net, "docs", &["docs/a.txt"]);
    let files = files(&net);
    files.load_children("docs").await.unwrap();
    files.move_path("docs", "docs").await.unwrap();
    assert!(files.has("docs/a.txt").unwrap());
}

#[tokio::test]
async fn move_replaces_existing_destination() {
    let net = ScriptedNetwork::new();
    listing(&net, "", &["a", "b"]);
    listing(&net, "a", &["a/x.txt"]);
    listing(&net, "b", &["b/old.txt"]);
    let files = files(&net);
    files.load_children("").await.unwrap();
    files.load_children("a").await.unwrap();
    files.load_children("b").await.unwrap();

    files.move_path("a", "b").await.unwrap();

    assert!(!files.has("b/old.txt").unwrap());
    assert!(files.has("b/x.txt").unwrap());
    assert_eq!(canonical(files.children("b").unwrap()), vec!["b/x.txt"]);
    assert_eq!(canonical(files.children("").unwrap()), vec!["b"]);
}

#[tokio::test]
async fn mutation_outcome_move_relabels() {
    let net = ScriptedNetwork::new();
    listing(&net, "docs", &["docs/a.txt"]);
    let files = files(&net);
    files.load_children("docs").await.unwrap();

    let to: TreePath = "docs/renamed.txt".parse().unwrap();
    files
        .mutate("docs/a.txt", move || async move { Ok(MutationOutcome::Move(to)) })
        .await
        .unwrap();
    assert!(files.has("docs/renamed.txt").unwrap());
    assert_eq!(canonical(files.children("docs").unwrap()), vec!["docs/renamed.txt"]);
}

#[tokio::test]
async fn failed_mutation_applies_nothing() {
    let net = ScriptedNetwork::new();
    listing(&net, "docs", &["docs/a.txt"]);
    let files = files(&net);
    files.load_children("docs").await.unwrap();

    let err = files
        .mutate("docs/a.txt", || async {
            Err::<MutationOutcome<FileNode>, _>(ResourceError::unsupported("delete", "files"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::Unsupported { .. }));
    assert!(files.has("docs/a.txt").unwrap());
}

#[tokio::test]
async fn deleting_a_directory_removes_its_subtree() {
    let net = ScriptedNetwork::new();
    listing(&net, "", &["docs"]);
    listing(&net, "docs", &["docs/a.txt", "docs/b.txt"]);
    let files = files(&net);
    files.load_children("").await.unwrap();
    files.load_children("docs").await.unwrap();

    files.delete("docs").await.unwrap();
    assert!(!files.has("docs/a.txt").unwrap());
    assert!(files.children("").unwrap().is_empty());
}

proptest! {
    #[test]
    fn prop_move_relocates_every_cached_entry(
        names in proptest::collection::btree_set("[a-z]{1,4}\\.txt", 1..8),
        nested in proptest::collection::btree_set("[a-z]{1,4}\\.md", 0..5),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let net = ScriptedNetwork::new();
            let top: Vec<String> = names.iter().map(|n| format!("src/{n}")).chain(["src/sub".to_string()]).collect();
            let deep: Vec<String> = nested.iter().map(|n| format!("src/sub/{n}")).collect();
            listing(&net, "", &["src", "dst"]);
            listing(&net, "dst", &[]);
            listing(&net, "src", &top.iter().map(String::as_str).collect::<Vec<_>>());
            listing(&net, "src/sub", &deep.iter().map(String::as_str).collect::<Vec<_>>());

            let files = files(&net);
            for parent in ["", "dst", "src", "src/sub"] {
                files.load_children(parent).await.unwrap();
            }
            let before: Vec<(String, Arc<FileNode>)> = top
                .iter()
                .chain(deep.iter())
                .map(|p| (p.clone(), files.get(p.as_str()).unwrap().unwrap()))
                .collect();

            files.move_path("src", "dst/src").await.unwrap();

            for (path, value) in &before {
                prop_assert!(!files.has(path.as_str()).unwrap());
                let moved = files.get(format!("dst/{path}")).unwrap().unwrap();
                prop_assert!(Arc::ptr_eq(value, &moved));
            }
            let expected: Vec<String> = top.iter().map(|p| format!("dst/{p}")).collect();
            prop_assert_eq!(canonical(files.children("dst/src").unwrap()), expected);
            prop_assert_eq!(canonical(files.children("dst").unwrap()), vec!["dst/src".to_string()]);
            prop_assert!(files.children("src").unwrap().is_empty());
            Ok(())
        })?;
    }
}
