//! Dependency cascades across synced resources

use pretty_assertions::assert_eq;
use rescache_core::prelude::*;
use rescache_core::{ConfigError, DependencyGraph, DependencyGraphBuilder};
use rescache_test_utils::{Project, ScriptedNetwork, User};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn listed(name: &str, net: &Arc<ScriptedNetwork>) -> MapResource<Project> {
    MapResource::builder(name)
        .loader(RemoteLoader::new(net.clone(), "getProject", "listProjects"))
        .build()
}

fn count_outdates(resource: &MapResource<Project>) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    resource.on_data_outdated(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test]
async fn diamond_outdates_shared_downstream_once() {
    let net = ScriptedNetwork::new();
    net.respond("listProjects", json!([Project::json("P1", "Alpha")]));
    let (a, b, c, d) = (listed("a", &net), listed("b", &net), listed("c", &net), listed("d", &net));
    for r in [&b, &c, &d] {
        r.load_all().await.unwrap();
    }

    let mut builder = DependencyGraphBuilder::new();
    for r in [&a, &b, &c, &d] {
        builder.register(r.managed()).unwrap();
    }
    builder.sync(b.id(), a.id(), SyncMapping::All).unwrap();
    builder.sync(c.id(), a.id(), SyncMapping::All).unwrap();
    builder.sync(d.id(), b.id(), SyncMapping::All).unwrap();
    builder.sync(d.id(), c.id(), SyncMapping::All).unwrap();
    let graph = builder.build().unwrap();
    assert_eq!(graph.order().first(), Some(&a.id()));
    assert_eq!(graph.order().last(), Some(&d.id()));

    let d_outdates = count_outdates(&d);
    a.set("P9", Project::new("P9", "New")).await.unwrap();

    assert_eq!(d_outdates.load(Ordering::SeqCst), 1);
    assert!(b.is_outdated("@all").unwrap());
    assert!(c.is_outdated("@all").unwrap());
    assert!(d.is_outdated("P1").unwrap());

    let key = a.normalize("P9").unwrap();
    let report = graph.cascade(a.id(), &[key]);
    assert_eq!(report.len(), 3);
    assert_eq!(report.visits("d"), 1);
    assert_eq!(report.visits("a"), 0);
}

#[tokio::test]
async fn same_key_mapping_outdates_matching_key() {
    let net = ScriptedNetwork::new();
    net.respond(
        "listProjects",
        json!([Project::json("P1", "Alpha"), Project::json("P2", "Beta")]),
    );
    let upstream = listed("upstream", &net);
    let downstream = listed("downstream", &net);
    downstream.load_all().await.unwrap();

    let mut builder = DependencyGraph::builder();
    builder.register(upstream.managed()).unwrap();
    builder.register(downstream.managed()).unwrap();
    builder.sync(downstream.id(), upstream.id(), SyncMapping::SameKey).unwrap();
    let _graph = builder.build().unwrap();

    upstream.set("P1", Project::new("P1", "Changed")).await.unwrap();
    assert!(downstream.is_outdated("P1").unwrap());
    assert!(!downstream.is_outdated("P2").unwrap());
}

#[tokio::test]
async fn dropped_graph_stops_cascading() {
    let net = ScriptedNetwork::new();
    net.respond("listProjects", json!([Project::json("P1", "Alpha")]));
    let upstream = listed("upstream", &net);
    let downstream = listed("downstream", &net);
    downstream.load_all().await.unwrap();

    let mut builder = DependencyGraph::builder();
    builder.register(upstream.managed()).unwrap();
    builder.register(downstream.managed()).unwrap();
    builder.sync(downstream.id(), upstream.id(), SyncMapping::All).unwrap();
    drop(builder.build().unwrap());

    upstream.set("P1", Project::new("P1", "Changed")).await.unwrap();
    assert!(!downstream.is_outdated("P1").unwrap());
}

#[test]
fn cycles_and_duplicates_are_rejected() {
    let net = ScriptedNetwork::new();
    let (a, b) = (listed("a", &net), listed("b", &net));
    let mut builder = DependencyGraphBuilder::new();
    builder.register(a.managed()).unwrap();
    builder.register(b.managed()).unwrap();
    assert!(matches!(
        builder.register(listed("a", &net).managed()),
        Err(ConfigError::DuplicateResource(_))
    ));
    builder.sync(b.id(), a.id(), SyncMapping::All).unwrap();
    assert!(matches!(
        builder.sync(a.id(), b.id(), SyncMapping::All),
        Err(ConfigError::Cycle { .. })
    ));
    assert!(matches!(
        builder.sync(a.id(), a.id(), SyncMapping::All),
        Err(ConfigError::SelfDependency(_))
    ));
}

#[tokio::test]
async fn switching_user_outdates_projects_without_clearing() -> anyhow::Result<()> {
    let net = ScriptedNetwork::new();
    net.respond(
        "listProjects",
        json!([Project::json("P1", "Alpha"), Project::json("P2", "Beta")]),
    );
    let current_user = MapResource::<User>::builder("current_user").build();
    let projects = listed("projects", &net);

    let mut builder = DependencyGraphBuilder::new();
    builder.register(current_user.managed())?;
    builder.register(projects.managed())?;
    builder.sync(projects.id(), current_user.id(), SyncMapping::All)?;
    let _graph = builder.build()?;

    current_user.set("U1", User::new("U1")).await?;
    let first = projects.load(CacheKey::all()).await?;
    let names: Vec<&str> = first.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "Beta"]);
    assert_eq!(net.calls(), 1);

    net.respond("listProjects", json!([Project::json("P3", "Gamma")]));
    current_user.set("U2", User::new("U2")).await?;

    assert!(projects.is_outdated(CacheKey::all())?);
    assert_eq!(projects.get("P1")?.map(|p| p.name.clone()), Some("Alpha".to_string()));

    let second = projects.load(CacheKey::all()).await?;
    assert_eq!(net.calls(), 2);
    assert_eq!(second.len(), 1);
    assert!(projects.get("P1")?.is_none());
    assert_eq!(projects.get("P3")?.map(|p| p.name.clone()), Some("Gamma".to_string()));
    Ok(())
}
