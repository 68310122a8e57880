//! Load scheduling and freshness against a scripted network

use rescache_core::prelude::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use rescache_core::{ConditionState, NormalizedKey, PreconditionError, Requirement};
use rescache_test_utils::{Project, ScriptedNetwork, StaticConditions, User};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn projects(net: &Arc<ScriptedNetwork>) -> MapResource<Project> {
    MapResource::builder("projects")
        .loader(RemoteLoader::new(net.clone(), "getProject", "listProjects"))
        .build()
}

#[tokio::test]
async fn concurrent_loads_share_one_fetch() {
    let net = ScriptedNetwork::new();
    net.respond("getProject", Project::json("P1", "Alpha"));
    net.hold();
    let projects = projects(&net);

    let first = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_one("P1").await }
    });
    net.wait_for_calls(1).await;
    let second = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_one("P1").await }
    });
    let key = projects.normalize("P1").unwrap();
    assert!(projects.scheduler().in_flight(&key));
    tokio::time::sleep(Duration::from_millis(10)).await;
    net.release();

    let a = first.await.unwrap().unwrap().unwrap();
    let b = second.await.unwrap().unwrap().unwrap();
    assert_eq!(a.name, "Alpha");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(net.calls(), 1);
}

#[tokio::test]
async fn joined_callers_share_failure() {
    let net = ScriptedNetwork::new();
    net.fail("getProject", "boom");
    net.hold();
    let projects = projects(&net);

    let first = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load("P1").await }
    });
    net.wait_for_calls(1).await;
    let second = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load("P1").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    net.release();

    let a = first.await.unwrap().unwrap_err();
    let b = second.await.unwrap().unwrap_err();
    assert_eq!(a.to_string(), b.to_string());
    assert!(a.is_retryable());
    assert_eq!(net.calls(), 1);
    assert!(projects.state("P1").unwrap().unwrap().error().is_some());

    // errored keys stay errored until refreshed
    net.respond("getProject", Project::json("P1", "Alpha"));
    assert!(projects.load("P1").await.is_err());
    assert_eq!(net.calls(), 1);
    let refreshed = projects.refresh("P1").await.unwrap();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(net.calls(), 2);
}

#[tokio::test]
async fn item_load_joins_pending_list_load() {
    let net = ScriptedNetwork::new();
    net.respond(
        "listProjects",
        serde_json::json!([Project::json("P1", "Alpha"), Project::json("P2", "Beta")]),
    );
    net.hold();
    let projects = projects(&net);

    let list = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_all().await }
    });
    net.wait_for_calls(1).await;
    let item = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_one("P2").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    net.release();

    assert_eq!(list.await.unwrap().unwrap().len(), 2);
    assert_eq!(item.await.unwrap().unwrap().unwrap().name, "Beta");
    assert_eq!(net.calls_to("getProject"), 0);
}

#[tokio::test]
async fn outdate_during_load_forces_second_fetch() {
    let net = ScriptedNetwork::new();
    net.respond("getProject", Project::json("P1", "Old"));
    net.hold();
    let projects = projects(&net);

    let first = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_one("P1").await }
    });
    net.wait_for_calls(1).await;

    net.respond("getProject", Project::json("P1", "New"));
    projects.mark_outdated("P1").unwrap();
    let second = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_one("P1").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    net.release();

    assert_eq!(second.await.unwrap().unwrap().unwrap().name, "New");
    assert_eq!(first.await.unwrap().unwrap().unwrap().name, "New");
    assert_eq!(net.calls(), 2);
    assert!(!projects.is_outdated("P1").unwrap());
}

/// Serves a fresh revision per fetch and outdates the key again from the
/// second fetch on
struct ChurningLoader {
    fetches: AtomicUsize,
    resource: Mutex<Option<MapResource<Project>>>,
}

#[async_trait]
impl Loader<Project> for ChurningLoader {
    async fn fetch(&self, key: &NormalizedKey) -> Result<Vec<Project>, ResourceError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if n > 0 {
            let resource = self.resource.lock().clone();
            if let Some(resource) = resource {
                resource.mark_outdated(key)?;
            }
        }
        Ok(vec![Project::new("P1", &format!("v{n}"))])
    }
}

#[tokio::test]
async fn load_fails_rather_than_return_value_from_before_outdate() {
    let loader = Arc::new(ChurningLoader {
        fetches: AtomicUsize::new(0),
        resource: Mutex::new(None),
    });
    let projects = MapResource::<Project>::builder("projects")
        .loader_arc(loader.clone())
        .build();
    *loader.resource.lock() = Some(projects.clone());

    assert_eq!(projects.load_one("P1").await.unwrap().unwrap().name, "v0");
    projects.mark_outdated("P1").unwrap();

    let err = projects.load_one("P1").await.unwrap_err();
    assert!(matches!(err, ResourceError::Aborted { .. }));
    assert!(err.is_retryable());
    assert!(projects.is_outdated("P1").unwrap());
    assert_eq!(projects.get("P1").unwrap().unwrap().name, "v0");
    assert!(loader.fetches.load(Ordering::SeqCst) > 1);

    loader.resource.lock().take();
}

#[tokio::test]
async fn outdated_values_stay_readable_until_reload() {
    let net = ScriptedNetwork::new();
    net.respond("getProject", Project::json("P1", "Old"));
    let projects = projects(&net);
    projects.load("P1").await.unwrap();

    let marked = projects.mark_outdated("P1").unwrap();
    assert_eq!(marked.len(), 1);
    assert!(projects.is_outdated("P1").unwrap());
    assert_eq!(projects.get("P1").unwrap().unwrap().name, "Old");

    net.respond("getProject", Project::json("P1", "New"));
    assert_eq!(projects.load_one("P1").await.unwrap().unwrap().name, "New");
    assert_eq!(net.calls(), 2);
}

#[tokio::test]
async fn mutation_waits_for_pending_load() {
    let net = ScriptedNetwork::new();
    net.respond("getProject", Project::json("P1", "Remote"));
    net.hold();
    let projects = projects(&net);

    let load = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_one("P1").await }
    });
    net.wait_for_calls(1).await;
    let write = tokio::spawn({
        let projects = projects.clone();
        async move { projects.set("P1", Project::new("P1", "Local")).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!write.is_finished());
    net.release();

    load.await.unwrap().unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(projects.get("P1").unwrap().unwrap().name, "Local");
}

#[tokio::test]
async fn denied_condition_fails_without_fetch() {
    let net = ScriptedNetwork::new();
    let conditions = StaticConditions::new(ConditionState::Denied);
    let projects = projects(&net);
    projects.require(Requirement::condition(conditions, "projects:read"));

    let err = projects.load("@all").await.unwrap_err();
    assert!(matches!(err, ResourceError::Precondition(PreconditionError::Denied { .. })));
    assert_eq!(net.calls(), 0);
}

#[tokio::test]
async fn pending_condition_blocks_until_satisfied() {
    let net = ScriptedNetwork::new();
    net.respond("listProjects", serde_json::json!([Project::json("P1", "Alpha")]));
    let conditions = StaticConditions::new(ConditionState::Pending);
    let projects = projects(&net);
    projects.require(Requirement::condition(conditions.clone(), "projects:read"));

    let load = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load_all().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!load.is_finished());
    assert_eq!(net.calls(), 0);

    conditions.set_state("projects:read", ConditionState::Satisfied);
    assert_eq!(load.await.unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn pending_condition_times_out() {
    let net = ScriptedNetwork::new();
    let conditions = StaticConditions::new(ConditionState::Pending);
    let projects = projects(&net);
    projects.require(Requirement::condition(conditions, "projects:read"));
    projects.set_requirement_timeout(Some(Duration::from_millis(20)));

    let err = projects.load("P1").await.unwrap_err();
    assert!(matches!(err, ResourceError::Precondition(PreconditionError::TimedOut { .. })));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn closed_provider_fails_pending_wait() {
    let net = ScriptedNetwork::new();
    let conditions = StaticConditions::new(ConditionState::Pending);
    let projects = projects(&net);
    projects.require(Requirement::condition(conditions.clone(), "projects:read"));

    let load = tokio::spawn({
        let projects = projects.clone();
        async move { projects.load("P1").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    conditions.close();
    let err = load.await.unwrap().unwrap_err();
    assert!(matches!(err, ResourceError::Precondition(PreconditionError::Closed { .. })));
}

#[tokio::test]
async fn upstream_requirement_failure_is_reported() {
    let net = ScriptedNetwork::new();
    net.fail("getUser", "unauthorized");
    let user = MapResource::<User>::builder("current_user")
        .loader(RemoteLoader::new(net.clone(), "getUser", "listUsers"))
        .build();
    let projects = projects(&net);
    projects.require(Requirement::resource(user.managed(), &CacheKey::entity("me").unwrap()).unwrap());

    let err = projects.load("@all").await.unwrap_err();
    match err {
        ResourceError::Precondition(PreconditionError::Upstream { resource, .. }) => {
            assert_eq!(resource, "current_user");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(net.calls_to("listProjects"), 0);
}

#[tokio::test]
async fn lifecycle_events_follow_writes() {
    let net = ScriptedNetwork::new();
    let projects = projects(&net);
    let updates = Arc::new(AtomicUsize::new(0));
    let deletes = Arc::new(AtomicUsize::new(0));
    let update_id = {
        let updates = Arc::clone(&updates);
        projects.on_data_update(move |_| {
            updates.fetch_add(1, Ordering::SeqCst);
        })
    };
    {
        let deletes = Arc::clone(&deletes);
        projects.on_item_delete(move |e| {
            assert_eq!(e.key.canonical(), "P1");
            deletes.fetch_add(1, Ordering::SeqCst);
        });
    }

    projects.set("P1", Project::new("P1", "Alpha")).await.unwrap();
    projects.delete("P1").await.unwrap();
    assert!(projects.unsubscribe(update_id));
    projects.set("P2", Project::new("P2", "Beta")).await.unwrap();

    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
    assert!(!projects.has("P1").unwrap());
}
