//! Tests for the controller lifecycle.

mod common;

use std::sync::Arc;

use common::*;
use graph_flow::{ErrorKind, Phase, Session, ViewState};
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_category_view_becomes_ready() {
    init_tracing();
    let session = Session::new(memory_source());
    let category = session.controller(|slug: &String| category_page(slug));
    let mut updates = category.subscribe();

    category.mount("news".to_string());
    assert_eq!(category.phase(), Phase::Loading);
    assert!(category.state().is_loading());

    let state = updates.recv().await.unwrap();
    assert!(state.ready);
    assert!(state.errors.is_empty());
    let data = state.data.unwrap();
    assert_eq!(data["categories"]["bySlug"]["news"]["name"], json!("News"));
    assert_eq!(
        data["categories"]["bySlug"]["news"]["articles"][2]["title"],
        json!("Three")
    );
    assert_eq!(category.phase(), Phase::Ready);
}

#[tokio::test]
async fn test_missing_category_is_not_found() {
    let session = Session::new(memory_source());
    let category = session.controller(|slug: &String| category_page(slug));
    let mut updates = category.subscribe();

    category.mount("nope".to_string());
    let state = updates.recv().await.unwrap();
    assert!(state.ready);
    assert!(state.data.is_none());
    assert!(state.is_not_found());
    assert_eq!(category.phase(), Phase::Ready);
}

#[tokio::test]
async fn test_failed_view_is_errored() {
    let source = memory_source();
    let session = Session::new(source.clone());
    source.fail_next("backend unavailable");
    let app = session.fixed_controller(vec![ps(json!(["appName"]))]);
    let mut updates = app.subscribe();

    app.mount(());
    let state = updates.recv().await.unwrap();
    assert!(state.ready);
    assert!(state.data.is_none());
    assert_eq!(state.error.unwrap().kind, ErrorKind::FetchFailed);
    assert_eq!(app.phase(), Phase::Errored);
}

#[tokio::test]
async fn test_partial_failure_is_ready_with_errors() {
    let session = Session::new(memory_source());
    let view = session.fixed_controller(vec![ps(json!(["appName"])), ps(json!(["broken"]))]);
    let mut updates = view.subscribe();

    view.mount(());
    let state = updates.recv().await.unwrap();
    assert_eq!(view.phase(), Phase::Ready);
    assert_eq!(state.data.unwrap()["appName"], json!("Gazelle"));
    assert!(state.error.is_none());
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].error.kind, ErrorKind::Upstream);
}

#[tokio::test]
async fn test_stale_resolution_is_discarded() {
    let tracer = Arc::new(CountingTracer::default());
    let session = Session::builder(memory_source())
        .tracer(SharedTracer(tracer.clone()))
        .build();
    let category = session.controller(|slug: &String| category_page(slug));
    let mut updates = category.subscribe();

    category.mount("news".to_string());
    category.set_params("arts".to_string()).unwrap();

    let state = updates.recv().await.unwrap();
    assert_eq!(state.generation, 2);
    let data = state.data.unwrap();
    assert_eq!(data["categories"]["bySlug"]["arts"]["name"], json!("Arts"));
    assert!(data["categories"]["bySlug"].get("news").is_none());

    settle().await;
    assert_eq!(count(&tracer.discarded), 1);
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_unmount_mid_resolution_keeps_shared_fetch() {
    let gated = GatedSource::new(memory_source());
    let session = Session::new(gated.clone());
    let first = session.fixed_controller(vec![ps(json!(["appName"]))]);
    let second = session.fixed_controller(vec![ps(json!(["appName"]))]);
    let mut first_updates = first.subscribe();
    let mut second_updates = second.subscribe();

    first.mount(());
    gated.wait_started(1).await;
    second.mount(());
    settle().await;

    first.unmount();
    assert_eq!(first.phase(), Phase::Unmounted);
    gated.release(1);

    let state = second_updates.recv().await.unwrap();
    assert_eq!(state.data.unwrap()["appName"], json!("Gazelle"));
    assert_eq!(gated.started(), 1);

    settle().await;
    assert!(matches!(first_updates.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(first.state(), ViewState::default());
}

#[tokio::test]
async fn test_remount_after_unmount() {
    let source = memory_source();
    let session = Session::new(source.clone());
    let app = session.fixed_controller(vec![ps(json!(["appName"]))]);
    let mut updates = app.subscribe();

    app.mount(());
    app.unmount();
    assert!(app.set_params(()).is_err());

    app.mount(());
    let state = updates.recv().await.unwrap();
    assert_eq!(state.generation, 3);
    assert_eq!(state.data.unwrap()["appName"], json!("Gazelle"));
}
