//! View controllers.
//!
//! A controller binds a view to the path sets it renders. Each mount or
//! parameter change starts a cycle: the view enters `Loading`, the path sets
//! are resolved on a spawned task, and the outcome is published to the
//! subscribers. Cycles are numbered; a cycle that settles after a newer one
//! started (or after unmount) is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::GraphError;
use crate::loading::ViewState;
use crate::path::PathSet;
use crate::resolver::Resolution;
use crate::session::Session;
use crate::tracer::Tracer;

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Not attached to a view.
    Unmounted,
    /// A cycle is resolving.
    Loading,
    /// The latest cycle produced data, or established that none exists.
    Ready,
    /// Every path of the latest cycle failed.
    Errored,
}

struct Inner {
    phase: Phase,
    generation: u64,
    state: ViewState,
    task: Option<JoinHandle<()>>,
    subscribers: Vec<mpsc::UnboundedSender<ViewState>>,
}

type PathSetsFn<P> = dyn Fn(&P) -> Vec<PathSet> + Send + Sync;

/// Drives the data of one view through `Unmounted -> Loading -> Ready | Errored`.
///
/// # Example
///
/// ```ignore
/// let category = session.controller(|slug: &String| {
///     vec![
///         PathSet::from_iter(["categories", "bySlug", slug.as_str(), "name"]),
///         PathSet::new(vec![
///             "categories".into(), "bySlug".into(), slug.as_str().into(),
///             "articles".into(), Range::new(0, 10).into(), "title".into(),
///         ]),
///     ]
/// });
/// let mut updates = category.subscribe();
/// category.mount("news".to_string());
/// let state = updates.recv().await;
/// ```
pub struct Controller<P> {
    session: Session,
    path_sets: Arc<PathSetsFn<P>>,
    inner: Arc<Mutex<Inner>>,
}

impl<P: Send + 'static> Controller<P> {
    /// Create an unmounted controller deriving its path sets from parameters.
    pub fn new<F>(session: Session, path_sets: F) -> Self
    where
        F: Fn(&P) -> Vec<PathSet> + Send + Sync + 'static,
    {
        Self {
            session,
            path_sets: Arc::new(path_sets),
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Unmounted,
                generation: 0,
                state: ViewState::default(),
                task: None,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Attach to a view and start the first cycle.
    ///
    /// Mounting a mounted controller restarts with the new parameters.
    pub fn mount(&self, params: P) {
        self.start(&params);
    }

    /// Start a new cycle with changed parameters.
    ///
    /// The cycle in progress, if any, keeps running but its result is
    /// dropped.
    pub fn set_params(&self, params: P) -> Result<(), GraphError> {
        if self.phase() == Phase::Unmounted {
            return Err(GraphError::NotMounted);
        }
        self.start(&params);
        Ok(())
    }

    /// Detach from the view.
    ///
    /// The running cycle is aborted. Fetches it shares with other views keep
    /// going; only its own subscriptions are dropped.
    pub fn unmount(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.phase = Phase::Unmounted;
        inner.state = ViewState::default();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Current view state.
    pub fn state(&self) -> ViewState {
        self.inner.lock().state.clone()
    }

    /// Receive one state per settled cycle from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ViewState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    fn start(&self, params: &P) {
        let path_sets = (self.path_sets)(params);
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        inner.phase = Phase::Loading;
        inner.state = ViewState::loading(generation);

        let session = self.session.clone();
        let shared = self.inner.clone();
        // The previous handle is dropped, not aborted: its fetches still
        // warm the cache and its result is discarded at settle time.
        inner.task = Some(tokio::spawn(async move {
            let resolution = session.resolve(&path_sets).await;
            settle(&shared, session.tracer(), generation, resolution);
        }));
    }
}

impl Controller<()> {
    /// Create a controller requesting the same path sets on every mount.
    pub fn fixed(session: Session, path_sets: Vec<PathSet>) -> Self {
        Self::new(session, move |_: &()| path_sets.clone())
    }
}

impl<P> Drop for Controller<P> {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().task.take() {
            task.abort();
        }
    }
}

fn settle(inner: &Mutex<Inner>, tracer: &dyn Tracer, generation: u64, resolution: Resolution) {
    let mut inner = inner.lock();
    if inner.generation != generation || inner.phase == Phase::Unmounted {
        tracer.on_resolution_discarded(generation, inner.generation);
        return;
    }

    let (phase, state) = if resolution.is_failed() {
        (Phase::Errored, ViewState::errored(generation, resolution.errors))
    } else if resolution.is_not_found() {
        (Phase::Ready, ViewState::not_found(generation))
    } else {
        (
            Phase::Ready,
            ViewState::ready(generation, Arc::new(resolution.data), resolution.errors),
        )
    };
    tracing::debug!(generation, ?phase, "cycle settled");
    inner.phase = phase;
    inner.state = state.clone();
    inner.task = None;
    inner
        .subscribers
        .retain(|subscriber| subscriber.send(state.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use serde_json::json;

    fn session() -> Session {
        let source = MemorySource::new(json!({ "appName": "Gazelle" })).unwrap();
        Session::new(Arc::new(source))
    }

    fn app_name() -> Vec<PathSet> {
        vec![serde_json::from_value(json!(["appName"])).unwrap()]
    }

    #[tokio::test]
    async fn test_fixed_controller_cycle() {
        let controller = Controller::fixed(session(), app_name());
        assert_eq!(controller.phase(), Phase::Unmounted);

        let mut updates = controller.subscribe();
        controller.mount(());
        assert_eq!(controller.phase(), Phase::Loading);
        assert!(controller.state().is_loading());

        let state = updates.recv().await.unwrap();
        assert!(state.ready);
        assert_eq!(state.data.unwrap()["appName"], json!("Gazelle"));
        assert_eq!(controller.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn test_set_params_requires_mount() {
        let controller = session().controller(|_: &u32| app_name());
        assert!(matches!(
            controller.set_params(1),
            Err(GraphError::NotMounted)
        ));
        controller.mount(1);
        assert!(controller.set_params(2).is_ok());
        controller.unmount();
        assert_eq!(controller.phase(), Phase::Unmounted);
        assert_eq!(controller.state(), ViewState::default());
    }
}
