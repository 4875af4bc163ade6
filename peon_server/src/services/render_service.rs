//! Coalesced status rendering.
//!
//! At most one render pass runs at a time. Requests arriving while a pass is
//! in flight set a refresh flag, and the flag triggers exactly one more full
//! pass once the current one ends, so a burst of requests costs at most two
//! passes and the last one sees the latest state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// One full regeneration of the status output.
#[async_trait]
pub trait RenderPass: Send + Sync {
    /// `since` is the start time of the previous successful pass, if any.
    async fn render(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<()>;
}

/// Watermark persisted next to the rendered pages.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderState {
    pub last_render: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Flags {
    rendering: bool,
    refresh: bool,
}

struct Inner {
    pass: Arc<dyn RenderPass>,
    flags: Mutex<Flags>,
    busy: watch::Sender<bool>,
    state: Mutex<RenderState>,
    state_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct RenderCoordinator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RenderCoordinator {
    pub fn new(pass: Arc<dyn RenderPass>) -> Self {
        Self::with_state(pass, RenderState::default(), None)
    }

    /// Coordinator whose watermark is loaded from, and saved to, `state_file`.
    pub async fn open(pass: Arc<dyn RenderPass>, state_file: PathBuf) -> Self {
        let state = match tokio::fs::read(&state_file).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(file = %state_file.display(), "ignoring unreadable render state: {e}");
                RenderState::default()
            }),
            Err(_) => RenderState::default(),
        };
        Self::with_state(pass, state, Some(state_file))
    }

    fn with_state(pass: Arc<dyn RenderPass>, state: RenderState, state_file: Option<PathBuf>) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pass,
                flags: Mutex::new(Flags::default()),
                busy,
                state: Mutex::new(state),
                state_file,
            }),
        }
    }

    /// Request a render. Never waits for it.
    pub fn render(&self) {
        let mut flags = lock(&self.inner.flags);
        if flags.rendering {
            flags.refresh = true;
            return;
        }
        flags.rendering = true;
        self.inner.busy.send_replace(true);
        drop(flags);

        let inner = self.inner.clone();
        tokio::spawn(inner.run());
    }

    /// Wait until no render pass is running or pending.
    pub async fn idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    #[cfg(test)]
    pub fn state(&self) -> RenderState {
        lock(&self.inner.state).clone()
    }
}

/// Releases the coordinator if a pass unwinds, so later requests can start a new one.
struct PassGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("status render pass panicked");
            let mut flags = lock(&self.inner.flags);
            flags.rendering = false;
            flags.refresh = false;
            self.inner.busy.send_replace(false);
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut guard = PassGuard {
            inner: &self,
            armed: true,
        };
        loop {
            let started = Utc::now();
            let since = lock(&self.state).last_render;

            match self.pass.render(since).await {
                Ok(()) => {
                    let state = RenderState {
                        last_render: Some(started),
                    };
                    *lock(&self.state) = state.clone();
                    self.persist(&state).await;
                    crate::metrics::render_completed();
                }
                Err(e) => tracing::error!("status render failed: {e:#}"),
            }

            let mut flags = lock(&self.flags);
            if flags.refresh {
                flags.refresh = false;
                continue;
            }
            flags.rendering = false;
            self.busy.send_replace(false);
            guard.armed = false;
            break;
        }
    }

    async fn persist(&self, state: &RenderState) {
        let Some(path) = &self.state_file else {
            return;
        };
        let result = match serde_json::to_vec(state) {
            Ok(raw) => tokio::fs::write(path, raw).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(file = %path.display(), "could not save render state: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Render pass that counts invocations and records what it observed.
    #[derive(Default)]
    pub(crate) struct CountingPass {
        pub passes: AtomicUsize,
        pub observed: Mutex<Vec<usize>>,
        pub source: Arc<AtomicUsize>,
        pub delay: Duration,
    }

    #[async_trait]
    impl RenderPass for CountingPass {
        async fn render(&self, _since: Option<DateTime<Utc>>) -> anyhow::Result<()> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            let value = self.source.load(Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.observed.lock().unwrap().push(value);
            Ok(())
        }
    }

    #[tokio::test]
    async fn burst_of_requests_costs_at_most_two_passes() {
        let source = Arc::new(AtomicUsize::new(0));
        let pass = Arc::new(CountingPass {
            source: source.clone(),
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let coordinator = RenderCoordinator::new(pass.clone());

        for i in 1..=20 {
            source.store(i, Ordering::SeqCst);
            coordinator.render();
        }
        coordinator.idle().await;

        assert_eq!(pass.passes.load(Ordering::SeqCst), 2);
        assert_eq!(pass.observed.lock().unwrap().last(), Some(&20));
    }

    #[tokio::test]
    async fn single_request_renders_once() {
        let pass = Arc::new(CountingPass::default());
        let coordinator = RenderCoordinator::new(pass.clone());

        coordinator.render();
        coordinator.idle().await;

        assert_eq!(pass.passes.load(Ordering::SeqCst), 1);
        assert!(coordinator.state().last_render.is_some());
    }

    #[tokio::test]
    async fn requests_after_idle_start_a_new_pass() {
        let pass = Arc::new(CountingPass::default());
        let coordinator = RenderCoordinator::new(pass.clone());

        coordinator.render();
        coordinator.idle().await;
        let first = coordinator.state().last_render;
        coordinator.render();
        coordinator.idle().await;

        assert_eq!(pass.passes.load(Ordering::SeqCst), 2);
        assert!(coordinator.state().last_render >= first);
    }

    /// Panics on its first pass only.
    #[derive(Default)]
    struct PanickingPass {
        passes: AtomicUsize,
    }

    #[async_trait]
    impl RenderPass for PanickingPass {
        async fn render(&self, _since: Option<DateTime<Utc>>) -> anyhow::Result<()> {
            if self.passes.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("template exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_pass_does_not_wedge_the_coordinator() {
        let pass = Arc::new(PanickingPass::default());
        let coordinator = RenderCoordinator::new(pass.clone());

        coordinator.render();
        tokio::time::timeout(Duration::from_secs(5), coordinator.idle())
            .await
            .expect("coordinator should go idle after a panic");

        coordinator.render();
        tokio::time::timeout(Duration::from_secs(5), coordinator.idle())
            .await
            .expect("coordinator should render again");

        assert_eq!(pass.passes.load(Ordering::SeqCst), 2);
        assert!(coordinator.state().last_render.is_some());
    }

    #[tokio::test]
    async fn watermark_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("render-state.json");
        let pass = Arc::new(CountingPass::default());

        let coordinator = RenderCoordinator::open(pass.clone(), file.clone()).await;
        coordinator.render();
        coordinator.idle().await;
        let saved = coordinator.state();

        let reopened = RenderCoordinator::open(pass, file).await;
        assert_eq!(reopened.state(), saved);
        assert!(saved.last_render.is_some());
    }
}
