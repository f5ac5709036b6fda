//! Per-view session state: live processes, the active pager and the display
//! it draws into.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    tokio::sync::{Mutex, MutexGuard, watch},
    tracing::{debug, info},
};

use crate::subprocess::{ProcessHandle, ProcessId, ProcessSet};

/// Size of the message view region in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u16,
    pub height: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// The UI region a session's pager draws into.
pub trait DisplaySurface: Send + Sync {
    /// Current size of the message view.
    fn geometry(&self) -> Geometry;

    /// Ask the UI to redraw the message view. Must not block, and repeated
    /// requests before the next frame collapse into one redraw.
    fn request_rerender(&self);
}

/// State for one message view: the processes it owns and its active pager.
pub struct Session {
    name: String,
    display: Arc<dyn DisplaySurface>,
    processes: Mutex<ProcessSet>,
    active_viewer: watch::Sender<Option<ProcessId>>,
    render: Mutex<()>,
    /// Set by `teardown`, under the process lock. No process is accepted
    /// afterwards.
    closed: AtomicBool,
}

impl Session {
    pub fn new(name: impl Into<String>, display: Arc<dyn DisplaySurface>) -> Self {
        Self {
            name: name.into(),
            display,
            processes: Mutex::new(ProcessSet::new()),
            active_viewer: watch::Sender::new(None),
            render: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display(&self) -> &dyn DisplaySurface {
        self.display.as_ref()
    }

    /// The pager currently presenting this session's content.
    pub fn active_viewer(&self) -> Option<ProcessId> {
        *self.active_viewer.borrow()
    }

    pub async fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.lock().await.ids()
    }

    pub async fn process_count(&self) -> usize {
        self.processes.lock().await.len()
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Track a live process so teardown can reap it. Once the session is torn
    /// down the process is terminated instead and `false` is returned.
    pub async fn register(&self, handle: ProcessHandle) -> bool {
        {
            let mut processes = self.processes.lock().await;
            if !self.is_closed() {
                debug!(session = %self.name, id = %handle.id(), command = handle.label(), "registered process");
                processes.insert(handle);
                return true;
            }
        }
        self.refuse(handle).await;
        false
    }

    /// Stop tracking a process, returning its handle if it was tracked.
    pub async fn release(&self, id: ProcessId) -> Option<ProcessHandle> {
        self.processes.lock().await.remove(id)
    }

    /// Serialises render requests so only one filter chain runs at a time.
    pub(crate) async fn lock_render(&self) -> MutexGuard<'_, ()> {
        self.render.lock().await
    }

    /// Make `handle` the active pager. A previous pager is terminated. Returns
    /// `false`, terminating `handle`, when the session is already torn down.
    pub(crate) async fn set_active_viewer(&self, handle: ProcessHandle) -> bool {
        let id = handle.id();
        let superseded = {
            let mut processes = self.processes.lock().await;
            if self.is_closed() {
                drop(processes);
                self.refuse(handle).await;
                return false;
            }
            processes.insert(handle);
            self.active_viewer
                .send_replace(Some(id))
                .and_then(|previous| processes.remove(previous))
        };
        if let Some(previous) = superseded {
            debug!(session = %self.name, previous = %previous.id(), current = %id, "viewer superseded");
            previous.terminate().await;
        }
        true
    }

    async fn refuse(&self, handle: ProcessHandle) {
        debug!(session = %self.name, id = %handle.id(), "session closed, terminating process");
        handle.terminate().await;
    }

    /// Called when a pager exits on its own.
    pub(crate) async fn viewer_exited(&self, id: ProcessId) {
        self.active_viewer.send_if_modified(|active| {
            if *active == Some(id) {
                *active = None;
                true
            } else {
                false
            }
        });
        if self.release(id).await.is_some() {
            debug!(session = %self.name, %id, "viewer exited");
            self.display.request_rerender();
        }
    }

    /// Wait until no pager is active.
    pub async fn wait_viewer_closed(&self) {
        let mut rx = self.active_viewer.subscribe();
        let _ = rx.wait_for(Option::is_none).await;
    }

    /// Terminate and reap every process this session owns. Their completions
    /// are not delivered.
    pub async fn teardown(&self) {
        let mut processes = self.processes.lock().await;
        self.closed.store(true, Ordering::Release);
        let count = processes.len();
        processes.terminate_all().await;
        self.active_viewer.send_replace(None);
        info!(session = %self.name, count, "session torn down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("active_viewer", &self.active_viewer())
            .finish_non_exhaustive()
    }
}
