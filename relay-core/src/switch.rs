//! The passthrough/transcode switch.
//!
//! A requested value is only staged. It becomes current when a unit that
//! satisfies the commit guard (by default a video key frame) is evaluated,
//! so the cut between paths always lands on a key frame. After the current
//! value moves, the after-switch listeners run. The post-switch filter only
//! follows on [`Switch::settle`], once the router has drained what it had
//! already handed to the old path. Output gating looks at both values, so
//! nothing is admitted while a cut is still settling.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::packet::UnitInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PathKind {
    Transcode = 0,
    Passthrough = 1,
}

impl PathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathKind::Transcode => "transcode",
            PathKind::Passthrough => "passthrough",
        }
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// One path at a time, chosen by the switch.
    #[default]
    Switched,
    /// Both paths always active, each on its own tracks.
    BothPipes,
}

pub type CommitGuard = Box<dyn Fn(&UnitInfo) -> bool + Send + Sync>;
pub type SwitchListener = Arc<dyn Fn(SwitchEvent) + Send + Sync>;

/// What a listener observes around one commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchEvent {
    Committed { current: PathKind, post: PathKind },
    PostUpdated { current: PathKind, post: PathKind },
}

struct State {
    current: PathKind,
    next: PathKind,
}

pub struct Switch {
    state: Mutex<State>,
    post: Mutex<PathKind>,
    guard: CommitGuard,
    listeners: Mutex<Vec<SwitchListener>>,
}

impl Switch {
    pub fn new(initial: PathKind) -> Self {
        Self::with_guard(initial, Box::new(|unit: &UnitInfo| unit.is_video_key_frame()))
    }

    pub fn with_guard(initial: PathKind, guard: CommitGuard) -> Self {
        Self {
            state: Mutex::new(State {
                current: initial,
                next: initial,
            }),
            post: Mutex::new(initial),
            guard,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Stages `value`; it takes effect at the next unit accepted by the guard.
    pub fn request_value(&self, value: PathKind) {
        let mut state = self.state.lock();
        if state.next != value {
            log::info!("switch to {} requested (current {})", value, state.current);
        }
        state.next = value;
    }

    pub fn current(&self) -> PathKind {
        self.state.lock().current
    }

    pub fn next_value(&self) -> PathKind {
        self.state.lock().next
    }

    pub fn post_value(&self) -> PathKind {
        *self.post.lock()
    }

    pub fn is_pending(&self) -> bool {
        let state = self.state.lock();
        state.current != state.next
    }

    pub fn on_switch(&self, listener: SwitchListener) {
        self.listeners.lock().push(listener);
    }

    /// Commits a staged value if `unit` satisfies the guard. Returns the new
    /// current value when a commit happened. The post filter keeps the old
    /// value until [`Switch::settle`].
    pub fn evaluate(&self, unit: &UnitInfo) -> Option<PathKind> {
        let committed = {
            let mut state = self.state.lock();
            if state.current == state.next || !(self.guard)(unit) {
                return None;
            }
            state.current = state.next;
            state.current
        };
        log::info!(
            "switched to {} at stream {} key frame",
            committed,
            unit.stream_index
        );

        let post = self.post_value();
        self.notify(SwitchEvent::Committed {
            current: committed,
            post,
        });
        Some(committed)
    }

    /// Moves the post filter onto the current value. Returns true when it
    /// changed.
    pub fn settle(&self) -> bool {
        let current = self.current();
        {
            let mut post = self.post.lock();
            if *post == current {
                return false;
            }
            *post = current;
        }
        log::debug!("post-switch filter settled on {}", current);
        self.notify(SwitchEvent::PostUpdated {
            current,
            post: current,
        });
        true
    }

    fn notify(&self, event: SwitchEvent) {
        let listeners: Vec<SwitchListener> = self.listeners.lock().clone();
        for listener in &listeners {
            listener(event);
        }
    }

    /// Whether output produced by `path` may reach the sink.
    pub fn output_allowed(&self, path: PathKind) -> bool {
        self.current() == path && self.post_value() == path
    }
}
