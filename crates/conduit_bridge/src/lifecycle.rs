//! Bridge Lifecycle
//!
//! State flags of one bridge generation and the events it publishes.
//!
//! ```text
//! Uninitialized → Loading → Ready → Invalidating → Invalid
//!                    └──────────────────────────────↗ (load failure)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Phase of a bridge generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LifecyclePhase {
    Uninitialized = 0,
    Loading = 1,
    Ready = 2,
    Invalidating = 3,
    Invalid = 4,
}

impl LifecyclePhase {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Loading,
            2 => Self::Ready,
            3 => Self::Invalidating,
            _ => Self::Invalid,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Invalidating => write!(f, "invalidating"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Why a generation is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidateReason {
    /// The host is going away
    Unmounted,
    /// A fresh generation replaces this one
    Reload,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge State
// ─────────────────────────────────────────────────────────────────────────────

/// State flags of one generation.
///
/// Written only by the lifecycle, readable from any context. A reader racing
/// a transition may observe the old value.
#[derive(Debug)]
pub struct BridgeState {
    valid: AtomicBool,
    loading: AtomicBool,
    error_occurred: AtomicBool,
    phase: AtomicU8,
    torn_down: AtomicBool,
}

impl Default for BridgeState {
    fn default() -> Self {
        Self {
            valid: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            error_occurred: AtomicBool::new(false),
            phase: AtomicU8::new(LifecyclePhase::Uninitialized as u8),
            torn_down: AtomicBool::new(false),
        }
    }
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn has_errored(&self) -> bool {
        self.error_occurred.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// `Uninitialized → Loading`. Returns false if the generation already started.
    pub fn begin_loading(&self) -> bool {
        if self
            .phase
            .compare_exchange(
                LifecyclePhase::Uninitialized as u8,
                LifecyclePhase::Loading as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        self.valid.store(true, Ordering::SeqCst);
        self.loading.store(true, Ordering::SeqCst);
        true
    }

    /// `Loading → Ready`.
    pub fn finish_loading(&self) {
        self.loading.store(false, Ordering::SeqCst);
        if self.is_valid() {
            self.set_phase(LifecyclePhase::Ready);
        }
    }

    /// Loading failed; the generation is terminal.
    pub fn fail_loading(&self) {
        self.error_occurred.store(true, Ordering::SeqCst);
        self.valid.store(false, Ordering::SeqCst);
        self.loading.store(false, Ordering::SeqCst);
        self.set_phase(LifecyclePhase::Invalid);
    }

    /// Record a fatal error without changing the phase.
    pub fn mark_errored(&self) {
        self.error_occurred.store(true, Ordering::SeqCst);
    }

    /// Start teardown. Returns false if teardown already started, so exactly
    /// one caller proceeds.
    pub fn begin_invalidate(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.valid.store(false, Ordering::SeqCst);
        self.loading.store(false, Ordering::SeqCst);
        self.set_phase(LifecyclePhase::Invalidating);
        true
    }

    /// Teardown finished.
    pub fn finish_invalidate(&self) {
        self.set_phase(LifecyclePhase::Invalid);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BridgeEventKind {
    WillStartLoading,
    DidLoad,
    DidFailToLoad(String),
    WillInvalidate(InvalidateReason),
    DidInvalidate,
    Fatal(String),
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Generation that emitted the event
    pub generation: Uuid,
    pub kind: BridgeEventKind,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl BridgeEvent {
    pub fn new(generation: Uuid, kind: BridgeEventKind) -> Self {
        Self {
            generation,
            kind,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Publishes lifecycle events to subscribers.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, generation: Uuid, kind: BridgeEventKind) {
        tracing::trace!(generation = %generation, ?kind, "Bridge event");
        let _ = self.tx.send(BridgeEvent::new(generation, kind));
    }
}
