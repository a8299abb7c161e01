//! Human intervention channel: a stdin listener, a one-slot pending message,
//! and an interrupt flag the agent invocation polls.
//!
//! The listener thread only ever sets flags and stores text. Everything with
//! consequences (killing the agent, prompting, injecting into the next
//! prompt) happens on the loop thread, so iteration ordering stays
//! deterministic.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// A queued human message, delivered into the next prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervention {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Intervention {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct AwaitSlot {
    line: Mutex<Option<String>>,
    ready: Condvar,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<Option<Intervention>>,
    interrupt: AtomicBool,
    /// True while an agent invocation is in flight; input then interrupts
    /// instead of queueing silently.
    busy: AtomicBool,
    /// When set, the next stdin line is routed to a blocked `request_line`
    /// call instead of being treated as intervention input.
    capture_next: AtomicBool,
    slot: AwaitSlot,
}

/// Shared handle between the stdin listener thread and the loop.
#[derive(Clone, Default)]
pub struct InterventionChannel {
    inner: Arc<Inner>,
}

impl InterventionChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the pending message, if any. At-most-once delivery.
    pub fn take_pending(&self) -> Option<Intervention> {
        self.inner.pending.lock().ok()?.take()
    }

    pub fn has_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    /// Store a message, replacing any not-yet-delivered one.
    pub fn store(&self, intervention: Intervention) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            if pending.is_some() {
                warn!("replacing undelivered intervention message");
            }
            *pending = Some(intervention);
        }
    }

    pub fn raise_interrupt(&self) {
        self.inner.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_raised(&self) -> bool {
        self.inner.interrupt.load(Ordering::SeqCst)
    }

    pub fn clear_interrupt(&self) {
        self.inner.interrupt.store(false, Ordering::SeqCst);
    }

    /// Mark whether an agent invocation is in flight.
    pub fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::SeqCst);
    }

    /// Feed one line of input, as the stdin listener would.
    ///
    /// Lines starting with `!` are interventions: `!<msg>` stores the message
    /// immediately, a bare `!` only raises the interrupt so the loop can
    /// prompt for the message once the agent has stopped. While an agent is
    /// busy, any intervention also raises the interrupt.
    pub fn feed_line(&self, line: &str) {
        if self.inner.capture_next.swap(false, Ordering::SeqCst) {
            if let Ok(mut slot) = self.inner.slot.line.lock() {
                *slot = Some(line.to_string());
                self.inner.slot.ready.notify_one();
            }
            return;
        }
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix('!') else {
            debug!(line = %trimmed, "ignoring non-intervention input");
            return;
        };
        let message = rest.trim();
        if !message.is_empty() {
            info!("intervention message queued");
            self.store(Intervention::new(message));
        }
        if self.inner.busy.load(Ordering::SeqCst) || message.is_empty() {
            self.raise_interrupt();
        }
    }

    /// Print `prompt` and block until the listener hands over the next line.
    ///
    /// Used for human-in-the-loop confirmation and for collecting the message
    /// after a bare-`!` interrupt.
    pub fn request_line(&self, prompt: &str) -> Result<String> {
        print!("{prompt}");
        std::io::stdout().flush().context("flush prompt")?;
        self.inner.capture_next.store(true, Ordering::SeqCst);
        let mut slot = self
            .inner
            .slot
            .line
            .lock()
            .map_err(|_| anyhow::anyhow!("await slot poisoned"))?;
        while slot.is_none() {
            slot = self
                .inner
                .slot
                .ready
                .wait(slot)
                .map_err(|_| anyhow::anyhow!("await slot poisoned"))?;
        }
        Ok(slot.take().unwrap_or_default())
    }

    /// Spawn the stdin listener. Returns immediately; the thread lives for
    /// the process lifetime and exits when stdin closes.
    pub fn spawn_stdin_listener(&self) {
        let channel = self.clone();
        thread::Builder::new()
            .name("stdin-listener".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    match line {
                        Ok(line) => channel.feed_line(&line),
                        Err(e) => {
                            warn!(err = %e, "stdin listener stopping");
                            break;
                        }
                    }
                }
                debug!("stdin closed, listener exiting");
            })
            .expect("spawn stdin listener");
    }
}
