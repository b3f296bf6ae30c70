//! Element lifecycle
//!
//! `BufferQueue` wraps a [`FlowController`] with the Null/Ready/Paused/
//! Playing state machine. When an upstream [`ItemSource`] is attached the
//! element pulls from it on its own thread; when a downstream [`ItemSink`]
//! is attached it renders queued items on a second thread. Both threads
//! only exist while Playing and are joined on the way down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::QueueConfig;
use crate::error::{DownstreamFault, QueueError, Result};
use crate::events::QueueEvent;
use crate::flow::{FlowController, QueueStats};
use crate::item::StreamItem;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// No resources held
    Null,
    /// Configured, nothing flowing
    Ready,
    /// Accepting data, workers stopped
    Paused,
    /// Workers running
    Playing,
}

impl State {
    fn step_towards(self, target: State) -> State {
        use State::*;
        match (self, target) {
            (Null, _) => Ready,
            (Ready, Null) => Null,
            (Ready, _) => Paused,
            (Paused, Playing) => Playing,
            (Paused, _) => Ready,
            (Playing, _) => Paused,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Null => "NULL",
            State::Ready => "READY",
            State::Paused => "PAUSED",
            State::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// Upstream peer the element pulls from in pull mode
pub trait ItemSource: Send + 'static {
    /// Produce the next item. Errors end the input worker and are
    /// posted as `QueueEvent::Error`.
    fn pull(&mut self) -> anyhow::Result<StreamItem>;
}

impl<F> ItemSource for F
where
    F: FnMut() -> anyhow::Result<StreamItem> + Send + 'static,
{
    fn pull(&mut self) -> anyhow::Result<StreamItem> {
        self()
    }
}

/// Downstream peer queued items are rendered to
pub trait ItemSink: Send + 'static {
    /// Accept one item. A fault stops the output worker and fails the
    /// producer side of the queue.
    fn render(&mut self, item: StreamItem) -> std::result::Result<(), DownstreamFault>;
}

impl<F> ItemSink for F
where
    F: FnMut(StreamItem) -> std::result::Result<(), DownstreamFault> + Send + 'static,
{
    fn render(&mut self, item: StreamItem) -> std::result::Result<(), DownstreamFault> {
        self(item)
    }
}

struct Workers {
    source: Option<Box<dyn ItemSource>>,
    sink: Option<Box<dyn ItemSink>>,
    input: Option<JoinHandle<Box<dyn ItemSource>>>,
    output: Option<JoinHandle<Box<dyn ItemSink>>>,
}

/// Buffering queue element
pub struct BufferQueue {
    flow: Arc<FlowController>,
    status: Mutex<(State, Option<State>)>,
    workers: Mutex<Workers>,
    stop: Arc<AtomicBool>,
}

impl BufferQueue {
    /// Create an element in the Null state
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Result<Self> {
        let flow = FlowController::new(name, config)?;
        // Nothing flows before Ready -> Paused
        flow.deactivate();
        Ok(Self {
            flow: Arc::new(flow),
            status: Mutex::new((State::Null, None)),
            workers: Mutex::new(Workers {
                source: None,
                sink: None,
                input: None,
                output: None,
            }),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Attach an upstream source (pull mode)
    pub fn with_source(self, source: impl ItemSource) -> Self {
        self.workers.lock().source = Some(Box::new(source));
        self
    }

    /// Attach a downstream sink
    pub fn with_sink(self, sink: impl ItemSink) -> Self {
        self.workers.lock().sink = Some(Box::new(sink));
        self
    }

    /// Replace the upstream source; not allowed while Playing
    pub fn set_source(&self, source: impl ItemSource) -> Result<()> {
        self.ensure_not_playing("source")?;
        self.workers.lock().source = Some(Box::new(source));
        Ok(())
    }

    /// Replace the downstream sink; not allowed while Playing
    pub fn set_sink(&self, sink: impl ItemSink) -> Result<()> {
        self.ensure_not_playing("sink")?;
        self.workers.lock().sink = Some(Box::new(sink));
        Ok(())
    }

    fn ensure_not_playing(&self, what: &str) -> Result<()> {
        let (current, pending) = self.state();
        if current == State::Playing || pending == Some(State::Playing) {
            return Err(QueueError::StateChange {
                from: current.to_string(),
                to: format!("{} replaced", what),
            });
        }
        Ok(())
    }

    /// Element name
    pub fn name(&self) -> &str {
        self.flow.name()
    }

    /// Underlying flow controller
    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    /// Current state and the target of an ongoing transition
    pub fn state(&self) -> (State, Option<State>) {
        *self.status.lock()
    }

    /// Push-mode write
    pub fn push(&self, item: StreamItem) -> Result<()> {
        self.flow.push(item)
    }

    /// Pull-mode read
    pub fn range_read(&self, offset: u64, length: u64) -> Result<Bytes> {
        self.flow.range_read(offset, length)
    }

    /// Subscribe to queue notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.flow.subscribe()
    }

    /// Bookkeeping snapshot
    pub fn stats(&self) -> QueueStats {
        self.flow.stats()
    }

    /// Walk the state machine to `target`, one transition at a time
    pub fn set_state(&self, target: State) -> Result<()> {
        // Serializes transitions
        let mut workers = self.workers.lock();

        loop {
            let current = self.status.lock().0;
            if current == target {
                break;
            }
            let next = current.step_towards(target);
            self.status.lock().1 = Some(target);

            tracing::debug!(queue = %self.name(), from = %current, to = %next, "State change");

            if let Err(err) = self.transition(&mut workers, current, next) {
                tracing::error!(
                    queue = %self.name(),
                    from = %current,
                    to = %next,
                    error = %err,
                    "State change failed"
                );
                self.status.lock().1 = None;
                return Err(err);
            }
            *self.status.lock() = (next, Some(target));
        }

        self.status.lock().1 = None;
        Ok(())
    }

    fn transition(&self, workers: &mut Workers, from: State, to: State) -> Result<()> {
        match (from, to) {
            (State::Null, State::Ready) => Ok(()),
            (State::Ready, State::Paused) => {
                self.flow.activate();
                Ok(())
            }
            (State::Paused, State::Playing) => {
                let started = self.start_workers(workers);
                if started.is_err() {
                    self.stop_workers(workers);
                    self.flow.resume();
                }
                started
            }
            (State::Playing, State::Paused) => {
                self.stop_workers(workers);
                self.flow.resume();
                Ok(())
            }
            (State::Paused, State::Ready) => {
                self.flow.deactivate();
                self.flow.shutdown()
            }
            (State::Ready, State::Null) => self.flow.shutdown(),
            (from, to) => Err(QueueError::StateChange {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    fn start_workers(&self, workers: &mut Workers) -> Result<()> {
        self.stop.store(false, Ordering::SeqCst);

        if let Some(source) = workers.source.take() {
            let flow = Arc::clone(&self.flow);
            let stop = Arc::clone(&self.stop);
            let handle = std::thread::Builder::new()
                .name(format!("{}-input", self.name()))
                .spawn(move || input_loop(flow, stop, source))?;
            workers.input = Some(handle);
        }

        if let Some(sink) = workers.sink.take() {
            let flow = Arc::clone(&self.flow);
            let stop = Arc::clone(&self.stop);
            let handle = std::thread::Builder::new()
                .name(format!("{}-output", self.name()))
                .spawn(move || output_loop(flow, stop, sink))?;
            workers.output = Some(handle);
        }

        Ok(())
    }

    fn stop_workers(&self, workers: &mut Workers) {
        self.stop.store(true, Ordering::SeqCst);
        self.flow.deactivate();

        if let Some(handle) = workers.input.take() {
            match handle.join() {
                Ok(source) => workers.source = Some(source),
                Err(_) => tracing::error!(queue = %self.name(), "Input worker panicked"),
            }
        }
        if let Some(handle) = workers.output.take() {
            match handle.join() {
                Ok(sink) => workers.sink = Some(sink),
                Err(_) => tracing::error!(queue = %self.name(), "Output worker panicked"),
            }
        }
    }
}

impl fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        if let Err(e) = self.set_state(State::Null) {
            tracing::warn!(queue = %self.name(), error = %e, "Failed to shut down queue");
        }
    }
}

/// Pull from upstream and feed the queue until EOS, an error or stop
fn input_loop(
    flow: Arc<FlowController>,
    stop: Arc<AtomicBool>,
    mut source: Box<dyn ItemSource>,
) -> Box<dyn ItemSource> {
    tracing::debug!(queue = %flow.name(), "Input worker started");

    while !stop.load(Ordering::SeqCst) {
        let item = match source.pull() {
            Ok(item) => item,
            Err(err) => {
                let err = QueueError::from(err);
                tracing::error!(queue = %flow.name(), error = %err, "Upstream failed");
                flow.events().post(QueueEvent::Error {
                    message: err.to_string(),
                });
                break;
            }
        };
        let is_eos = item.is_eos();

        let generation = flow.generation();
        match flow.push(item) {
            Ok(()) if is_eos => break,
            Ok(()) => {}
            Err(QueueError::Flushed) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                flow.wait_resumable(generation);
            }
            Err(err) => {
                tracing::debug!(queue = %flow.name(), error = %err, "Input worker stopping");
                break;
            }
        }
    }

    tracing::debug!(queue = %flow.name(), "Input worker stopped");
    source
}

/// Pop from the queue and render downstream until a fault or stop
fn output_loop(
    flow: Arc<FlowController>,
    stop: Arc<AtomicBool>,
    mut sink: Box<dyn ItemSink>,
) -> Box<dyn ItemSink> {
    tracing::debug!(queue = %flow.name(), "Output worker started");

    while !stop.load(Ordering::SeqCst) {
        let generation = flow.generation();
        match flow.pop() {
            Ok(item) => {
                if let Err(fault) = sink.render(item) {
                    flow.signal_downstream_error(fault);
                    break;
                }
            }
            Err(QueueError::Eos) | Err(QueueError::Flushed) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                flow.wait_resumable(generation);
            }
            Err(err) => {
                tracing::debug!(queue = %flow.name(), error = %err, "Output worker stopping");
                break;
            }
        }
    }

    tracing::debug!(queue = %flow.name(), "Output worker stopped");
    sink
}
