use std::sync::{Arc, Mutex};
use tokio::{sync::oneshot, task};

use super::event::Event;
use super::sink::{EventSink, StdOutSink};

/// Fan-out point between event producers and sinks.
///
/// Producers emit through cheap cloned senders; delivery happens either on
/// a spawned listener task ([`EventBus::listen_for_events`]) or explicitly
/// ([`EventBus::drain_to_sinks`]) when a run wants deterministic ordering.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
    listener: Mutex<Option<ListenerHandle>>,
}

struct ListenerHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sinks(vec![Box::new(StdOutSink::default())])
    }
}

impl EventBus {
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            tx,
            rx,
            listener: Mutex::new(None),
        }
    }

    /// Clone of the producer side; every engine subsystem holds one.
    pub fn get_sender(&self) -> flume::Sender<Event> {
        self.tx.clone()
    }

    /// Spawn the background delivery task. Idempotent; a second call while
    /// a listener is running does nothing.
    pub fn listen_for_events(&self) {
        let mut guard = self.listener.lock().expect("listener poisoned");
        if guard.is_some() {
            return;
        }

        let rx = self.rx.clone();
        let sinks = self.sinks.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = rx.recv_async() => match recv {
                        // Every sender dropped; nothing left to deliver.
                        Err(_) => break,
                        Ok(event) => deliver(&sinks, &event),
                    }
                }
            }
        });

        *guard = Some(ListenerHandle {
            shutdown_tx,
            handle,
        });
    }

    /// Push everything currently queued straight into the sinks, without a
    /// background listener. Used by deterministic single-threaded runs.
    pub fn drain_to_sinks(&self) {
        while let Ok(event) = self.rx.try_recv() {
            deliver(&self.sinks, &event);
        }
    }
}

fn deliver(sinks: &Mutex<Vec<Box<dyn EventSink>>>, event: &Event) {
    let mut guard = sinks.lock().expect("sinks poisoned");
    for sink in guard.iter_mut() {
        if let Err(e) = sink.handle(event) {
            eprintln!("event sink error: {e}");
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(listener) = guard.take() {
                let _ = listener.shutdown_tx.send(());
                listener.handle.abort();
            }
        }
    }
}
