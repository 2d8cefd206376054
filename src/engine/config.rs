use crate::events::sink::{EventSink, MemorySink, StdOutSink};
use crate::events::EventBus;

/// Tunables for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Conditional-update attempts before any engine-owned CAS loop
    /// (gates, timeouts, interrupts) surfaces contention.
    pub cas_attempts: u32,
    /// Transport publish attempts before a dispatch failure concludes the
    /// node as FAILED (retryable).
    pub publish_attempts: u32,
    /// Retry budget applied to nodes that do not declare their own.
    pub default_retry_budget: u32,
    /// Worker tasks draining the command queue when run concurrently.
    pub worker_concurrency: usize,
    pub event_bus: EventBusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cas_attempts: 5,
            publish_attempts: 3,
            default_retry_budget: 0,
            worker_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_memory_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_memory_sink())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

/// Which sinks the engine wires into its event bus.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub sinks: Vec<SinkConfig>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            sinks: vec![SinkConfig::StdOut],
        }
    }
}

impl EventBusConfig {
    #[must_use]
    pub fn with_stdout_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_memory_sink() -> Self {
        Self {
            sinks: vec![SinkConfig::Memory],
        }
    }

    /// Build the bus plus a handle to the memory sink when one is configured.
    pub(crate) fn build(&self) -> (EventBus, Option<MemorySink>) {
        let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
        let mut memory = None;
        for sink in &self.sinks {
            match sink {
                SinkConfig::StdOut => sinks.push(Box::new(StdOutSink::default())),
                SinkConfig::Memory => {
                    let m = MemorySink::new();
                    memory = Some(m.clone());
                    sinks.push(Box::new(m));
                }
            }
        }
        (EventBus::with_sinks(sinks), memory)
    }
}
