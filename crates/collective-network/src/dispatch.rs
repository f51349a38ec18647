//! Packet dispatch -- route each inbound packet to the processor registered
//! for its type.
//!
//! Two strategies share the same type -> processor table:
//!   - [`BlockingDispatcher`] runs the processor on the caller and returns when
//!     it is done. Packets of one type keep their delivery order. A panicking
//!     processor unwinds into the caller.
//!   - [`RoutineDispatcher`] runs each packet on tokio's blocking pool and
//!     returns at once. No ordering between packets. A panic stays inside its
//!     task and is logged there, since nothing joins the task.
//!
//! Registering a processor for a type that already has one replaces it; there
//! is no fan-out.

use collective_protocol::{Packet, PacketTypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no processor attached to message type {0}")]
    NoProcessor(PacketTypeId),
    #[error("routine dispatcher needs a tokio runtime")]
    NoRuntime,
}

/// Anything that handles packets of one or more types.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, packet: Packet);
}

/// Adapter turning a closure into a [`Processor`].
pub struct FnProcessor<F>(pub F);

impl<F> Processor for FnProcessor<F>
where
    F: Fn(Packet) + Send + Sync + 'static,
{
    fn process(&self, packet: Packet) {
        (self.0)(packet)
    }
}

pub trait Dispatcher: Send + Sync {
    /// Route all packets of each of `msg_types` to `processor`.
    fn register_processor(&self, processor: Arc<dyn Processor>, msg_types: &[PacketTypeId]);

    /// Route packets of `msg_type` to a plain function.
    fn register_processor_fn(
        &self,
        msg_type: PacketTypeId,
        f: Box<dyn Fn(Packet) + Send + Sync + 'static>,
    ) {
        self.register_processor(Arc::new(FnProcessor(f)), &[msg_type]);
    }

    /// Hand `packet` to its processor. Fails when none is registered.
    fn dispatch(&self, packet: Packet) -> Result<(), DispatchError>;
}

/// Type -> processor table shared by both strategies.
#[derive(Default)]
struct ProcessorTable {
    procs: Mutex<HashMap<PacketTypeId, Arc<dyn Processor>>>,
}

impl ProcessorTable {
    fn register(&self, processor: Arc<dyn Processor>, msg_types: &[PacketTypeId]) {
        let mut procs = self.procs.lock().unwrap_or_else(|e| e.into_inner());
        for msg_type in msg_types {
            if procs.insert(*msg_type, processor.clone()).is_some() {
                tracing::debug!(%msg_type, "dispatcher: processor replaced");
            }
        }
    }

    /// The lock is released before the processor runs.
    fn lookup(&self, msg_type: PacketTypeId) -> Result<Arc<dyn Processor>, DispatchError> {
        self.procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&msg_type)
            .cloned()
            .ok_or(DispatchError::NoProcessor(msg_type))
    }
}

/// Calls the processor synchronously on the dispatching thread.
#[derive(Default)]
pub struct BlockingDispatcher {
    table: ProcessorTable,
}

impl BlockingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for BlockingDispatcher {
    fn register_processor(&self, processor: Arc<dyn Processor>, msg_types: &[PacketTypeId]) {
        self.table.register(processor, msg_types);
    }

    fn dispatch(&self, packet: Packet) -> Result<(), DispatchError> {
        let processor = self.table.lookup(packet.msg_type)?;
        processor.process(packet);
        Ok(())
    }
}

/// Spawns one blocking-pool task per packet on the given runtime.
pub struct RoutineDispatcher {
    table: ProcessorTable,
    handle: tokio::runtime::Handle,
}

impl RoutineDispatcher {
    /// Bind to the runtime of the calling context.
    pub fn new() -> Result<Self, DispatchError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        Ok(Self::with_handle(handle))
    }

    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self {
            table: ProcessorTable::default(),
            handle,
        }
    }
}

impl Dispatcher for RoutineDispatcher {
    fn register_processor(&self, processor: Arc<dyn Processor>, msg_types: &[PacketTypeId]) {
        self.table.register(processor, msg_types);
    }

    fn dispatch(&self, packet: Packet) -> Result<(), DispatchError> {
        let processor = self.table.lookup(packet.msg_type)?;
        let msg_type = packet.msg_type;
        let sender = packet.sender.address.clone();
        // Processors are synchronous and may block; keep them off the async
        // workers.
        self.handle.spawn_blocking(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| processor.process(packet)));
            if outcome.is_err() {
                tracing::error!(
                    %msg_type,
                    sender = %sender,
                    "dispatcher: processor panicked, packet dropped"
                );
            }
        });
        Ok(())
    }
}

/// Which dispatch strategy a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherKind {
    #[default]
    Blocking,
    Routine,
}

pub fn build_dispatcher(kind: DispatcherKind) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    Ok(match kind {
        DispatcherKind::Blocking => Arc::new(BlockingDispatcher::new()),
        DispatcherKind::Routine => Arc::new(RoutineDispatcher::new()?),
    })
}
