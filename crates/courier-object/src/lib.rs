// Service object model: the interface the broker and clients dispatch
// against, plus the event subscriber registry shared by both sides.
use bytes::Bytes;
use courier_common::Promise;
use std::sync::Arc;

pub mod events;
pub mod local;
pub mod meta;

pub use events::EventRegistry;
pub use local::{LocalObject, LocalObjectBuilder};
pub use meta::{MetaEvent, MetaMethod, MetaObject};

/// How a method invocation may be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// Run on the caller's thread.
    Direct,
    /// Run off the caller's thread, on the object's worker pool. Required
    /// for invocations made from transport callbacks.
    Queued,
}

/// An event subscriber callback.
pub type Subscriber = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A named, id-addressed collection of methods and events.
pub trait ServiceObject: Send + Sync {
    fn meta_object(&self) -> &MetaObject;

    /// Invoke method `function` with `params`; `completion` resolves exactly
    /// once with the result.
    fn meta_call(&self, function: u32, params: Bytes, completion: Promise<Bytes>, call: CallType);

    /// Trigger event `function` with `params` for local subscribers.
    fn meta_emit(&self, function: u32, params: Bytes);

    /// Subscribe to an event; returns a process-unique link id.
    fn connect(&self, event: u32, subscriber: Subscriber) -> u32;

    /// Drop one subscription. Returns false when the link id is unknown.
    fn disconnect(&self, link_id: u32) -> bool;
}
