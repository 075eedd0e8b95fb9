// Server-side service object: a method-handler table plus the shared event
// registry, with queued invocations running on a worker pool.
use bytes::Bytes;
use courier_common::{Error, Promise, Result};
use courier_pool::WorkerPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{CallType, EventRegistry, MetaObject, ServiceObject, Subscriber};

pub type MethodHandler = Arc<dyn Fn(Bytes) -> Result<Bytes> + Send + Sync>;

pub struct LocalObject {
    meta: MetaObject,
    methods: HashMap<u32, MethodHandler>,
    events: EventRegistry,
    pool: Arc<WorkerPool>,
}

impl LocalObject {
    pub fn builder(name: impl Into<String>) -> LocalObjectBuilder {
        LocalObjectBuilder {
            meta: MetaObject::new(name),
            methods: HashMap::new(),
        }
    }

    pub fn subscriber_count(&self, event: u32) -> usize {
        self.events.subscriber_count(event)
    }
}

pub struct LocalObjectBuilder {
    meta: MetaObject,
    methods: HashMap<u32, MethodHandler>,
}

impl LocalObjectBuilder {
    pub fn method<F>(
        mut self,
        id: u32,
        name: impl Into<String>,
        signature: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Bytes) -> Result<Bytes> + Send + Sync + 'static,
    {
        self.meta.add_method(id, name, signature);
        self.methods.insert(id, Arc::new(handler));
        self
    }

    pub fn event(mut self, id: u32, name: impl Into<String>, signature: impl Into<String>) -> Self {
        self.meta.add_event(id, name, signature);
        self
    }

    pub fn build(self, pool: Arc<WorkerPool>) -> Arc<LocalObject> {
        Arc::new(LocalObject {
            meta: self.meta,
            methods: self.methods,
            events: EventRegistry::new(),
            pool,
        })
    }
}

fn run_handler(handler: &MethodHandler, params: Bytes, completion: &Promise<Bytes>) {
    match handler(params) {
        Ok(value) => completion.set_value(value),
        Err(err) => completion.set_error(err),
    }
}

impl ServiceObject for LocalObject {
    fn meta_object(&self) -> &MetaObject {
        &self.meta
    }

    fn meta_call(&self, function: u32, params: Bytes, completion: Promise<Bytes>, call: CallType) {
        let Some(handler) = self.methods.get(&function).cloned() else {
            tracing::error!(object = self.meta.name(), function, "unknown method id");
            completion.set_error(Error::MethodUnknown(function));
            return;
        };
        match call {
            CallType::Direct => run_handler(&handler, params, &completion),
            CallType::Queued => {
                let queued = completion.clone();
                if !self
                    .pool
                    .schedule(move || run_handler(&handler, params, &queued))
                {
                    completion.set_error(Error::PoolClosed);
                }
            }
        }
    }

    fn meta_emit(&self, function: u32, params: Bytes) {
        self.events.trigger(function, &params);
    }

    fn connect(&self, event: u32, subscriber: Subscriber) -> u32 {
        self.events.connect(event, subscriber)
    }

    fn disconnect(&self, link_id: u32) -> bool {
        self.events.disconnect(link_id)
    }
}
