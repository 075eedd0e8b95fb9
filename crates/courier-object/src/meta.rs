// Introspection records for a service's methods and events.
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMethod {
    pub id: u32,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEvent {
    pub id: u32,
    pub name: String,
    pub signature: String,
}

/// Name and signature tables for one service object.
#[derive(Debug, Clone, Default)]
pub struct MetaObject {
    name: String,
    methods: HashMap<u32, MetaMethod>,
    events: HashMap<u32, MetaEvent>,
}

impl MetaObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            events: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_method(&mut self, id: u32, name: impl Into<String>, signature: impl Into<String>) {
        self.methods.insert(
            id,
            MetaMethod {
                id,
                name: name.into(),
                signature: signature.into(),
            },
        );
    }

    pub fn add_event(&mut self, id: u32, name: impl Into<String>, signature: impl Into<String>) {
        self.events.insert(
            id,
            MetaEvent {
                id,
                name: name.into(),
                signature: signature.into(),
            },
        );
    }

    pub fn method(&self, id: u32) -> Option<&MetaMethod> {
        self.methods.get(&id)
    }

    pub fn event(&self, id: u32) -> Option<&MetaEvent> {
        self.events.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_lookup_by_id() {
        let mut meta = MetaObject::new("echo");
        meta.add_method(7, "echo", "echo::(b)->b");
        assert_eq!(meta.method(7).expect("method").signature, "echo::(b)->b");
        assert!(meta.method(8).is_none());
        assert_eq!(meta.name(), "echo");
    }
}
