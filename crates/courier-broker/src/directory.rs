// The service directory is an external collaborator; the broker only sees
// this narrow interface. `LocalDirectory` is an in-process stand-in used by
// tests and single-process deployments.
use courier_common::{Error, Future, ServiceInfo};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

pub trait Directory: Send + Sync {
    /// Ask the directory for a service id; the future resolves with the
    /// assigned id.
    fn register_service(&self, info: ServiceInfo) -> Future<u32>;

    fn unregister_service(&self, id: u32) -> Future<()>;

    /// Acknowledge that the service is ready to take calls.
    fn service_ready(&self, id: u32);
}

struct DirectoryState {
    next_id: u32,
    services: HashMap<u32, ServiceInfo>,
    ready: HashSet<u32>,
}

pub struct LocalDirectory {
    state: Mutex<DirectoryState>,
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                // Service id 0 is the reserved control service.
                next_id: 1,
                services: HashMap::new(),
                ready: HashSet::new(),
            }),
        }
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state.lock().services.values().cloned().collect()
    }

    pub fn service(&self, name: &str) -> Option<ServiceInfo> {
        self.state
            .lock()
            .services
            .values()
            .find(|info| info.name == name)
            .cloned()
    }

    pub fn is_ready(&self, id: u32) -> bool {
        self.state.lock().ready.contains(&id)
    }
}

impl Directory for LocalDirectory {
    fn register_service(&self, mut info: ServiceInfo) -> Future<u32> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        info.service_id = id;
        tracing::debug!(id, name = %info.name, "service registered");
        state.services.insert(id, info);
        Future::from_value(id)
    }

    fn unregister_service(&self, id: u32) -> Future<()> {
        let mut state = self.state.lock();
        state.ready.remove(&id);
        match state.services.remove(&id) {
            Some(_) => Future::from_value(()),
            None => Future::from_error(Error::ServiceUnknown(id)),
        }
    }

    fn service_ready(&self, id: u32) {
        let mut state = self.state.lock();
        if state.services.contains_key(&id) {
            state.ready.insert(id);
        } else {
            tracing::warn!(id, "ready ack for unknown service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_assigns_monotonic_ids() {
        let directory = LocalDirectory::new();
        let first = directory
            .register_service(ServiceInfo::new("a", "m"))
            .wait()
            .expect("id");
        let second = directory
            .register_service(ServiceInfo::new("b", "m"))
            .wait()
            .expect("id");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(directory.services().len(), 2);
        assert_eq!(directory.service("a").expect("info").service_id, 1);
    }

    #[test]
    fn ready_tracks_registered_services_only() {
        let directory = LocalDirectory::new();
        let id = directory
            .register_service(ServiceInfo::new("a", "m"))
            .wait()
            .expect("id");
        assert!(!directory.is_ready(id));
        directory.service_ready(id);
        assert!(directory.is_ready(id));
        directory.service_ready(42);
        assert!(!directory.is_ready(42));
    }

    #[test]
    fn unregister_unknown_id_fails() {
        let directory = LocalDirectory::new();
        assert!(matches!(
            directory.unregister_service(9).wait(),
            Err(Error::ServiceUnknown(9))
        ));
    }
}
