// A session ties a broker to its directory client and carries the process
// identity used in registration records.
use std::sync::Arc;
use uuid::Uuid;

use crate::Directory;

pub struct Session {
    directory: Arc<dyn Directory>,
    machine_id: String,
}

impl Session {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            machine_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalDirectory;

    #[test]
    fn sessions_get_distinct_machine_ids() {
        let directory = Arc::new(LocalDirectory::new());
        let a = Session::new(directory.clone());
        let b = Session::new(directory);
        assert_ne!(a.machine_id(), b.machine_id());
    }
}
