use std::sync::Arc;

use tradutor::{
    admission::AdmissionService, queue::Broker, status::StatusService, store::JobStore,
    supervisor::ConnectionSupervisor,
};

/// Shared state handed to every request handler.
pub struct AppState<S: JobStore, B: Broker> {
    pub admission: AdmissionService<S, B>,
    pub status: StatusService<S>,
    pub supervisor: Arc<ConnectionSupervisor<B>>,
}

impl<S: JobStore, B: Broker> Clone for AppState<S, B> {
    fn clone(&self) -> Self {
        Self {
            admission: self.admission.clone(),
            status: self.status.clone(),
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<S: JobStore, B: Broker> AppState<S, B> {
    pub fn new(store: Arc<S>, supervisor: Arc<ConnectionSupervisor<B>>) -> Self {
        Self {
            admission: AdmissionService::new(store.clone(), supervisor.clone()),
            status: StatusService::new(store),
            supervisor,
        }
    }
}
