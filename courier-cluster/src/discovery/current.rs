//! This process's own registration
//!
//! Set when the process registers itself through
//! [`ServiceDiscoveryClient`](super::ServiceDiscoveryClient) and cleared when
//! it deregisters. Everything else in the crate is passed explicitly.

use parking_lot::RwLock;

use courier_core::ServiceRegistration;

static CURRENT: RwLock<Option<ServiceRegistration>> = parking_lot::const_rwlock(None);

/// Install (or refresh) the registration, returning the one it replaced
pub fn init(registration: ServiceRegistration) -> Option<ServiceRegistration> {
    CURRENT.write().replace(registration)
}

pub fn teardown() -> Option<ServiceRegistration> {
    CURRENT.write().take()
}

#[must_use]
pub fn current_registration() -> Option<ServiceRegistration> {
    CURRENT.read().clone()
}

#[must_use]
pub fn current_registration_id() -> Option<String> {
    CURRENT.read().as_ref().map(|registration| registration.id.clone())
}
