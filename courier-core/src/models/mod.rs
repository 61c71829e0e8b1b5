pub mod registration;

pub use registration::{ServiceDescriptor, ServiceQuery, ServiceRegistration, ServiceStatus};
