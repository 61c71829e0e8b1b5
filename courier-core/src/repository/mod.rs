pub mod registration;

pub use registration::{MemoryRegistrationStore, PgRegistrationStore, RegistrationStore};
