/// Small shared helpers
pub mod backoff;
pub mod event_bus;

pub use backoff::Backoff;
pub use event_bus::EventBus;
