mod instance_lock;
mod single_flight;

pub use instance_lock::{InstanceLock, InstanceLockGuard};
pub use single_flight::{FlightGuard, SingleFlight};
