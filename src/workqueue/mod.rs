// Typed priority work queue, parked requests and steal-based rebalancing

pub mod balance;
pub mod queue;
pub mod requests;

pub use balance::{Balancer, LoadReport};
pub use queue::{WorkQueue, WorkType, WorkUnit, NOTIFICATION_PRIORITY};
pub use requests::{ParkedRequest, RequestQueue};
