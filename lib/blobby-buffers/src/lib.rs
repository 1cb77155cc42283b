//! Concurrency primitives shared by the primary and replica state machines: a timer facility, a
//! bounded-parallelism work queue, a sliding-window back-off counter, and a priority-ordered
//! waiting list for idle primaries.

pub mod backoff;
pub mod delay_queue;
pub mod waiting_list;
pub mod work_queue;

pub use backoff::BackOff;
pub use delay_queue::{DelayQueue, Token as DelayToken};
pub use waiting_list::{Prioritized, WaitingList};
pub use work_queue::WorkQueue;
