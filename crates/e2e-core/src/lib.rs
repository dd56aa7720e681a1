pub mod aggregate;
pub mod clock;
pub mod collector;
pub mod config;
pub mod executor;
pub mod poller;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod store;

pub use aggregate::*;
pub use clock::*;
pub use collector::*;
pub use config::*;
pub use executor::*;
pub use poller::*;
pub use runner::*;
pub use scheduler::*;
pub use sink::*;
pub use store::*;
