//! The task execution engine.
//!
//! - `dispatcher` routes chat events to control commands or Runs
//! - `gate` bounds concurrent Runs per repository
//! - `driver` runs the generator once, with a deadline and cancellation
//! - `generator` is the code generator seam and its CLI adapter
//! - `progress` turns the event stream into chat updates
//! - `prompt` builds the outbound instructions

pub mod dispatcher;
pub mod driver;
pub mod gate;
pub mod generator;
pub mod progress;
pub mod prompt;

pub use dispatcher::{Dispatch, Dispatcher, DispatcherSettings};
pub use driver::{DriverSettings, ExecutionDriver, RunOutcome, RunRequest};
pub use gate::RepositorySlots;
pub use generator::{ClaudeCli, CodeGenerator};
pub use progress::{DeliveryMode, ProgressSettings};
