//! Conversation-level domain: repositories, commands, and sessions.

pub mod command;
pub mod repository;
pub mod session;

pub use command::{ArgumentKind, Command, classify};
pub use repository::{Repository, RepositoryCatalog, parse_repositories};
pub use session::{
    ExecutionPolicy, Lookup, Mode, Rejection, RunGuard, RunTicket, Session, SessionRegistry,
    SessionState,
};
