//! mailcache - asynchronous mailbox workers and a client-side message cache
//!
//! The interactive side talks to independently paced mailbox backends through
//! a [`worker`] channel pair: it posts [`protocol::Action`]s, the backend answers
//! with [`protocol::Event`]s that name the action they respond to. The
//! [`store::MessageStore`] turns those events into a cached, incrementally
//! updated view of one directory, and [`account::Account`] ties a backend, its
//! directories and their stores together.

pub mod account;
pub mod backend;
pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;
pub mod worker;

pub use account::Account;
pub use backend::{new_worker, Backend};
pub use config::{AccountConfig, Config};
pub use error::{Error, Result};
pub use protocol::{Action, ActionMessage, Event, EventMessage, MessageId, WorkerMessage};
pub use store::MessageStore;
pub use types::*;
pub use worker::{callback, Callback, WorkerEvents, WorkerHandle};
