//! Backend adapters
//!
//! A backend runs as its own task, owning the backend end of a worker channel
//! pair. It dequeues actions, does the (possibly slow) work, and answers with
//! events. Every action gets exactly one terminal event: Done on success,
//! Unsupported when the backend has no handler, Error otherwise.

use async_trait::async_trait;
use log::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::worker::BackendChannel;

pub mod r#impl;

pub use r#impl::MaildirWorker;

/// A mailbox backend driven by a worker channel pair
#[async_trait]
pub trait Backend: Send {
    /// Process actions until the interactive side drops its handle
    async fn run(self: Box<Self>);
}

/// Construct the backend for `source`, chosen by URL scheme
///
/// Unknown schemes and backend construction failures are reported here, before
/// any task is spawned.
pub fn new_worker(source: &str, channel: BackendChannel) -> Result<Box<dyn Backend>> {
    let url = Url::parse(source)?;
    debug!("Creating {} backend", url.scheme());
    match url.scheme() {
        "maildir" => Ok(Box::new(MaildirWorker::new(channel)?)),
        scheme => Err(Error::UnsupportedBackend(scheme.to_string())),
    }
}
