//! Backend implementations

pub mod maildir;

pub use maildir::MaildirWorker;
