//! Maildir backend
//!
//! Serves a tree of maildir folders from the local filesystem. The worker loop
//! selects between the action queue and filesystem notifications for the `new/`
//! directory of the open folder; a newly delivered file triggers a rescan and an
//! unsolicited DirectoryContents event.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use mailparse::parse_mail;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use url::Url;

use crate::backend::Backend;
use crate::config::AccountConfig;
use crate::error::{Error, Result};
use crate::protocol::{Action, ActionMessage, Event};
use crate::types::*;
use crate::worker::{ActionReceiver, BackendChannel, EventSender};

pub mod container;
pub mod filename;
pub mod message;
pub mod search;

pub use container::{Container, FolderCounts, UidStore};

use search::{matches_query, Searchable};

struct Selected {
    name: DirectoryName,
    path: PathBuf,
}

impl Selected {
    fn new_dir(&self) -> PathBuf {
        self.path.join("new")
    }
}

/// Resolve a `maildir://` source URL to a root directory
///
/// `maildir://~/mail` is relative to the home directory, `maildir:///var/mail`
/// is absolute.
pub fn source_root(source: &str) -> Result<PathBuf> {
    let url = Url::parse(source)?;
    if url.scheme() != "maildir" {
        return Err(Error::UnsupportedBackend(url.scheme().to_string()));
    }
    let path = url.path();
    match url.host_str() {
        Some("~") => {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::Config("could not resolve home directory".to_string()))?;
            Ok(home.join(path.trim_start_matches('/')))
        }
        Some(host) if !host.is_empty() => Err(Error::Config(format!(
            "maildir source must be local, got host {}",
            host
        ))),
        _ if path.is_empty() || path == "/" => {
            Err(Error::Config(format!("maildir source has no path: {}", source)))
        }
        _ => Ok(PathBuf::from(path)),
    }
}

pub struct MaildirWorker {
    actions: ActionReceiver,
    events: EventSender,
    container: Option<Container>,
    selected: Option<Selected>,
    watcher: RecommendedWatcher,
    fs_events: UnboundedReceiver<notify::Result<notify::Event>>,
}

impl MaildirWorker {
    /// Create the worker and its filesystem watcher
    pub fn new(channel: BackendChannel) -> Result<Self> {
        let (fs_tx, fs_events) = unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = fs_tx.send(res);
        })
        .map_err(|e| Error::Watch(format!("could not create file system watcher: {}", e)))?;

        let (actions, events) = channel.split();
        Ok(Self {
            actions,
            events,
            container: None,
            selected: None,
            watcher,
            fs_events,
        })
    }

    async fn handle_action(&mut self, msg: ActionMessage) {
        debug!("<- {} {}", msg.id(), msg.body().name());
        match self.handle_message(&msg).await {
            Ok(()) => {
                self.events.reply(&msg, Event::Done);
            }
            Err(Error::Unsupported) => {
                self.events.reply(&msg, Event::Unsupported);
            }
            Err(e) => {
                warn!("{} {} failed: {}", msg.body().name(), msg.id(), e);
                self.events.reply(&msg, Event::Error(e));
            }
        }
    }

    async fn handle_message(&mut self, msg: &ActionMessage) -> Result<()> {
        match msg.body() {
            Action::Configure(config) => self.handle_configure(config),
            Action::Connect => self.handle_connect(),
            Action::Disconnect => self.handle_disconnect(),
            Action::ListDirectories => self.handle_list_directories(msg).await,
            Action::OpenDirectory { directory } => self.handle_open_directory(msg, directory).await,
            Action::FetchDirectoryContents => self.handle_fetch_directory_contents(msg).await,
            Action::SearchDirectory { criteria } => {
                self.handle_search_directory(msg, criteria).await
            }
            Action::CreateDirectory { directory, quiet } => {
                self.container()?.create(directory, *quiet).await
            }
            Action::FetchMessageHeaders { uids } => {
                self.handle_fetch_message_headers(msg, uids).await
            }
            Action::FetchFullMessages { uids } => self.handle_fetch_full_messages(msg, uids).await,
            Action::FetchMessageBodyPart { uid, part } => {
                self.handle_fetch_message_body_part(msg, *uid, part).await
            }
            Action::DeleteMessages { uids } => self.handle_delete_messages(msg, uids).await,
            Action::ReadMessages { read, uids } => {
                self.handle_read_messages(msg, *read, uids).await
            }
            Action::CopyMessages { destination, uids } => {
                let selected = self.selected_name()?;
                self.container()?.copy_all(destination, &selected, uids).await
            }
            Action::AppendMessage {
                destination,
                flags,
                date,
                content,
            } => {
                let path = self
                    .container()?
                    .deliver(destination, content, flags, *date)
                    .await?;
                debug!("Delivered message to {}", path.display());
                Ok(())
            }
        }
    }

    fn container(&mut self) -> Result<&mut Container> {
        self.container.as_mut().ok_or(Error::NotConfigured)
    }

    fn selected_name(&self) -> Result<DirectoryName> {
        self.selected
            .as_ref()
            .map(|s| s.name.clone())
            .ok_or(Error::NoDirectorySelected)
    }

    fn handle_configure(&mut self, config: &AccountConfig) -> Result<()> {
        let root = source_root(&config.source)?;
        info!("Configured base maildir: {}", root.display());
        self.container = Some(Container::new(root));
        Ok(())
    }

    fn handle_connect(&mut self) -> Result<()> {
        self.container()?;
        Ok(())
    }

    fn handle_disconnect(&mut self) -> Result<()> {
        if let Some(selected) = self.selected.take() {
            self.watcher.unwatch(&selected.new_dir())?;
        }
        Ok(())
    }

    async fn handle_list_directories(&mut self, msg: &ActionMessage) -> Result<()> {
        let folders = self.container()?.list_folders().await?;
        for name in folders {
            self.events.reply(
                msg,
                Event::Directory(Directory {
                    name,
                    attributes: Vec::new(),
                }),
            );
        }
        Ok(())
    }

    async fn handle_open_directory(&mut self, msg: &ActionMessage, name: &str) -> Result<()> {
        info!("Opening {}", name);

        if let Some(previous) = self.selected.take() {
            self.watcher
                .unwatch(&previous.new_dir())
                .map_err(|e| Error::Watch(format!("could not unwatch previous directory: {}", e)))?;
        }

        let container = self.container.as_mut().ok_or(Error::NotConfigured)?;
        let path = container.open(name).await?;
        let selected = Selected {
            name: name.to_string(),
            path,
        };
        self.watcher
            .watch(&selected.new_dir(), RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(format!("could not add watch to directory: {}", e)))?;
        self.selected = Some(selected);

        container.clean(name).await?;
        let counts = container.counts(name).await?;

        self.events.reply(
            msg,
            Event::DirectoryInfo(DirectoryInfo {
                name: name.to_string(),
                flags: Vec::new(),
                read_only: false,
                exists: counts.exists,
                recent: counts.recent,
                unseen: counts.unseen,
            }),
        );
        Ok(())
    }

    async fn handle_fetch_directory_contents(&mut self, msg: &ActionMessage) -> Result<()> {
        let selected = self.selected_name()?;
        let uids = self.container()?.uids(&selected).await?;
        self.events.reply(msg, Event::DirectoryContents { uids });
        Ok(())
    }

    async fn handle_search_directory(
        &mut self,
        msg: &ActionMessage,
        criteria: &SearchQuery,
    ) -> Result<()> {
        let selected = self.selected_name()?;
        let container = self.container.as_mut().ok_or(Error::NotConfigured)?;

        let mut results = Vec::new();
        for uid in container.uids(&selected).await? {
            let (file, content) = match container.read(&selected, uid).await {
                Ok(found) => found,
                Err(e) => {
                    debug!("Skipping message {} in search: {}", uid, e);
                    continue;
                }
            };
            let mail = match parse_mail(&content) {
                Ok(mail) => mail,
                Err(e) => {
                    debug!("Skipping unparseable message {}: {}", uid, e);
                    continue;
                }
            };
            let mut searchable = Searchable::new(uid, file.flags(), &mail);
            if matches_query(&mut searchable, criteria) {
                results.push(uid);
            }
        }

        debug!("Search in {} matched {} message(s)", selected, results.len());
        self.events.reply(msg, Event::SearchResults { uids: results });
        Ok(())
    }

    async fn handle_fetch_message_headers(&mut self, msg: &ActionMessage, uids: &[Uid]) -> Result<()> {
        let selected = self.selected_name()?;
        let container = self.container.as_mut().ok_or(Error::NotConfigured)?;
        for &uid in uids {
            match container.message_info(&selected, uid).await {
                Ok(info) => {
                    self.events.reply(msg, Event::MessageInfo(info));
                }
                Err(e) => {
                    warn!("Could not get message info for {}: {}", uid, e);
                    self.events.reply(msg, Event::Error(e));
                }
            }
        }
        Ok(())
    }

    async fn handle_fetch_full_messages(&mut self, msg: &ActionMessage, uids: &[Uid]) -> Result<()> {
        let selected = self.selected_name()?;
        let container = self.container.as_mut().ok_or(Error::NotConfigured)?;
        for &uid in uids {
            let (_, content) = container.read(&selected, uid).await?;
            self.events
                .reply(msg, Event::FullMessage(FullMessage { uid, content }));
        }
        Ok(())
    }

    async fn handle_fetch_message_body_part(
        &mut self,
        msg: &ActionMessage,
        uid: Uid,
        part: &[usize],
    ) -> Result<()> {
        let selected = self.selected_name()?;
        let container = self.container.as_mut().ok_or(Error::NotConfigured)?;

        let (_, content) = container.read(&selected, uid).await?;
        let body = message::body_part(&content, part)?;
        self.events.reply(
            msg,
            Event::MessageBodyPart(MessageBodyPart { uid, content: body }),
        );

        container.set_seen(&selected, uid, true).await?;
        let info = container.message_info(&selected, uid).await?;
        self.events.reply(msg, Event::MessageInfo(info));
        Ok(())
    }

    async fn handle_delete_messages(&mut self, msg: &ActionMessage, uids: &[Uid]) -> Result<()> {
        let selected = self.selected_name()?;
        let (deleted, result) = self.container()?.delete_all(&selected, uids).await;
        if !deleted.is_empty() {
            self.events
                .reply(msg, Event::MessagesDeleted { uids: deleted });
        }
        result
    }

    async fn handle_read_messages(
        &mut self,
        msg: &ActionMessage,
        read: bool,
        uids: &[Uid],
    ) -> Result<()> {
        let selected = self.selected_name()?;
        let container = self.container.as_mut().ok_or(Error::NotConfigured)?;
        for &uid in uids {
            let result = match container.set_seen(&selected, uid, read).await {
                Ok(()) => container.message_info(&selected, uid).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(info) => {
                    self.events.reply(msg, Event::MessageInfo(info));
                }
                Err(e) => {
                    warn!("Could not mark message {} as read={}: {}", uid, read, e);
                    self.events.reply(msg, Event::Error(e));
                }
            }
        }
        Ok(())
    }

    /// Rescan after a delivery; failures are logged, never reported
    async fn handle_fs_event(&mut self, event: notify::Result<notify::Event>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("File system watch error: {}", e);
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }
        let Some(selected) = self.selected.as_ref().map(|s| s.name.clone()) else {
            return;
        };
        let Some(container) = self.container.as_mut() else {
            return;
        };

        if let Err(e) = container.move_new_to_cur(&selected).await {
            warn!("Could not move new to cur: {}", e);
            return;
        }
        match container.uids(&selected).await {
            Ok(uids) => {
                debug!("Rescanned {}: {} message(s)", selected, uids.len());
                self.events.post(Event::DirectoryContents { uids });
            }
            Err(e) => warn!("Could not scan uids: {}", e),
        }
    }
}

#[async_trait]
impl Backend for MaildirWorker {
    async fn run(mut self: Box<Self>) {
        info!("Maildir worker started");
        loop {
            tokio::select! {
                action = self.actions.recv() => match action {
                    Some(action) => self.handle_action(action).await,
                    None => break,
                },
                Some(event) = self.fs_events.recv() => self.handle_fs_event(event).await,
            }
        }
        if let Some(selected) = self.selected.take() {
            if let Err(e) = self.watcher.unwatch(&selected.new_dir()) {
                error!("Could not remove watch on {}: {}", selected.name, e);
            }
        }
        info!("Maildir worker stopped");
    }
}
