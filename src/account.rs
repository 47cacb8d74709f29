//! Account: the interactive side of one backend connection
//!
//! An `Account` owns the posting handle and the event receiver of a worker
//! channel pair. It drains events, runs the registered callbacks, and routes
//! every event to its default observer: directory listings are collected here,
//! everything else goes to the [`MessageStore`] of the directory it concerns.
//!
//! Each store posts through a handle scoped to its directory, so replies reach
//! the store that asked even after the selection has moved on. Unsolicited
//! events belong to the directory the backend reported opening last.
//!
//! On creation the account posts `Configure`, then `Connect`; once connected it
//! lists directories and opens the configured default folder.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::backend;
use crate::config::AccountConfig;
use crate::error::{Error, Result};
use crate::protocol::{Action, Event, EventMessage};
use crate::store::MessageStore;
use crate::types::*;
use crate::worker::{self, callback, WorkerEvents, WorkerHandle};

/// Called for every store the account creates, before it receives any event
pub type StoreSetup = Arc<dyn Fn(&DirectoryName, &MessageStore) + Send + Sync>;

#[derive(Default)]
struct AccountState {
    directories: Vec<DirectoryName>,
    stores: HashMap<DirectoryName, MessageStore>,
    selected: Option<DirectoryName>,
    /// Last directory the backend answered an OpenDirectory for
    opened: Option<DirectoryName>,
    /// Folder to return to with `change_folder("-")`
    previous: Option<DirectoryName>,
    connected: bool,
    store_setup: Option<StoreSetup>,
}

fn lock_state(state: &Mutex<AccountState>) -> MutexGuard<'_, AccountState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Account {
    config: AccountConfig,
    worker: WorkerHandle,
    events: WorkerEvents,
    state: Arc<Mutex<AccountState>>,
}

impl Account {
    /// Build the backend for `config.source`, spawn it and attach an account
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: AccountConfig) -> Result<(Self, tokio::task::JoinHandle<()>)> {
        let (handle, events, channel) = worker::channel();
        let backend = backend::new_worker(&config.source, channel)?;
        let task = tokio::spawn(backend.run());
        Ok((Self::new(config, handle, events), task))
    }

    /// Attach to an already running backend and start the connect sequence
    pub fn new(config: AccountConfig, worker: WorkerHandle, events: WorkerEvents) -> Self {
        let state = Arc::new(Mutex::new(AccountState::default()));

        worker.post_action(Action::Configure(config.clone()), None);

        let name = config.name.clone();
        let default = config.default.clone();
        let connected_state = Arc::downgrade(&state);
        let handle = worker.clone();
        worker.post_action(
            Action::Connect,
            Some(callback(move |msg| match msg.body() {
                Event::Done => {
                    info!("{}: connected", name);
                    if let Some(state) = connected_state.upgrade() {
                        lock_state(&state).connected = true;
                    }
                    let state = connected_state.clone();
                    let opener = handle.clone();
                    let default = default.clone();
                    handle.post_action(
                        Action::ListDirectories,
                        Some(callback(move |msg| {
                            if let Event::Done = msg.body() {
                                open_default(&state, &opener, &default);
                            }
                        })),
                    );
                }
                Event::Error(err) => error!("{}: connection failed: {}", name, err),
                _ => {}
            })),
        );

        Self {
            config,
            worker,
            events,
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        lock_state(&self.state)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Register a function run on every newly created store (to attach hooks)
    pub fn on_new_store<F>(&self, f: F)
    where
        F: Fn(&DirectoryName, &MessageStore) + Send + Sync + 'static,
    {
        self.lock().store_setup = Some(Arc::new(f));
    }

    pub fn directories(&self) -> Vec<DirectoryName> {
        self.lock().directories.clone()
    }

    pub fn selected_directory(&self) -> Option<DirectoryName> {
        self.lock().selected.clone()
    }

    pub fn store(&self, directory: &str) -> Option<MessageStore> {
        self.lock().stores.get(directory).cloned()
    }

    /// The store of the selected directory, once its info has arrived
    pub fn current_store(&self) -> Option<MessageStore> {
        let state = self.lock();
        let selected = state.selected.as_ref()?;
        state.stores.get(selected).cloned()
    }

    /// Open `directory`, or the previously selected one when given `-`
    ///
    /// Any search or filter on the store being switched to is cleared.
    pub fn change_folder(&self, directory: &str) -> Result<()> {
        let target = {
            let mut state = self.lock();
            let target = if directory == "-" {
                state
                    .previous
                    .clone()
                    .ok_or_else(|| Error::NotFound("no previous folder to return to".to_string()))?
            } else {
                directory.to_string()
            };
            state.previous = state.selected.replace(target.clone());
            target
        };

        if let Some(store) = self.store(&target) {
            store.apply_clear();
        }

        debug!("{}: opening {}", self.config.name, target);
        self.worker
            .post_action(Action::OpenDirectory { directory: target }, None);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.worker.post_action(Action::Disconnect, None);
        self.lock().connected = false;
    }

    /// Default observer for events from the backend
    pub fn update(&self, msg: &EventMessage) {
        self.route(msg, self.events.origin(msg));
    }

    /// Apply `msg` on behalf of the store that posted its action, if any
    fn route(&self, msg: &EventMessage, origin: Option<DirectoryName>) {
        match msg.body() {
            Event::Directory(dir) => {
                let mut state = self.lock();
                if !state.directories.contains(&dir.name) {
                    state.directories.push(dir.name.clone());
                }
            }
            Event::DirectoryInfo(info) => {
                let (store, setup) = {
                    let mut state = self.lock();
                    state.opened = Some(info.name.clone());
                    match state.stores.get(&info.name) {
                        Some(store) => (store.clone(), None),
                        None => {
                            let store =
                                MessageStore::new(self.worker.scoped(&info.name), info.clone());
                            state.stores.insert(info.name.clone(), store.clone());
                            (store, state.store_setup.clone())
                        }
                    }
                };
                if let Some(setup) = setup {
                    setup(&info.name, &store);
                }
                store.update(msg);
            }
            Event::Error(err) => {
                warn!(
                    "{}: error in response to {:?}: {}",
                    self.config.name,
                    msg.in_response_to(),
                    err
                );
            }
            // only stores track their requests to completion
            Event::Done | Event::Unsupported => {
                if let Some(store) = origin.and_then(|origin| self.store(&origin)) {
                    store.update(msg);
                }
            }
            _ => {
                let target = match origin {
                    Some(origin) => origin,
                    None => match self.lock().opened.clone() {
                        Some(opened) => opened,
                        None => {
                            debug!(
                                "{}: no open directory for {}",
                                self.config.name,
                                msg.body().name()
                            );
                            return;
                        }
                    },
                };
                match self.store(&target) {
                    Some(store) => store.update(msg),
                    None => warn!(
                        "{}: dropping {} for unknown directory {}",
                        self.config.name,
                        msg.body().name(),
                        target
                    ),
                }
            }
        }
    }

    /// Dispatch one event: callback first, then the default observer
    ///
    /// The origin is looked up first: a terminal event forgets it.
    pub fn dispatch(&self, msg: &EventMessage) {
        let origin = self.events.origin(msg);
        self.events.process_event(msg);
        self.route(msg, origin);
    }

    /// Wait for and dispatch the next event; false once the backend is gone
    pub async fn process_next(&mut self) -> bool {
        match self.events.next().await {
            Some(msg) => {
                self.dispatch(&msg);
                true
            }
            None => false,
        }
    }

    /// Dispatch everything already queued, returning how many events ran
    pub fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some(msg) = self.events.try_next() {
            self.dispatch(&msg);
            count += 1;
        }
        count
    }
}

fn open_default(state: &Weak<Mutex<AccountState>>, worker: &WorkerHandle, default: &str) {
    let Some(state) = state.upgrade() else {
        return;
    };
    {
        let mut state = lock_state(&state);
        if state.selected.is_some() {
            return;
        }
        if !state.directories.iter().any(|d| d == default) {
            warn!("Default folder {} not found", default);
            return;
        }
        state.selected = Some(default.to_string());
    }
    worker.post_action(
        Action::OpenDirectory {
            directory: default.to_string(),
        },
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ActionMessage;
    use crate::worker::{ActionReceiver, EventSender};

    fn account() -> (Account, ActionReceiver, EventSender) {
        let (handle, events, backend) = worker::channel();
        let (actions, sender) = backend.split();
        let account = Account::new(AccountConfig::new("test", "maildir:///tmp"), handle, events);
        (account, actions, sender)
    }

    fn expect(actions: &mut ActionReceiver, name: &str) -> ActionMessage {
        let msg = actions.try_recv().unwrap();
        assert_eq!(msg.body().name(), name);
        msg
    }

    fn directory(name: &str) -> Event {
        Event::Directory(Directory {
            name: name.to_string(),
            attributes: vec![],
        })
    }

    /// Open `name` and answer its contents request
    fn open(
        account: &mut Account,
        actions: &mut ActionReceiver,
        sender: &EventSender,
        name: &str,
        uids: Vec<Uid>,
    ) -> MessageStore {
        account.change_folder(name).unwrap();
        let open = expect(actions, "OpenDirectory");
        sender.reply(
            &open,
            Event::DirectoryInfo(DirectoryInfo {
                name: name.to_string(),
                ..Default::default()
            }),
        );
        sender.reply(&open, Event::Done);
        account.process_pending();

        let fetch = expect(actions, "FetchDirectoryContents");
        sender.reply(&fetch, Event::DirectoryContents { uids });
        sender.reply(&fetch, Event::Done);
        account.process_pending();
        account.store(name).unwrap()
    }

    #[test]
    fn test_connect_sequence_opens_default() {
        let (mut account, mut actions, sender) = account();
        expect(&mut actions, "Configure");
        let connect = expect(&mut actions, "Connect");

        sender.reply(&connect, Event::Done);
        account.process_pending();
        assert!(account.is_connected());

        let list = expect(&mut actions, "ListDirectories");
        sender.reply(&list, directory("Archive"));
        sender.reply(&list, directory("INBOX"));
        sender.reply(&list, Event::Done);
        account.process_pending();

        assert_eq!(account.directories(), vec!["Archive", "INBOX"]);
        assert_eq!(account.selected_directory().as_deref(), Some("INBOX"));
        let open = expect(&mut actions, "OpenDirectory");
        assert!(matches!(open.body(), Action::OpenDirectory { directory } if directory == "INBOX"));
    }

    #[test]
    fn test_directory_info_creates_store() {
        let (mut account, mut actions, sender) = account();
        while actions.try_recv().is_some() {}

        account.change_folder("INBOX").unwrap();
        let open = expect(&mut actions, "OpenDirectory");
        assert!(account.current_store().is_none());

        sender.reply(
            &open,
            Event::DirectoryInfo(DirectoryInfo {
                name: "INBOX".to_string(),
                exists: 2,
                ..Default::default()
            }),
        );
        sender.reply(&open, Event::Done);
        account.process_pending();

        let store = account.current_store().unwrap();
        assert_eq!(store.directory_info().exists, 2);
        let fetch = expect(&mut actions, "FetchDirectoryContents");

        sender.reply(&fetch, Event::DirectoryContents { uids: vec![1, 2] });
        account.process_pending();
        assert_eq!(store.uids(), vec![1, 2]);
    }

    #[test]
    fn test_change_folder_history() {
        let (account, mut actions, _sender) = account();
        while actions.try_recv().is_some() {}

        assert!(matches!(account.change_folder("-"), Err(Error::NotFound(_))));

        account.change_folder("INBOX").unwrap();
        account.change_folder("Archive").unwrap();
        account.change_folder("-").unwrap();
        assert_eq!(account.selected_directory().as_deref(), Some("INBOX"));
        account.change_folder("-").unwrap();
        assert_eq!(account.selected_directory().as_deref(), Some("Archive"));
    }

    #[test]
    fn test_change_folder_clears_filter() {
        let (mut account, mut actions, sender) = account();
        while actions.try_recv().is_some() {}

        account.change_folder("INBOX").unwrap();
        let open = expect(&mut actions, "OpenDirectory");
        sender.reply(
            &open,
            Event::DirectoryInfo(DirectoryInfo {
                name: "INBOX".to_string(),
                ..Default::default()
            }),
        );
        account.process_pending();

        let store = account.store("INBOX").unwrap();
        store.apply_filter(vec![1]);
        account.change_folder("Archive").unwrap();
        account.change_folder("INBOX").unwrap();
        assert!(!store.is_filtered());
    }

    #[test]
    fn test_replies_follow_the_requesting_store() {
        let (mut account, mut actions, sender) = account();
        while actions.try_recv().is_some() {}

        let archive = open(&mut account, &mut actions, &sender, "Archive", vec![1]);
        let inbox = open(&mut account, &mut actions, &sender, "INBOX", vec![1]);

        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = fired.clone();
        inbox.fetch_headers(
            &[1],
            Some(Arc::new(move |info: &MessageInfo| {
                log.lock().unwrap().push(info.uid);
            })),
        );
        let headers = expect(&mut actions, "FetchMessageHeaders");

        // switch away before the backend gets to the header request
        account.change_folder("Archive").unwrap();
        let reopen = expect(&mut actions, "OpenDirectory");

        sender.reply(
            &headers,
            Event::MessageInfo(MessageInfo {
                uid: 1,
                envelope: Some(Envelope {
                    subject: "from the inbox".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );
        sender.reply(&headers, Event::Done);
        // a rescan of the folder the backend still has open
        sender.post(Event::DirectoryContents { uids: vec![1, 2] });
        account.process_pending();

        assert_eq!(*fired.lock().unwrap(), vec![1]);
        assert!(inbox.pending_headers().is_empty());
        assert_eq!(
            inbox.message(1).unwrap().envelope.unwrap().subject,
            "from the inbox"
        );
        assert!(archive.message(1).is_none());
        assert_eq!(inbox.uids(), vec![1, 2]);
        assert_eq!(archive.uids(), vec![1]);

        sender.reply(
            &reopen,
            Event::DirectoryInfo(DirectoryInfo {
                name: "Archive".to_string(),
                ..Default::default()
            }),
        );
        account.process_pending();
        sender.post(Event::DirectoryContents { uids: vec![1, 3] });
        account.process_pending();
        assert_eq!(archive.uids(), vec![1, 3]);
        assert_eq!(inbox.uids(), vec![1, 2]);
    }
}
