//! Client-side message store
//!
//! The store is the interactive side's cache of one open directory: directory
//! metadata, the backend-ordered uid list, per-message records, in-flight fetch
//! bookkeeping, optimistic deletions and a search/filter overlay.
//!
//! # Architecture
//!
//! `MessageStore` is a cheap-to-clone handle over `Arc<Mutex<StoreState>>`.
//! Every operation takes the lock, mutates, releases it, and only then posts
//! actions or runs callbacks and hooks. Nothing user-supplied ever runs while
//! the lock is held, so callbacks may call straight back into the store.
//!
//! All backend events enter through [`MessageStore::update`].
//!
//! # Fetch deduplication
//!
//! At most one header fetch and one body fetch is in flight per uid. Callers
//! asking for a uid that is already pending are queued on that uid and fire
//! when the single outstanding request resolves.
//!
//! A header request that finishes (Done or Unsupported) without a record for
//! some of its uids drops them from the pending set, callbacks uncalled, so a
//! later fetch asks again.
//!
//! # Known limitations
//!
//! - A failed [`MessageStore::fetch_full`] drops the pending entries and their
//!   callbacks without calling them. Callers must notice the missing body on
//!   their own (time out, retry).
//! - [`MessageStore::move_messages`] is a copy followed by a delete. A crash or
//!   disconnect between the two leaves the message in both directories, and a
//!   failed delete leaves the uids tombstoned.

use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::protocol::{Action, Event, EventMessage, MessageId};
use crate::types::*;
use crate::worker::{callback, Callback, WorkerHandle};

/// Invoked with the cached record once a header fetch resolves
pub type HeaderCallback = Arc<dyn Fn(&MessageInfo) + Send + Sync>;

/// Invoked with a readable stream over message or part content
pub type BodyCallback = Arc<dyn Fn(&mut dyn Read) + Send + Sync>;

/// Invoked with the uids matching a search
pub type SearchCallback = Arc<dyn Fn(&[Uid]) + Send + Sync>;

pub type UpdateHook = Arc<dyn Fn() + Send + Sync>;
pub type NewMailHook = Arc<dyn Fn(&MessageInfo) + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    on_update: Option<UpdateHook>,
    on_new_mail: Option<NewMailHook>,
    on_directory_change: Option<UpdateHook>,
}

struct StoreState {
    dir_info: DirectoryInfo,
    /// Records by uid; `None` until the header has been fetched
    messages: HashMap<Uid, Option<MessageInfo>>,
    /// Backend ordering of the directory
    uids: Vec<Uid>,
    /// Optimistically deleted, awaiting confirmation
    deleted: HashSet<Uid>,

    /// Counted from the newest end of the active view
    selected: isize,

    pending_headers: HashSet<Uid>,
    header_callbacks: HashMap<Uid, Vec<HeaderCallback>>,
    /// Uids of each header request still awaiting a record
    header_requests: HashMap<MessageId, HashSet<Uid>>,
    pending_bodies: HashSet<Uid>,
    body_callbacks: HashMap<Uid, Vec<BodyCallback>>,

    results: Vec<Uid>,
    result_index: isize,
    filter: bool,

    hooks: Hooks,
}

impl StoreState {
    fn view(&self) -> &[Uid] {
        if self.filter {
            &self.results
        } else {
            &self.uids
        }
    }

    fn select(&mut self, index: isize) {
        let len = self.view().len() as isize;
        self.selected = if len == 0 {
            0
        } else if index < 0 {
            index.rem_euclid(len)
        } else {
            index.min(len)
        };
    }

    fn next_prev(&mut self, delta: isize) {
        let len = self.view().len() as isize;
        if len == 0 {
            return;
        }
        self.selected = (self.selected + delta).clamp(0, len - 1);

        let results_len = self.results.len() as isize;
        let next_result_index = results_len - self.result_index - 1 - 2 * delta;
        if next_result_index < 0 || next_result_index >= results_len {
            return;
        }
        let next_result_uid = self.results[next_result_index as usize];
        let selected_uid = self.view()[(len - self.selected - 1) as usize];
        if next_result_uid == selected_uid {
            self.result_index += delta;
        }
    }

    /// Returns true when the overlay was stepped
    fn next_prev_result(&mut self, delta: isize) -> bool {
        let results_len = self.results.len() as isize;
        if results_len == 0 {
            return false;
        }
        self.result_index += delta;
        if self.result_index >= results_len {
            self.result_index = 0;
        }
        if self.result_index < 0 {
            self.result_index = results_len - 1;
        }

        let target = self.results[(results_len - self.result_index - 1) as usize];
        let view_len = self.view().len();
        if let Some(i) = self.view().iter().position(|&uid| uid == target) {
            self.select((view_len - i - 1) as isize);
        }
        true
    }
}

/// Copy every populated field of `from` into `to`
///
/// Empty, zero and absent fields never overwrite known values. Flags are the
/// exception: they are point-in-time state and always replaced.
fn merge(to: &mut MessageInfo, from: &MessageInfo) {
    if from.body_structure.is_some() {
        to.body_structure = from.body_structure.clone();
    }
    if from.envelope.is_some() {
        to.envelope = from.envelope.clone();
    }
    to.flags = from.flags.clone();
    if from.size != 0 {
        to.size = from.size;
    }
    if from.internal_date.is_some() {
        to.internal_date = from.internal_date;
    }
}

/// Side effects collected under the lock and run after it is released
#[derive(Default)]
struct Fired<'a> {
    update: bool,
    directory_change: bool,
    new_mail: Option<MessageInfo>,
    headers: Vec<HeaderCallback>,
    header_record: Option<MessageInfo>,
    bodies: Vec<BodyCallback>,
    body_content: &'a [u8],
    hooks: Hooks,
}

/// Shared handle to the cache of one open directory (cheap to clone)
#[derive(Clone)]
pub struct MessageStore {
    state: Arc<Mutex<StoreState>>,
    worker: WorkerHandle,
}

fn lock_state(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageStore {
    pub fn new(worker: WorkerHandle, dir_info: DirectoryInfo) -> Self {
        let state = StoreState {
            dir_info,
            messages: HashMap::new(),
            uids: Vec::new(),
            deleted: HashSet::new(),
            selected: 0,
            pending_headers: HashSet::new(),
            header_callbacks: HashMap::new(),
            header_requests: HashMap::new(),
            pending_bodies: HashSet::new(),
            body_callbacks: HashMap::new(),
            results: Vec::new(),
            result_index: 0,
            filter: false,
            hooks: Hooks::default(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            worker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        lock_state(&self.state)
    }

    /// Called once per batch of changes to visible state
    pub fn on_update<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().hooks.on_update = Some(Arc::new(f));
    }

    /// Called for every message reported as recent and unseen
    pub fn on_new_mail<F>(&self, f: F)
    where
        F: Fn(&MessageInfo) + Send + Sync + 'static,
    {
        self.lock().hooks.on_new_mail = Some(Arc::new(f));
    }

    /// Called when a directory listing contains uids the store had never seen
    pub fn on_directory_change<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().hooks.on_directory_change = Some(Arc::new(f));
    }

    fn notify_update(&self) {
        let hook = self.lock().hooks.on_update.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    // -- fetching -----------------------------------------------------------

    /// Request headers, issuing at most one outstanding fetch per uid
    ///
    /// `cb` is queued on every requested uid, pending or not, and fires once per
    /// uid when a MessageInfo carrying an envelope arrives.
    pub fn fetch_headers(&self, uids: &[Uid], cb: Option<HeaderCallback>) {
        let to_fetch = {
            let mut state = self.lock();
            let mut to_fetch = Vec::new();
            for &uid in uids {
                if state.pending_headers.insert(uid) {
                    to_fetch.push(uid);
                }
                if let Some(cb) = &cb {
                    state
                        .header_callbacks
                        .entry(uid)
                        .or_default()
                        .push(cb.clone());
                }
            }
            to_fetch
        };

        if !to_fetch.is_empty() {
            debug!("Fetching headers for {} message(s)", to_fetch.len());
            let requested: HashSet<Uid> = to_fetch.iter().copied().collect();
            let id = self
                .worker
                .post_action(Action::FetchMessageHeaders { uids: to_fetch }, None);
            self.lock().header_requests.insert(id, requested);
        }
    }

    /// Request full messages, issuing at most one outstanding fetch per uid
    ///
    /// If the backend answers the batch with an Error, the pending entries and
    /// callbacks for every uid in the batch are discarded without being called.
    pub fn fetch_full(&self, uids: &[Uid], cb: Option<BodyCallback>) {
        let to_fetch = {
            let mut state = self.lock();
            let mut to_fetch = Vec::new();
            for &uid in uids {
                if state.pending_bodies.insert(uid) {
                    to_fetch.push(uid);
                }
                if let Some(cb) = &cb {
                    state
                        .body_callbacks
                        .entry(uid)
                        .or_default()
                        .push(cb.clone());
                }
            }
            to_fetch
        };

        if to_fetch.is_empty() {
            return;
        }

        let store: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        let requested = to_fetch.clone();
        let on_event = callback(move |msg| {
            if let Event::Error(err) = msg.body() {
                warn!("Fetching {} message(s) failed: {}", requested.len(), err);
                if let Some(state) = store.upgrade() {
                    let mut state = lock_state(&state);
                    for uid in &requested {
                        state.pending_bodies.remove(uid);
                        state.body_callbacks.remove(uid);
                    }
                }
            }
        });
        self.worker
            .post_action(Action::FetchFullMessages { uids: to_fetch }, Some(on_event));
    }

    /// Request one MIME part; never deduplicated
    pub fn fetch_body_part(&self, uid: Uid, part: Vec<usize>, cb: BodyCallback) {
        self.worker.post_action(
            Action::FetchMessageBodyPart { uid, part },
            Some(callback(move |msg| {
                if let Event::MessageBodyPart(part) = msg.body() {
                    cb(&mut Cursor::new(part.content.as_slice()));
                }
            })),
        );
    }

    // -- event application ----------------------------------------------------

    /// Apply a backend event to the cache
    pub fn update(&self, msg: &EventMessage) {
        let mut fired = Fired::default();
        let mut fetch_contents = false;

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            match msg.body() {
                Event::DirectoryInfo(info) => {
                    state.dir_info = info.clone();
                    fetch_contents = true;
                    fired.update = true;
                }
                Event::DirectoryContents { uids } => {
                    let mut messages = HashMap::with_capacity(uids.len());
                    for &uid in uids {
                        match state.messages.remove(&uid) {
                            Some(existing) => {
                                messages.insert(uid, existing);
                            }
                            None => {
                                messages.insert(uid, None);
                                fired.directory_change = true;
                            }
                        }
                    }
                    state.messages = messages;
                    state.uids = uids.clone();

                    // forget bookkeeping for uids that left the directory
                    let present: HashSet<Uid> = uids.iter().copied().collect();
                    state.deleted.retain(|uid| present.contains(uid));
                    state.pending_headers.retain(|uid| present.contains(uid));
                    state.header_callbacks.retain(|uid, _| present.contains(uid));
                    for requested in state.header_requests.values_mut() {
                        requested.retain(|uid| present.contains(uid));
                    }
                    state.pending_bodies.retain(|uid| present.contains(uid));
                    state.body_callbacks.retain(|uid, _| present.contains(uid));
                    fired.update = true;
                }
                Event::MessageInfo(info) => {
                    let uid = info.uid;
                    match state.messages.get_mut(&uid) {
                        Some(Some(existing)) => merge(existing, info),
                        _ => {
                            state.messages.insert(uid, Some(info.clone()));
                        }
                    }

                    if info.has_flag(Flag::Recent) && !info.has_flag(Flag::Seen) {
                        fired.new_mail = Some(info.clone());
                    }

                    if info.envelope.is_some() && state.pending_headers.remove(&uid) {
                        for requested in state.header_requests.values_mut() {
                            requested.remove(&uid);
                        }
                        fired.headers = state.header_callbacks.remove(&uid).unwrap_or_default();
                        if !fired.headers.is_empty() {
                            fired.header_record = state.messages.get(&uid).cloned().flatten();
                        }
                    }
                    fired.update = true;
                }
                Event::FullMessage(full) => {
                    if state.pending_bodies.remove(&full.uid) {
                        fired.bodies = state.body_callbacks.remove(&full.uid).unwrap_or_default();
                        fired.body_content = full.content.as_slice();
                    }
                }
                Event::MessagesDeleted { uids } => {
                    let to_delete: HashSet<Uid> = uids.iter().copied().collect();
                    for uid in uids {
                        state.messages.remove(uid);
                        state.deleted.remove(uid);
                    }
                    state.uids.retain(|uid| !to_delete.contains(uid));
                    fired.update = true;
                }
                Event::Done | Event::Unsupported => {
                    let finished = msg
                        .in_response_to()
                        .and_then(|id| state.header_requests.remove(&id));
                    for uid in finished.into_iter().flatten() {
                        if state.pending_headers.remove(&uid) {
                            debug!("No header for message {}", uid);
                            state.header_callbacks.remove(&uid);
                            fired.update = true;
                        }
                    }
                }
                _ => {}
            }
            fired.hooks = state.hooks.clone();
        }

        if fetch_contents {
            self.worker.post_action(Action::FetchDirectoryContents, None);
        }
        Self::fire(fired);
    }

    fn fire(fired: Fired<'_>) {
        if let (Some(info), Some(hook)) = (&fired.new_mail, &fired.hooks.on_new_mail) {
            hook(info);
        }
        if let Some(record) = &fired.header_record {
            for cb in &fired.headers {
                cb(record);
            }
        }
        for cb in &fired.bodies {
            cb(&mut Cursor::new(fired.body_content));
        }
        if fired.update {
            if let Some(hook) = &fired.hooks.on_update {
                hook();
            }
        }
        if fired.directory_change {
            if let Some(hook) = &fired.hooks.on_directory_change {
                hook();
            }
        }
    }

    // -- mutations ------------------------------------------------------------

    /// Tombstone `uids` and ask the backend to delete them
    ///
    /// The interface is notified right away, before the backend confirms.
    pub fn delete(&self, uids: &[Uid], cb: Option<Callback>) {
        self.lock().deleted.extend(uids.iter().copied());
        self.worker
            .post_action(Action::DeleteMessages { uids: uids.to_vec() }, cb);
        self.notify_update();
    }

    pub fn copy(&self, uids: &[Uid], dest: &str, create_dest: bool, cb: Option<Callback>) {
        if create_dest {
            self.worker.post_action(
                Action::CreateDirectory {
                    directory: dest.to_string(),
                    quiet: true,
                },
                cb.clone(),
            );
        }
        self.worker.post_action(
            Action::CopyMessages {
                destination: dest.to_string(),
                uids: uids.to_vec(),
            },
            cb,
        );
    }

    /// Move as copy-then-delete
    ///
    /// Not atomic: the delete is only posted once the copy reports Done. A copy
    /// Error is forwarded to `cb` and the uids stay tombstoned; so does a failed
    /// delete.
    pub fn move_messages(&self, uids: &[Uid], dest: &str, create_dest: bool, cb: Option<Callback>) {
        self.lock().deleted.extend(uids.iter().copied());

        if create_dest {
            self.worker.post_action(
                Action::CreateDirectory {
                    directory: dest.to_string(),
                    quiet: true,
                },
                cb.clone(),
            );
        }

        let worker = self.worker.clone();
        let moved = uids.to_vec();
        self.worker.post_action(
            Action::CopyMessages {
                destination: dest.to_string(),
                uids: uids.to_vec(),
            },
            Some(callback(move |msg| match msg.body() {
                Event::Error(_) => {
                    if let Some(cb) = &cb {
                        cb(msg);
                    }
                }
                Event::Done => {
                    worker.post_action(
                        Action::DeleteMessages {
                            uids: moved.clone(),
                        },
                        cb.clone(),
                    );
                }
                _ => {}
            })),
        );

        self.notify_update();
    }

    /// Mark messages read or unread
    pub fn read(&self, uids: &[Uid], read: bool, cb: Option<Callback>) {
        self.worker.post_action(
            Action::ReadMessages {
                read,
                uids: uids.to_vec(),
            },
            cb,
        );
    }

    // -- views and selection ---------------------------------------------------

    /// The active view: filter results in filter mode, otherwise the full list
    pub fn uids(&self) -> Vec<Uid> {
        self.lock().view().to_vec()
    }

    pub fn message(&self, uid: Uid) -> Option<MessageInfo> {
        self.lock().messages.get(&uid).cloned().flatten()
    }

    /// Whether `uid` is known, fetched or not
    pub fn contains(&self, uid: Uid) -> bool {
        self.lock().messages.contains_key(&uid)
    }

    pub fn directory_info(&self) -> DirectoryInfo {
        self.lock().dir_info.clone()
    }

    pub fn is_deleted(&self, uid: Uid) -> bool {
        self.lock().deleted.contains(&uid)
    }

    pub fn pending_headers(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.lock().pending_headers.iter().copied().collect();
        uids.sort_unstable();
        uids
    }

    pub fn pending_bodies(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.lock().pending_bodies.iter().copied().collect();
        uids.sort_unstable();
        uids
    }

    /// The record under the cursor, if its header has been fetched
    pub fn selected(&self) -> Option<MessageInfo> {
        let state = self.lock();
        let view = state.view();
        let index = view.len() as isize - state.selected - 1;
        if index < 0 || index as usize >= view.len() {
            return None;
        }
        state
            .messages
            .get(&view[index as usize])
            .cloned()
            .flatten()
    }

    pub fn selected_uid(&self) -> Option<Uid> {
        let state = self.lock();
        let view = state.view();
        let index = view.len() as isize - state.selected - 1;
        if index < 0 || index as usize >= view.len() {
            return None;
        }
        Some(view[index as usize])
    }

    pub fn selected_index(&self) -> usize {
        self.lock().selected as usize
    }

    /// Move the cursor; negative indices count back from the end of the view
    pub fn select(&self, index: isize) {
        self.lock().select(index);
    }

    /// Step the cursor by `delta`, keeping the search cursor in sync
    pub fn next_prev(&self, delta: isize) {
        self.lock().next_prev(delta);
    }

    pub fn next(&self) {
        self.next_prev(1);
    }

    pub fn prev(&self) {
        self.next_prev(-1);
    }

    // -- search and filter -------------------------------------------------------

    pub fn search(&self, criteria: SearchQuery, cb: SearchCallback) {
        self.worker.post_action(
            Action::SearchDirectory { criteria },
            Some(callback(move |msg| {
                if let Event::SearchResults { uids } = msg.body() {
                    cb(uids);
                }
            })),
        );
    }

    /// Install search results and jump to the nearest following match
    pub fn apply_search(&self, results: Vec<Uid>) {
        {
            let mut state = self.lock();
            state.results = results;
            state.result_index = -1;
        }
        self.next_result();
    }

    /// Replace the visible list with `results`
    pub fn apply_filter(&self, results: Vec<Uid>) {
        {
            let mut state = self.lock();
            state.results = results;
            state.filter = true;
        }
        self.notify_update();
    }

    /// Leave filter mode and forget any search or filter results
    pub fn apply_clear(&self) {
        {
            let mut state = self.lock();
            state.results.clear();
            state.result_index = 0;
            state.filter = false;
        }
        self.notify_update();
    }

    pub fn is_filtered(&self) -> bool {
        self.lock().filter
    }

    pub fn results(&self) -> Vec<Uid> {
        self.lock().results.clone()
    }

    pub fn result_index(&self) -> isize {
        self.lock().result_index
    }

    pub fn next_result(&self) {
        if self.lock().next_prev_result(1) {
            self.notify_update();
        }
    }

    pub fn prev_result(&self) {
        if self.lock().next_prev_result(-1) {
            self.notify_update();
        }
    }
}
