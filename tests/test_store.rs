//! Message store behaviour against a scripted backend

use mailcache::protocol::{Action, ActionMessage, Event};
use mailcache::store::MessageStore;
use mailcache::worker::{self, callback, ActionReceiver, EventSender, WorkerEvents};
use mailcache::{DirectoryInfo, Envelope, Error, Flag, MessageInfo};
use std::sync::{Arc, Mutex};

struct Scripted {
    store: MessageStore,
    events: WorkerEvents,
    actions: ActionReceiver,
    backend: EventSender,
}

impl Scripted {
    fn new(uids: &[u32]) -> Self {
        let (handle, events, channel) = worker::channel();
        let (actions, backend) = channel.split();
        let store = MessageStore::new(
            handle,
            DirectoryInfo {
                name: "INBOX".to_string(),
                ..Default::default()
            },
        );
        let mut scripted = Self {
            store,
            events,
            actions,
            backend,
        };
        scripted.backend.post(Event::DirectoryContents {
            uids: uids.to_vec(),
        });
        scripted.drain();
        scripted
    }

    fn drain(&mut self) {
        while let Some(msg) = self.events.try_next() {
            self.events.process_event(&msg);
            self.store.update(&msg);
        }
    }

    fn next_action(&mut self) -> ActionMessage {
        self.actions.try_recv().expect("an action was posted")
    }

    fn reply(&mut self, request: &ActionMessage, event: Event) {
        self.backend.reply(request, event);
        self.drain();
    }
}

fn info(uid: u32) -> MessageInfo {
    MessageInfo {
        uid,
        envelope: Some(Envelope {
            subject: format!("message {}", uid),
            ..Default::default()
        }),
        flags: vec![Flag::Seen],
        size: 42,
        ..Default::default()
    }
}

#[test]
fn test_move_with_failed_delete_keeps_tombstone() {
    let mut t = Scripted::new(&[5, 6, 7]);
    t.backend.post(Event::MessageInfo(info(7)));
    t.drain();

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    t.store.move_messages(
        &[7],
        "Archive",
        true,
        Some(callback(move |msg| {
            log.lock().unwrap().push(match msg.body() {
                Event::Error(e) => format!("error: {}", e),
                other => other.name().to_string(),
            });
        })),
    );
    assert!(t.store.is_deleted(7));

    let create = t.next_action();
    assert!(matches!(
        create.body(),
        Action::CreateDirectory { directory, quiet: true } if directory == "Archive"
    ));
    let copy = t.next_action();
    assert!(matches!(
        copy.body(),
        Action::CopyMessages { destination, uids } if destination == "Archive" && uids == &vec![7]
    ));

    t.reply(&create, Event::Done);
    t.reply(&copy, Event::Done);

    let delete = t.next_action();
    assert!(matches!(delete.body(), Action::DeleteMessages { uids } if uids == &vec![7]));
    t.reply(&delete, Event::Error(Error::NotFound("message 7".to_string())));

    let received = received.lock().unwrap();
    assert_eq!(received.last().unwrap(), "error: Not found: message 7");
    // the quiet create answered first
    assert_eq!(received[0], "Done");

    // stale tombstone, record untouched
    assert!(t.store.is_deleted(7));
    assert!(t.store.message(7).is_some());
    assert_eq!(t.store.uids(), vec![5, 6, 7]);
}

#[test]
fn test_move_with_failed_copy_never_deletes() {
    let mut t = Scripted::new(&[1, 2]);
    let errors = Arc::new(Mutex::new(0));
    let counter = errors.clone();
    t.store.move_messages(
        &[2],
        "Archive",
        false,
        Some(callback(move |msg| {
            if let Event::Error(_) = msg.body() {
                *counter.lock().unwrap() += 1;
            }
        })),
    );

    let copy = t.next_action();
    assert_eq!(copy.body().name(), "CopyMessages");
    t.reply(&copy, Event::Error(Error::NotFound("Archive".to_string())));

    assert_eq!(*errors.lock().unwrap(), 1);
    assert!(t.actions.try_recv().is_none());
    assert!(t.store.is_deleted(2));
}

#[test]
fn test_successful_move_removes_message() {
    let mut t = Scripted::new(&[1, 2, 3]);
    t.store.move_messages(&[2], "Archive", false, None);

    let copy = t.next_action();
    t.reply(&copy, Event::Done);
    let delete = t.next_action();
    t.reply(&delete, Event::MessagesDeleted { uids: vec![2] });
    t.reply(&delete, Event::Done);

    assert_eq!(t.store.uids(), vec![1, 3]);
    assert!(!t.store.is_deleted(2));
    assert!(!t.store.contains(2));
}

#[test]
fn test_copy_and_read_post_actions() {
    let mut t = Scripted::new(&[1]);
    t.store.copy(&[1], "Backup", true, None);
    t.store.read(&[1], true, None);

    assert_eq!(t.next_action().body().name(), "CreateDirectory");
    assert_eq!(t.next_action().body().name(), "CopyMessages");
    let read = t.next_action();
    assert!(matches!(read.body(), Action::ReadMessages { read: true, uids } if uids == &vec![1]));
    assert!(!t.store.is_deleted(1));
}

#[test]
fn test_header_callbacks_fire_in_registration_order() {
    let mut t = Scripted::new(&[5]);
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..3 {
        let log = order.clone();
        t.store.fetch_headers(
            &[5],
            Some(Arc::new(move |info: &MessageInfo| {
                log.lock().unwrap().push((n, info.uid));
            })),
        );
    }

    let request = t.next_action();
    assert!(t.actions.try_recv().is_none());
    t.reply(&request, Event::MessageInfo(info(5)));
    t.reply(&request, Event::Done);

    assert_eq!(*order.lock().unwrap(), vec![(0, 5), (1, 5), (2, 5)]);
    assert!(t.store.pending_headers().is_empty());
}

#[test]
fn test_partial_header_failure_allows_refetch() {
    let mut t = Scripted::new(&[1, 2]);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    t.store.fetch_headers(
        &[1, 2],
        Some(Arc::new(move |info: &MessageInfo| {
            log.lock().unwrap().push(info.uid);
        })),
    );
    let request = t.next_action();

    t.reply(&request, Event::MessageInfo(info(1)));
    t.reply(&request, Event::Error(Error::NotFound("message 2".to_string())));
    assert_eq!(t.store.pending_headers(), vec![2]);
    t.reply(&request, Event::Done);

    // the finished request gives up on uid 2 without calling back
    assert!(t.store.pending_headers().is_empty());
    assert_eq!(*fired.lock().unwrap(), vec![1]);
    assert!(t.store.message(1).is_some());
    assert!(t.store.message(2).is_none());

    t.store.fetch_headers(&[2], None);
    let retry = t.next_action();
    assert!(matches!(retry.body(), Action::FetchMessageHeaders { uids } if uids == &vec![2]));
}
