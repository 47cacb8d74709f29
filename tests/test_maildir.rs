//! End-to-end tests: account and store driving a maildir backend task

use mailcache::protocol::{Action, Event};
use mailcache::worker::callback;
use mailcache::{Account, AccountConfig, Flag, MessageInfo, MessageStore, SearchQuery, Uid};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{timeout, Instant};

const LUNCH: &str = "From: Alice <alice@example.com>\r\n\
To: bob@example.org\r\n\
Subject: Lunch tomorrow\r\n\
Date: Mon, 04 Mar 2024 09:00:00 +0000\r\n\
\r\n\
Noon at the usual place?\r\n";

const REPORT: &str = "From: Carol <carol@example.net>\r\n\
To: bob@example.org\r\n\
Subject: Weekly report\r\n\
Date: Tue, 05 Mar 2024 17:45:00 +0000\r\n\
\r\n\
All green.\r\n";

fn folder(root: &Path, name: &str) -> PathBuf {
    let path = root.join(name);
    for subdir in ["cur", "new", "tmp"] {
        std::fs::create_dir_all(path.join(subdir)).unwrap();
    }
    path
}

fn fixture() -> TempDir {
    let tmp_dir = TempDir::new().unwrap();
    let inbox = folder(tmp_dir.path(), "INBOX");
    folder(tmp_dir.path(), "Sent");
    std::fs::write(inbox.join("cur/1000.lunch:2,"), LUNCH).unwrap();
    std::fs::write(inbox.join("cur/2000.report:2,S"), REPORT).unwrap();
    tmp_dir
}

fn spawn(root: &Path) -> Account {
    let config = AccountConfig::new("test", format!("maildir://{}", root.display()));
    let (account, _task) = Account::spawn(config).unwrap();
    account
}

async fn pump_until<F>(account: &mut Account, cond: F)
where
    F: Fn(&Account) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond(account) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, account.process_next()).await {
            Ok(true) => {}
            Ok(false) => panic!("backend stopped"),
            Err(_) => panic!("timed out waiting for the backend"),
        }
    }
}

/// Connect and wait for the default folder's contents
async fn open_inbox(account: &mut Account, expected: usize) -> MessageStore {
    pump_until(account, |a| {
        a.current_store()
            .map(|s| s.uids().len() == expected)
            .unwrap_or(false)
    })
    .await;
    account.current_store().unwrap()
}

fn files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_open_and_fetch_headers() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;

    assert_eq!(account.directories(), vec!["INBOX", "Sent"]);
    let info = store.directory_info();
    assert_eq!(info.name, "INBOX");
    assert_eq!(info.exists, 2);
    assert_eq!(info.unseen, 1);

    let uids = store.uids();
    store.fetch_headers(&uids, None);
    pump_until(&mut account, |_| uids.iter().all(|uid| store.message(*uid).is_some())).await;

    // uids follow delivery order: the lunch message is older
    let lunch = store.message(uids[0]).unwrap();
    let envelope = lunch.envelope.unwrap();
    assert_eq!(envelope.subject, "Lunch tomorrow");
    assert_eq!(envelope.from[0].mailbox, "alice");
    assert!(lunch.flags.is_empty());

    let report = store.message(uids[1]).unwrap();
    assert_eq!(report.flags, vec![Flag::Seen]);
    assert!(store.pending_headers().is_empty());

    // newest first
    assert_eq!(store.selected().unwrap().uid, uids[1]);
}

#[tokio::test]
async fn test_body_part_marks_seen() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let uid = store.uids()[0];

    let body: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let sink = body.clone();
    store.fetch_body_part(
        uid,
        vec![1],
        Arc::new(move |reader: &mut dyn Read| {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).unwrap();
            *sink.lock().unwrap() = Some(buf);
        }),
    );

    pump_until(&mut account, |_| {
        store
            .message(uid)
            .map(|m| m.has_flag(Flag::Seen))
            .unwrap_or(false)
    })
    .await;

    let body = body.lock().unwrap().clone().unwrap();
    assert!(String::from_utf8(body).unwrap().contains("Noon"));
    assert!(tmp_dir.path().join("INBOX/cur/1000.lunch:2,S").exists());
}

#[tokio::test]
async fn test_read_messages_toggles_flag() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let uid = store.uids()[1];

    let done = Arc::new(Mutex::new(false));
    let flag = done.clone();
    store.read(
        &[uid],
        false,
        Some(callback(move |msg| {
            if let Event::Done = msg.body() {
                *flag.lock().unwrap() = true;
            }
        })),
    );
    pump_until(&mut account, |_| *done.lock().unwrap()).await;

    assert!(!store.message(uid).unwrap().has_flag(Flag::Seen));
    assert!(tmp_dir.path().join("INBOX/cur/2000.report:2,").exists());
}

#[tokio::test]
async fn test_delete_removes_file() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let uid = store.uids()[0];

    store.delete(&[uid], None);
    assert!(store.is_deleted(uid));
    pump_until(&mut account, |_| !store.uids().contains(&uid)).await;

    assert!(!store.is_deleted(uid));
    assert_eq!(files(&tmp_dir.path().join("INBOX/cur")), vec!["2000.report:2,S"]);
}

#[tokio::test]
async fn test_move_creates_destination() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let uid = store.uids()[1];

    store.move_messages(&[uid], "Archive/2024", true, None);
    pump_until(&mut account, |_| !store.uids().contains(&uid)).await;

    let archived = files(&tmp_dir.path().join("Archive/2024/cur"));
    assert_eq!(archived.len(), 1);
    assert!(archived[0].ends_with(":2,S"));
    assert_eq!(files(&tmp_dir.path().join("INBOX/cur")), vec!["1000.lunch:2,"]);
}

#[tokio::test]
async fn test_search_directory() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let uids = store.uids();

    let results: Arc<Mutex<Option<Vec<Uid>>>> = Arc::new(Mutex::new(None));
    let sink = results.clone();
    store.search(
        SearchQuery::Or(
            Box::new(SearchQuery::Subject("lunch".to_string())),
            Box::new(SearchQuery::Body("all green".to_string())),
        ),
        Arc::new(move |found: &[Uid]| {
            *sink.lock().unwrap() = Some(found.to_vec());
        }),
    );
    pump_until(&mut account, |_| results.lock().unwrap().is_some()).await;
    assert_eq!(results.lock().unwrap().clone().unwrap(), uids);

    let unseen: Arc<Mutex<Option<Vec<Uid>>>> = Arc::new(Mutex::new(None));
    let sink = unseen.clone();
    store.search(
        SearchQuery::Unseen,
        Arc::new(move |found: &[Uid]| {
            *sink.lock().unwrap() = Some(found.to_vec());
        }),
    );
    pump_until(&mut account, |_| unseen.lock().unwrap().is_some()).await;

    let found = unseen.lock().unwrap().clone().unwrap();
    assert_eq!(found, vec![uids[0]]);
    store.apply_filter(found.clone());
    assert_eq!(store.uids(), found);
}

#[tokio::test]
async fn test_append_message() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    open_inbox(&mut account, 2).await;

    let done = Arc::new(Mutex::new(false));
    let flag = done.clone();
    account.worker().post_action(
        Action::AppendMessage {
            destination: "Sent".to_string(),
            flags: vec![Flag::Seen],
            date: None,
            content: REPORT.as_bytes().to_vec(),
        },
        Some(callback(move |msg| {
            if let Event::Done = msg.body() {
                *flag.lock().unwrap() = true;
            }
        })),
    );
    pump_until(&mut account, |_| *done.lock().unwrap()).await;

    let sent = files(&tmp_dir.path().join("Sent/cur"));
    assert_eq!(sent.len(), 1);
    assert!(sent[0].ends_with(":2,S"));
    assert!(files(&tmp_dir.path().join("Sent/tmp")).is_empty());
}

#[tokio::test]
async fn test_errors_reach_callback() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;

    let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let sink = error.clone();
    store.copy(
        &store.uids(),
        "Missing",
        false,
        Some(callback(move |msg| {
            if let Event::Error(e) = msg.body() {
                *sink.lock().unwrap() = Some(e.to_string());
            }
        })),
    );
    pump_until(&mut account, |_| error.lock().unwrap().is_some()).await;
    assert!(error.lock().unwrap().clone().unwrap().contains("Missing"));
}

#[tokio::test]
async fn test_read_batch_continues_past_missing_message() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let (ok, gone) = (store.uids()[0], store.uids()[1]);
    std::fs::remove_file(tmp_dir.path().join("INBOX/cur/2000.report:2,S")).unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    store.read(
        &[gone, ok],
        true,
        Some(callback(move |msg| {
            log.lock().unwrap().push(msg.body().name().to_string());
        })),
    );

    pump_until(&mut account, |_| {
        store
            .message(ok)
            .map(|m| m.has_flag(Flag::Seen))
            .unwrap_or(false)
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), vec!["Error"]);
    assert!(store.message(gone).is_none());
    assert!(tmp_dir.path().join("INBOX/cur/1000.lunch:2,S").exists());
}

#[tokio::test]
async fn test_missing_header_is_given_up() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;
    let (ok, gone) = (store.uids()[0], store.uids()[1]);
    std::fs::remove_file(tmp_dir.path().join("INBOX/cur/2000.report:2,S")).unwrap();

    let fetched: Arc<Mutex<Vec<Uid>>> = Arc::new(Mutex::new(Vec::new()));
    let log = fetched.clone();
    store.fetch_headers(
        &[gone, ok],
        Some(Arc::new(move |info: &MessageInfo| {
            log.lock().unwrap().push(info.uid);
        })),
    );
    assert_eq!(store.pending_headers(), vec![ok, gone]);
    pump_until(&mut account, |_| store.pending_headers().is_empty()).await;

    assert_eq!(*fetched.lock().unwrap(), vec![ok]);
    assert!(store.message(ok).is_some());
    assert!(store.message(gone).is_none());
}

#[tokio::test]
async fn test_new_delivery_is_picked_up() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    let store = open_inbox(&mut account, 2).await;

    let changes = Arc::new(Mutex::new(0));
    let counter = changes.clone();
    store.on_directory_change(move || {
        *counter.lock().unwrap() += 1;
    });

    std::fs::write(tmp_dir.path().join("INBOX/new/3000.fresh"), LUNCH).unwrap();
    pump_until(&mut account, |_| store.uids().len() == 3).await;

    assert!(*changes.lock().unwrap() >= 1);
    assert!(files(&tmp_dir.path().join("INBOX/cur")).contains(&"3000.fresh:2,".to_string()));
}

#[tokio::test]
async fn test_change_folder() {
    let tmp_dir = fixture();
    let mut account = spawn(tmp_dir.path());
    open_inbox(&mut account, 2).await;

    account.change_folder("Sent").unwrap();
    pump_until(&mut account, |a| {
        a.current_store()
            .map(|s| s.directory_info().name == "Sent")
            .unwrap_or(false)
    })
    .await;
    assert!(account.current_store().unwrap().uids().is_empty());

    account.change_folder("-").unwrap();
    assert_eq!(account.selected_directory().as_deref(), Some("INBOX"));
}

#[tokio::test]
async fn test_unknown_backend_fails_at_startup() {
    let config = AccountConfig::new("remote", "imaps://mail.example.com");
    assert!(Account::spawn(config).is_err());
}
