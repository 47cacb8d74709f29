//! Maildir folders on disk and their uid mappings
//!
//! A container is a root directory holding any number of maildir folders,
//! nested with `/` separators (`Archive/2024` is `<root>/Archive/2024/{cur,new,tmp}`).
//! Messages are addressed by uid; the mapping from maildir unique keys to uids
//! lives for as long as the container does.
//!
//! The file currently holding each key is remembered from the last scan and
//! rescanned only when that file has gone (renamed by another client, say).

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use uuid::Uuid;

use super::filename::{flags_to_string, parse_filename, MaildirFilename, INFO_SEPARATOR};
use super::message;
use crate::error::{Error, Result};
use crate::types::*;

const SUBDIRS: [&str; 3] = ["cur", "new", "tmp"];

/// Files left in tmp/ longer than this are abandoned deliveries
const TMP_MAX_AGE: Duration = Duration::from_secs(36 * 60 * 60);

/// Bidirectional unique key <-> uid mapping for one folder
///
/// Uids are handed out in increasing order and never reused.
#[derive(Debug)]
pub struct UidStore {
    next_uid: Uid,
    by_key: HashMap<String, Uid>,
    by_uid: HashMap<Uid, String>,
}

impl Default for UidStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UidStore {
    pub fn new() -> Self {
        Self {
            next_uid: 1,
            by_key: HashMap::new(),
            by_uid: HashMap::new(),
        }
    }

    pub fn get_or_insert(&mut self, key: &str) -> Uid {
        if let Some(uid) = self.by_key.get(key) {
            return *uid;
        }
        let uid = self.next_uid;
        self.next_uid += 1;
        self.by_key.insert(key.to_string(), uid);
        self.by_uid.insert(uid, key.to_string());
        uid
    }

    pub fn key(&self, uid: Uid) -> Option<&str> {
        self.by_uid.get(&uid).map(String::as_str)
    }

    pub fn remove(&mut self, uid: Uid) -> Option<String> {
        let key = self.by_uid.remove(&uid)?;
        self.by_key.remove(&key);
        Some(key)
    }

    pub fn uid_next(&self) -> Uid {
        self.next_uid
    }
}

/// Message counts of one folder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderCounts {
    pub exists: usize,
    pub recent: usize,
    pub unseen: usize,
}

async fn is_folder(path: &Path) -> bool {
    fs::metadata(path.join("cur"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn new_key() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}.{}.mailcache", secs, Uuid::new_v4().simple())
}

pub struct Container {
    root: PathBuf,
    uids: HashMap<DirectoryName, UidStore>,
    /// Files by unique key, per folder, as of the last scan
    files: HashMap<DirectoryName, HashMap<String, MaildirFilename>>,
}

impl Container {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            uids: HashMap::new(),
            files: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a folder; names may not escape the root
    pub fn dir(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidDirectory(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// All folders under the root, sorted, with `/` separated names
    pub async fn list_folders(&self) -> Result<Vec<DirectoryName>> {
        let mut folders = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if SUBDIRS.contains(&name) || name.starts_with('.') {
                    continue;
                }

                let path = entry.path();
                if is_folder(&path).await {
                    let relative = path
                        .strip_prefix(&self.root)
                        .map_err(|e| Error::Internal(e.to_string()))?;
                    let name = relative
                        .components()
                        .filter_map(|c| c.as_os_str().to_str())
                        .collect::<Vec<_>>()
                        .join("/");
                    folders.push(name);
                }
                pending.push(path);
            }
        }

        folders.sort();
        Ok(folders)
    }

    /// Path of an existing folder
    pub async fn open(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir(name)?;
        if !is_folder(&path).await {
            return Err(Error::NotFound(format!("directory {}", name)));
        }
        Ok(path)
    }

    pub async fn create(&self, name: &str, quiet: bool) -> Result<()> {
        let path = self.dir(name)?;
        if is_folder(&path).await {
            if quiet {
                return Ok(());
            }
            return Err(Error::InvalidDirectory(format!("{} already exists", name)));
        }
        for subdir in SUBDIRS {
            fs::create_dir_all(path.join(subdir)).await?;
        }
        info!("Created maildir folder {}", name);
        Ok(())
    }

    /// Remove abandoned deliveries from tmp/
    pub async fn clean(&self, name: &str) -> Result<usize> {
        let tmp = self.open(name).await?.join("tmp");
        let mut removed = 0;
        let mut entries = match fs::read_dir(&tmp).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age > TMP_MAX_AGE {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} stale file(s) from {}/tmp", removed, name);
        }
        Ok(removed)
    }

    /// Move everything in new/ to cur/, returning how many moved
    pub async fn move_new_to_cur(&self, name: &str) -> Result<usize> {
        let path = self.open(name).await?;
        let mut moved = 0;
        let mut entries = fs::read_dir(path.join("new")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(file) = parse_filename(&entry.path()) else {
                continue;
            };
            let target = path
                .join("cur")
                .join(format!("{}{}{}", file.key, INFO_SEPARATOR, file.info));
            fs::rename(&file.path, target).await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Message files in cur/ and new/
    pub async fn entries(&self, name: &str) -> Result<Vec<MaildirFilename>> {
        let path = self.open(name).await?;
        let mut files = Vec::new();
        for subdir in ["cur", "new"] {
            let mut entries = fs::read_dir(path.join(subdir)).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(file) = parse_filename(&entry.path()) {
                    files.push(file);
                }
            }
        }
        Ok(files)
    }

    /// Scan the folder and remember which file holds each key
    async fn rescan(&mut self, name: &str) -> Result<&HashMap<String, MaildirFilename>> {
        let files = self
            .entries(name)
            .await?
            .into_iter()
            .map(|file| (file.key.clone(), file))
            .collect();
        self.files.insert(name.to_string(), files);
        Ok(&self.files[name])
    }

    /// Uids of every message in the folder, oldest first
    pub async fn uids(&mut self, name: &str) -> Result<Vec<Uid>> {
        let mut keys: Vec<String> = self.rescan(name).await?.keys().cloned().collect();
        keys.sort();

        let store = self.uids.entry(name.to_string()).or_default();
        let mut uids: Vec<Uid> = keys.iter().map(|key| store.get_or_insert(key)).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Locate the file currently holding `uid`
    pub async fn find(&mut self, name: &str, uid: Uid) -> Result<MaildirFilename> {
        let not_found = || Error::NotFound(format!("message {} in {}", uid, name));
        let key = self
            .uids
            .get(name)
            .and_then(|store| store.key(uid))
            .map(str::to_string)
            .ok_or_else(not_found)?;

        let cached = self.files.get(name).and_then(|files| files.get(&key)).cloned();
        if let Some(file) = cached {
            if fs::metadata(&file.path).await.is_ok() {
                return Ok(file);
            }
        }
        debug!("Rescanning {} for message {}", name, uid);
        self.rescan(name)
            .await?
            .get(&key)
            .cloned()
            .ok_or_else(not_found)
    }

    fn remember(&mut self, name: &str, file: MaildirFilename) {
        if let Some(files) = self.files.get_mut(name) {
            files.insert(file.key.clone(), file);
        }
    }

    pub async fn read(&mut self, name: &str, uid: Uid) -> Result<(MaildirFilename, Vec<u8>)> {
        let file = self.find(name, uid).await?;
        let content = fs::read(&file.path).await?;
        Ok((file, content))
    }

    pub async fn message_info(&mut self, name: &str, uid: Uid) -> Result<MessageInfo> {
        let (file, content) = self.read(name, uid).await?;
        let internal_date = fs::metadata(&file.path)
            .await?
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        message::message_info(uid, &file, &content, internal_date)
    }

    /// Set or clear the Seen flag; a message in new/ moves to cur/
    pub async fn set_seen(&mut self, name: &str, uid: Uid, seen: bool) -> Result<()> {
        let file = self.find(name, uid).await?;
        if !file.is_new && file.has('S') == seen {
            return Ok(());
        }
        let target = self.dir(name)?.join("cur").join(file.with_flag('S', seen));
        fs::rename(&file.path, &target).await?;
        if let Some(renamed) = parse_filename(&target) {
            self.remember(name, renamed);
        }
        Ok(())
    }

    async fn delete(&mut self, name: &str, uid: Uid) -> Result<()> {
        let file = self.find(name, uid).await?;
        fs::remove_file(&file.path).await?;
        if let Some(store) = self.uids.get_mut(name) {
            store.remove(uid);
        }
        if let Some(files) = self.files.get_mut(name) {
            files.remove(&file.key);
        }
        Ok(())
    }

    /// Delete what can be deleted
    ///
    /// Returns the uids actually removed, and the first failure if any uid
    /// could not be.
    pub async fn delete_all(&mut self, name: &str, uids: &[Uid]) -> (Vec<Uid>, Result<()>) {
        let mut deleted = Vec::new();
        let mut failure = None;
        for &uid in uids {
            match self.delete(name, uid).await {
                Ok(()) => deleted.push(uid),
                Err(e) => {
                    warn!("Could not delete message {} from {}: {}", uid, name, e);
                    failure.get_or_insert(e);
                }
            }
        }
        (deleted, failure.map_or(Ok(()), Err))
    }

    /// Copy messages into `dest`, keeping their flags
    pub async fn copy_all(&mut self, dest: &str, src: &str, uids: &[Uid]) -> Result<()> {
        let dest_path = self.open(dest).await?;
        for &uid in uids {
            let (file, content) = self.read(src, uid).await?;
            deliver_to(&dest_path, &content, &file.info, None).await?;
        }
        debug!("Copied {} message(s) from {} to {}", uids.len(), src, dest);
        Ok(())
    }

    /// Deliver a new message through tmp/ into cur/
    pub async fn deliver(
        &self,
        dest: &str,
        content: &[u8],
        flags: &[Flag],
        date: Option<DateTime<Utc>>,
    ) -> Result<PathBuf> {
        let dest_path = self.open(dest).await?;
        deliver_to(&dest_path, content, &flags_to_string(flags), date).await
    }

    pub async fn counts(&self, name: &str) -> Result<FolderCounts> {
        let files = self.entries(name).await?;
        Ok(FolderCounts {
            exists: files.len(),
            recent: files.iter().filter(|f| f.is_new).count(),
            unseen: files.iter().filter(|f| !f.has('S')).count(),
        })
    }
}

async fn deliver_to(
    folder: &Path,
    content: &[u8],
    info: &str,
    date: Option<DateTime<Utc>>,
) -> Result<PathBuf> {
    let key = new_key();
    let tmp = folder.join("tmp").join(&key);
    fs::write(&tmp, content).await?;

    if let Some(date) = date {
        let file = fs::OpenOptions::new().write(true).open(&tmp).await?;
        file.into_std().await.set_modified(SystemTime::from(date))?;
    }

    let target = folder
        .join("cur")
        .join(format!("{}{}{}", key, INFO_SEPARATOR, info));
    fs::rename(&tmp, &target).await?;
    Ok(target)
}
