//! The persistent mailbox store.
//!
//! Mails live in a single sled tree keyed by a monotonically generated
//! 64-bit id, stored big-endian so key order is insertion order. The value
//! is a bincode record carrying the owning user, the raw bytes, the size
//! and the delivery timestamp. A POP3 session works against a
//! [`MailboxView`] snapshot: message numbers are assigned at open time,
//! deletion marks live on the view, and only [`MailStore::close`] with
//! `commit_deletions` makes them permanent.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

const MAIL_TREE: &str = "mail";

/// On-disk record of one stored mail.
#[derive(Debug, Serialize, Deserialize)]
struct MailRecord {
    user: String,
    data: Vec<u8>,
    size: u64,
    date: u64,
}

/// Handle on the mail database. Cheap to clone.
#[derive(Clone)]
pub struct MailStore {
    db: sled::Db,
    mail: sled::Tree,
}

/// One message slot in an open mailbox.
#[derive(Debug)]
pub struct MailSlot {
    /// 1-based message number within this session.
    pub seq: usize,
    /// Stable store id; survives across sessions.
    pub id: u64,
    /// Size of the stored bytes.
    pub size: u64,
    /// Session-local deletion mark.
    pub deleted: bool,
}

impl MailSlot {
    /// The POP3 unique id: the stable store id, 18 digits, zero padded.
    pub fn uid(&self) -> String {
        format!("{:018}", self.id)
    }
}

/// A session's snapshot of one user's mailbox.
#[derive(Debug)]
pub struct MailboxView {
    user: String,
    slots: Vec<MailSlot>,
}

impl MailboxView {
    /// The slot for a 1-based message number, deleted or not.
    pub fn slot(&self, num: usize) -> Option<&MailSlot> {
        (num >= 1).then(|| self.slots.get(num - 1)).flatten()
    }

    /// Non-deleted slots in message-number order.
    pub fn live(&self) -> impl Iterator<Item = &MailSlot> {
        self.slots.iter().filter(|s| !s.deleted)
    }

    /// Message count and total size over the non-deleted slots. Each size
    /// is the one recorded at open time, counted exactly once.
    pub fn stat(&self) -> (usize, u64) {
        self.live().fold((0, 0), |(n, s), slot| (n + 1, s + slot.size))
    }

    /// Marks a message deleted. `false` if the number is invalid or the
    /// message is already marked.
    pub fn mark_deleted(&mut self, num: usize) -> bool {
        match num.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            Some(slot) if !slot.deleted => {
                slot.deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Clears every deletion mark.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.deleted = false;
        }
    }

    /// Owner of this mailbox.
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl MailStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("cannot open mail store at {}", path.display()))?;
        let mail = db.open_tree(MAIL_TREE)?;
        info!("mail store open at {} ({} mails)", path.display(), mail.len());
        Ok(MailStore { db, mail })
    }

    /// An in-memory throwaway store.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let mail = db.open_tree(MAIL_TREE)?;
        Ok(MailStore { db, mail })
    }

    /// Stores a new mail for `user` and returns its stable id.
    pub fn push(&self, user: &str, data: &[u8]) -> Result<u64> {
        let id = self.db.generate_id()?;
        let record = MailRecord {
            user: user.to_lowercase(),
            data: data.to_vec(),
            size: data.len() as u64,
            date: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        };
        self.mail.insert(id.to_be_bytes(), bincode::serialize(&record)?)?;
        self.mail.flush()?;
        debug!("stored mail {} for '{}' ({} bytes)", id, record.user, record.size);
        Ok(id)
    }

    /// Builds a session view of `user`'s mailbox.
    ///
    /// Message numbers are assigned in store (= insertion) order; the
    /// per-slot sizes are captured here and summed only in
    /// [`MailboxView::stat`].
    pub fn open_mailbox(&self, user: &str) -> Result<MailboxView> {
        let user = user.to_lowercase();
        let mut slots = Vec::new();
        for entry in self.mail.iter() {
            let (key, value) = entry?;
            let record: MailRecord = bincode::deserialize(&value)?;
            if record.user != user {
                continue;
            }
            let id = u64::from_be_bytes(key.as_ref().try_into().context("malformed mail key")?);
            slots.push(MailSlot { seq: slots.len() + 1, id, size: record.size, deleted: false });
        }
        debug!("mailbox opened for '{}': {} mails", user, slots.len());
        Ok(MailboxView { user, slots })
    }

    /// The stored bytes of a mail, by stable id.
    pub fn fetch(&self, id: u64) -> Result<Option<Vec<u8>>> {
        match self.mail.get(id.to_be_bytes())? {
            Some(value) => {
                let record: MailRecord = bincode::deserialize(&value)?;
                Ok(Some(record.data))
            }
            None => Ok(None),
        }
    }

    /// Removes a mail by stable id.
    pub fn delete(&self, id: u64) -> Result<()> {
        self.mail.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Closes a session view. With `commit_deletions`, every marked mail is
    /// removed from the store; otherwise the marks are discarded and the
    /// store is untouched. Returns the number of mails removed.
    pub fn close(&self, view: MailboxView, commit_deletions: bool) -> Result<usize> {
        let mut removed = 0;
        if commit_deletions {
            for slot in view.slots.iter().filter(|s| s.deleted) {
                self.delete(slot.id)?;
                removed += 1;
            }
            if removed > 0 {
                self.mail.flush()?;
            }
        }
        debug!("mailbox closed for '{}' ({} mails removed)", view.user, removed);
        Ok(removed)
    }

    /// Flushes outstanding writes; used on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.mail.flush()?;
        Ok(())
    }
}
