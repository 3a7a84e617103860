//! Read-only mail sources
//!
//! [`SpoolMailbox`] reads a maildir: the MTA writes into `tmp/` and renames
//! finished messages into `new/`. Only `new/` is polled, so partially written
//! files are never seen. A message leaves `new/` for `cur/` once the runtime
//! has published or dead-lettered it, which makes the directory itself the
//! record of what is still pending. The IMAP source lives in
//! [`super::imap`].

use crate::connector::ConnectorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const NEW_DIR: &str = "new";
const CUR_DIR: &str = "cur";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone)]
pub struct MailItem {
    pub uid: String,
    pub received_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    fn mailbox(&self) -> &str;

    /// Where the mailbox lives, for health details
    fn host(&self) -> String;

    async fn probe(&self) -> Result<(), ConnectorError>;

    /// Up to `limit` pending message ids, oldest first
    ///
    /// Sources with monotonic ids return only ids after `cursor`; sources
    /// that track delivery themselves may ignore it.
    async fn list_since(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, ConnectorError>;

    async fn fetch(&self, uid: &str) -> Result<MailItem, ConnectorError>;

    /// Ids of messages received in `[start, end)`, oldest first
    async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, ConnectorError>;

    /// Mark `uid` as delivered downstream
    async fn acknowledge(&self, _uid: &str) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Whether `uid` sorts after `cursor` in this source's id order
    fn is_after(&self, uid: &str, cursor: &str) -> bool {
        uid > cursor
    }

    /// Raw message id for a message without a Message-ID header
    fn fallback_id(&self, uid: &str) -> String {
        format!("{}-{}", self.mailbox(), uid)
    }

    /// Source-specific fields for the health report
    fn details(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

pub struct SpoolMailbox {
    dir: PathBuf,
    mailbox: String,
}

impl SpoolMailbox {
    /// Maildir `mailbox` under `spool_dir`, i.e. `<spool_dir>/<mailbox>/{tmp,new,cur}`
    pub fn new(spool_dir: impl AsRef<Path>, mailbox: impl Into<String>) -> Self {
        let mailbox = mailbox.into();
        Self {
            dir: spool_dir.as_ref().join(&mailbox),
            mailbox,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where finished messages are delivered
    pub fn new_dir(&self) -> PathBuf {
        self.dir.join(NEW_DIR)
    }

    /// Where delivered messages are kept
    pub fn cur_dir(&self) -> PathBuf {
        self.dir.join(CUR_DIR)
    }

    /// Where messages are written before they are complete
    pub fn tmp_dir(&self) -> PathBuf {
        self.dir.join(TMP_DIR)
    }

    fn io_error(&self, e: std::io::Error) -> ConnectorError {
        if e.kind() == ErrorKind::NotFound {
            ConnectorError::Connection(format!("mailbox {} not found", self.dir.display()))
        } else {
            ConnectorError::Disconnected(format!("{}: {e}", self.dir.display()))
        }
    }

    /// Sorted names of the regular files in `dir`, dot files excluded
    async fn message_names(&self, dir: &Path) -> Result<Vec<String>, ConnectorError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| self.io_error(e))?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(e))? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name();
            match name.to_str() {
                Some(name) if is_file && !name.starts_with('.') => names.push(name.to_string()),
                _ => {},
            }
        }

        names.sort();
        Ok(names)
    }

    /// Current path of `uid`, pending or already delivered
    async fn locate(&self, uid: &str) -> Result<PathBuf, ConnectorError> {
        if uid.is_empty() || uid.contains(['/', '\\']) || uid.starts_with('.') {
            return Err(ConnectorError::Capture {
                id: uid.to_string(),
                reason: "not a maildir file name".to_string(),
            });
        }
        for dir in [self.new_dir(), self.cur_dir()] {
            let path = dir.join(uid);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
        }
        Err(ConnectorError::Capture {
            id: uid.to_string(),
            reason: format!("no such message in {}", self.dir.display()),
        })
    }

    async fn received_at(&self, path: &Path) -> Result<DateTime<Utc>, ConnectorError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| self.io_error(e))?;
        let modified = metadata.modified().map_err(|e| self.io_error(e))?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

#[async_trait]
impl MailSource for SpoolMailbox {
    fn mailbox(&self) -> &str {
        &self.mailbox
    }

    fn host(&self) -> String {
        self.dir.display().to_string()
    }

    async fn probe(&self) -> Result<(), ConnectorError> {
        let new_dir = self.new_dir();
        let metadata = tokio::fs::metadata(&new_dir).await.map_err(|e| self.io_error(e))?;
        if !metadata.is_dir() {
            return Err(ConnectorError::Connection(format!(
                "{} is not a directory",
                new_dir.display()
            )));
        }
        tokio::fs::create_dir_all(self.cur_dir())
            .await
            .map_err(|e| self.io_error(e))
    }

    async fn list_since(
        &self,
        _cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, ConnectorError> {
        let mut pending = self.message_names(&self.new_dir()).await?;
        pending.truncate(limit);
        debug!(mailbox = %self.mailbox, count = pending.len(), "listed pending messages");
        Ok(pending)
    }

    async fn fetch(&self, uid: &str) -> Result<MailItem, ConnectorError> {
        let path = self.locate(uid).await?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| ConnectorError::Capture {
            id: uid.to_string(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Ok(MailItem {
            uid: uid.to_string(),
            received_at: self.received_at(&path).await?,
            bytes,
        })
    }

    async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, ConnectorError> {
        let mut matching = Vec::new();
        for dir in [self.cur_dir(), self.new_dir()] {
            // cur/ appears with the first acknowledgement
            if dir == self.cur_dir() && !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                continue;
            }
            for name in self.message_names(&dir).await? {
                let received = self.received_at(&dir.join(&name)).await?;
                if received >= start && received < end {
                    matching.push((received, name));
                }
            }
        }
        matching.sort();
        Ok(matching.into_iter().map(|(_, name)| name).collect())
    }

    async fn acknowledge(&self, uid: &str) -> Result<(), ConnectorError> {
        let from = self.new_dir().join(uid);
        let to = self.cur_dir().join(uid);
        tokio::fs::create_dir_all(self.cur_dir())
            .await
            .map_err(|e| self.io_error(e))?;
        let Err(e) = tokio::fs::rename(&from, &to).await else {
            return Ok(());
        };
        // already moved by an earlier acknowledgement
        if e.kind() == ErrorKind::NotFound && tokio::fs::try_exists(&to).await.unwrap_or(false) {
            return Ok(());
        }
        Err(ConnectorError::Disconnected(format!(
            "cannot move {} to {}: {e}",
            from.display(),
            to.display()
        )))
    }

    fn fallback_id(&self, uid: &str) -> String {
        let stem = uid.split_once(['.', ':']).map_or(uid, |(stem, _)| stem);
        format!("{}-{}", self.mailbox, stem)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn spool() -> (tempfile::TempDir, SpoolMailbox) {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = SpoolMailbox::new(dir.path(), "INBOX");
        for sub in [mailbox.tmp_dir(), mailbox.new_dir()] {
            std::fs::create_dir_all(sub).unwrap();
        }
        (dir, mailbox)
    }

    fn deliver(mailbox: &SpoolMailbox, name: &str, bytes: &[u8]) {
        let staged = mailbox.tmp_dir().join(name);
        std::fs::write(&staged, bytes).unwrap();
        std::fs::rename(staged, mailbox.new_dir().join(name)).unwrap();
    }

    #[tokio::test]
    async fn test_lists_pending_messages_in_name_order() {
        let (_dir, mailbox) = spool();
        mailbox.probe().await.unwrap();
        for name in ["0003.eml", "0001.eml", "0002.eml", ".hidden"] {
            deliver(&mailbox, name, b"Subject: x\r\n\r\n");
        }

        assert_eq!(
            mailbox.list_since(None, 10).await.unwrap(),
            vec!["0001.eml", "0002.eml", "0003.eml"]
        );
        assert_eq!(mailbox.list_since(None, 1).await.unwrap(), vec!["0001.eml"]);

        let item = mailbox.fetch("0002.eml").await.unwrap();
        assert_eq!(item.bytes, b"Subject: x\r\n\r\n");
    }

    #[tokio::test]
    async fn test_files_still_in_tmp_are_not_listed() {
        let (_dir, mailbox) = spool();
        mailbox.probe().await.unwrap();
        std::fs::write(mailbox.tmp_dir().join("0001.eml"), b"Subject: half writ").unwrap();

        assert!(mailbox.list_since(None, 10).await.unwrap().is_empty());

        std::fs::rename(mailbox.tmp_dir().join("0001.eml"), mailbox.new_dir().join("0001.eml")).unwrap();
        assert_eq!(mailbox.list_since(None, 10).await.unwrap(), vec!["0001.eml"]);
    }

    #[tokio::test]
    async fn test_acknowledged_messages_leave_new_and_stay_fetchable() {
        let (_dir, mailbox) = spool();
        mailbox.probe().await.unwrap();
        deliver(&mailbox, "0002.eml", b"two");
        mailbox.acknowledge("0002.eml").await.unwrap();
        // a second acknowledgement is a no-op
        mailbox.acknowledge("0002.eml").await.unwrap();

        // a lexically smaller name arriving later is still pending
        deliver(&mailbox, "0001.eml", b"one");
        assert_eq!(mailbox.list_since(Some("0002.eml"), 10).await.unwrap(), vec!["0001.eml"]);

        assert_eq!(mailbox.fetch("0002.eml").await.unwrap().bytes, b"two");
        assert!(mailbox.cur_dir().join("0002.eml").exists());
        assert!(mailbox.acknowledge("0009.eml").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_rejects_path_like_ids() {
        let (_dir, mailbox) = spool();
        assert!(matches!(
            mailbox.fetch("../cursor").await,
            Err(ConnectorError::Capture { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = SpoolMailbox::new(dir.path(), "Archive");

        assert!(matches!(mailbox.probe().await, Err(ConnectorError::Connection(_))));
        assert!(matches!(
            mailbox.list_since(None, 10).await,
            Err(ConnectorError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_list_between_covers_pending_and_delivered() {
        let (_dir, mailbox) = spool();
        mailbox.probe().await.unwrap();
        deliver(&mailbox, "a", b"x");
        deliver(&mailbox, "b", b"y");
        mailbox.acknowledge("a").await.unwrap();

        let now = Utc::now();
        let mut hit = mailbox
            .list_between(now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        hit.sort();
        assert_eq!(hit, vec!["a", "b"]);

        let miss = mailbox
            .list_between(now - Duration::days(2), now - Duration::days(1))
            .await
            .unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn test_fallback_id_uses_file_stem() {
        let mailbox = SpoolMailbox::new("/var/spool", "INBOX");
        assert_eq!(mailbox.fallback_id("0002.eml"), "INBOX-0002");
        assert_eq!(mailbox.fallback_id("1700000000:2,S"), "INBOX-1700000000");
    }
}
