//! IMAP mail source
//!
//! Reads a single mailbox over IMAP, TLS by default. Message ids are IMAP
//! UIDs rendered as decimal strings and compared numerically, so the
//! connector's persisted cursor is the last delivered UID. The session is
//! opened lazily and dropped on the first I/O error; the next call reconnects.

use super::mailbox::{MailItem, MailSource};
use crate::config::ImapConfig;
use crate::connector::ConnectorError;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_trait::async_trait;
use chrono::{DateTime, Days, Utc};
use futures::TryStreamExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_native_tls::TlsStream;
use tokio_util::either::Either;
use tracing::{debug, info, warn};

type ImapStream = Either<TlsStream<TcpStream>, TcpStream>;

const IMAP_DATE_FORMAT: &str = "%d-%b-%Y";

pub struct ImapMailbox {
    config: ImapConfig,
    session: Mutex<Option<Session<ImapStream>>>,
    last_uid: AtomicU32,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            last_uid: AtomicU32::new(0),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn open_stream(&self) -> Result<ImapStream, ConnectorError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let tcp = tokio::time::timeout(self.timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectorError::Connection(format!("connect to {} timed out", self.host())))?
            .map_err(|e| ConnectorError::Connection(format!("{}: {e}", self.host())))?;

        if !self.config.use_tls {
            return Ok(Either::Right(tcp));
        }

        let connector = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|e| ConnectorError::Connection(format!("tls setup: {e}")))?;
        let tls = tokio_native_tls::TlsConnector::from(connector)
            .connect(&self.config.host, tcp)
            .await
            .map_err(|e| ConnectorError::Connection(format!("tls handshake with {}: {e}", self.host())))?;
        Ok(Either::Left(tls))
    }

    async fn open_session(&self) -> Result<Session<ImapStream>, ConnectorError> {
        let stream = self.open_stream().await?;
        let client = Client::new(stream);

        let mut session = tokio::time::timeout(
            self.timeout(),
            client.login(&self.config.username, &self.config.password),
        )
        .await
        .map_err(|_| ConnectorError::Connection(format!("login to {} timed out", self.host())))?
        .map_err(|(e, _)| ConnectorError::Connection(format!("login to {} failed: {e}", self.host())))?;

        session
            .select(&self.config.mailbox)
            .await
            .map_err(|e| ConnectorError::Connection(format!("select {}: {e}", self.config.mailbox)))?;

        info!(host = %self.host(), mailbox = %self.config.mailbox, "IMAP session opened");
        Ok(session)
    }

    /// Connected session, reconnecting if the previous one was dropped
    async fn session(&self) -> Result<MutexGuard<'_, Option<Session<ImapStream>>>, ConnectorError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_session().await?);
        }
        Ok(guard)
    }

    fn disconnected(&self, guard: &mut Option<Session<ImapStream>>, e: impl std::fmt::Display) -> ConnectorError {
        warn!(host = %self.host(), error = %e, "IMAP session dropped");
        *guard = None;
        ConnectorError::Disconnected(format!("{}: {e}", self.host()))
    }

    async fn uid_fetch(
        &self,
        guard: &mut Option<Session<ImapStream>>,
        uids: &str,
        query: &str,
    ) -> Result<Vec<Fetch>, ConnectorError> {
        let result = match guard.as_mut() {
            Some(session) => match session.uid_fetch(uids, query).await {
                Ok(stream) => stream.try_collect::<Vec<Fetch>>().await,
                Err(e) => Err(e),
            },
            None => return Err(ConnectorError::Disconnected(self.host())),
        };
        result.map_err(|e| self.disconnected(guard, e))
    }

    async fn uid_search(
        &self,
        guard: &mut Option<Session<ImapStream>>,
        query: &str,
    ) -> Result<Vec<u32>, ConnectorError> {
        let result = match guard.as_mut() {
            Some(session) => session.uid_search(query).await,
            None => return Err(ConnectorError::Disconnected(self.host())),
        };
        let uids = result.map_err(|e| self.disconnected(guard, e))?;
        Ok(uids.into_iter().collect())
    }
}

fn parse_uid(uid: &str) -> Result<u32, ConnectorError> {
    uid.trim().parse::<u32>().map_err(|_| ConnectorError::Capture {
        id: uid.to_string(),
        reason: "not an IMAP UID".to_string(),
    })
}

/// Search for everything after `last`; servers always return the highest UID
/// for `n:*`, so results still need filtering
fn since_query(last: u32) -> String {
    format!("UID {}:*", last.saturating_add(1))
}

/// Day-granular search covering `[start, end)`
fn window_query(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let before = end.date_naive().checked_add_days(Days::new(1)).unwrap_or(end.date_naive());
    format!(
        "SINCE {} BEFORE {}",
        start.date_naive().format(IMAP_DATE_FORMAT),
        before.format(IMAP_DATE_FORMAT)
    )
}

/// UIDs above `last`, ascending, at most `limit`
fn pending_uids(mut uids: Vec<u32>, last: u32, limit: usize) -> Vec<u32> {
    uids.retain(|uid| *uid > last);
    uids.sort_unstable();
    uids.dedup();
    uids.truncate(limit);
    uids
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl MailSource for ImapMailbox {
    fn mailbox(&self) -> &str {
        &self.config.mailbox
    }

    fn host(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn probe(&self) -> Result<(), ConnectorError> {
        let mut guard = self.session().await?;
        let result = match guard.as_mut() {
            Some(session) => session.noop().await,
            None => return Err(ConnectorError::Disconnected(self.host())),
        };
        result.map_err(|e| self.disconnected(&mut guard, e))
    }

    async fn list_since(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, ConnectorError> {
        let last = match cursor {
            Some(cursor) => parse_uid(cursor)?,
            None => 0,
        };
        let mut guard = self.session().await?;
        let found = self.uid_search(&mut guard, &since_query(last)).await?;
        let uids = pending_uids(found, last, limit);

        debug!(mailbox = %self.config.mailbox, after = last, count = uids.len(), "IMAP search");
        Ok(uids.into_iter().map(|uid| uid.to_string()).collect())
    }

    async fn fetch(&self, uid: &str) -> Result<MailItem, ConnectorError> {
        let number = parse_uid(uid)?;
        let mut guard = self.session().await?;
        let fetched = self
            .uid_fetch(&mut guard, &number.to_string(), "(UID RFC822 INTERNALDATE)")
            .await?;

        let message = fetched
            .iter()
            .find(|f| f.uid == Some(number))
            .ok_or_else(|| ConnectorError::Capture {
                id: uid.to_string(),
                reason: "message no longer exists".to_string(),
            })?;
        let bytes = message.body().ok_or_else(|| ConnectorError::Capture {
            id: uid.to_string(),
            reason: "server returned no RFC822 body".to_string(),
        })?;
        let received_at = message
            .internal_date()
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        self.last_uid.fetch_max(number, Ordering::Relaxed);
        Ok(MailItem {
            uid: number.to_string(),
            received_at,
            bytes: bytes.to_vec(),
        })
    }

    async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, ConnectorError> {
        let mut guard = self.session().await?;
        let mut found = self.uid_search(&mut guard, &window_query(start, end)).await?;
        if found.is_empty() {
            return Ok(Vec::new());
        }
        found.sort_unstable();

        let dated = self.uid_fetch(&mut guard, &uid_set(&found), "(UID INTERNALDATE)").await?;
        let mut in_window: Vec<(DateTime<Utc>, u32)> = dated
            .iter()
            .filter_map(|f| Some((f.internal_date()?.with_timezone(&Utc), f.uid?)))
            .filter(|(received, _)| *received >= start && *received < end)
            .collect();
        in_window.sort();

        Ok(in_window.into_iter().map(|(_, uid)| uid.to_string()).collect())
    }

    fn is_after(&self, uid: &str, cursor: &str) -> bool {
        match (uid.parse::<u32>(), cursor.parse::<u32>()) {
            (Ok(uid), Ok(cursor)) => uid > cursor,
            _ => uid > cursor,
        }
    }

    fn fallback_id(&self, uid: &str) -> String {
        format!("imap-uid-{uid}")
    }

    fn details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        details.insert("source".into(), Value::from("imap"));
        details.insert("last_uid".into(), Value::from(self.last_uid.load(Ordering::Relaxed)));
        details
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            if let Err(e) = session.logout().await {
                debug!(error = %e, "IMAP logout failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> ImapConfig {
        ImapConfig {
            host: "imap.corp.example.com".into(),
            port: 993,
            use_tls: true,
            username: "journal".into(),
            password: "secret".into(),
            mailbox: "Journal".into(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_pending_uids_skip_the_cursor_and_sort() {
        // `UID 11:*` on a mailbox whose highest UID is 10 still returns 10
        assert!(pending_uids(vec![10], 10, 50).is_empty());
        assert_eq!(pending_uids(vec![14, 11, 12, 11], 10, 50), vec![11, 12, 14]);
        assert_eq!(pending_uids(vec![14, 11, 12], 10, 2), vec![11, 12]);
    }

    #[test]
    fn test_search_queries() {
        assert_eq!(since_query(0), "UID 1:*");
        assert_eq!(since_query(41), "UID 42:*");

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 2, 6, 0, 0).unwrap();
        assert_eq!(window_query(start, end), "SINCE 01-Mar-2024 BEFORE 03-Mar-2024");
        assert_eq!(uid_set(&[3, 7, 9]), "3,7,9");
    }

    #[test]
    fn test_uids_compare_numerically() {
        let source = ImapMailbox::new(config());
        assert!(source.is_after("10", "9"));
        assert!(!source.is_after("9", "10"));
        assert_eq!(source.fallback_id("42"), "imap-uid-42");
        assert_eq!(source.host(), "imap.corp.example.com:993");
        assert_eq!(source.mailbox(), "Journal");
    }

    #[test]
    fn test_non_numeric_cursor_is_rejected() {
        assert!(matches!(parse_uid("0001.eml"), Err(ConnectorError::Capture { .. })));
        assert_eq!(parse_uid(" 17 ").unwrap(), 17);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_retryable_connection_error() {
        use crate::retry::Retryable;

        let mut config = config();
        config.host = "127.0.0.1".into();
        config.port = 1;
        config.use_tls = false;
        let source = ImapMailbox::new(config);

        let err = source.probe().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Connection(_)));
        assert!(err.is_retryable());
        assert!(source.close().await.is_ok());
    }
}
