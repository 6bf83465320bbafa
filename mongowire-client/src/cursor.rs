//! Client-side cursor over a multi-batch result set.

use crate::connection::Connection;
use crate::error::ClientError;
use mongowire_protocol::{
    Document, GetMoreMessage, KillCursorsMessage, Namespace, Query, ReplyMessage, Request,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Lifecycle of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// More documents may be buffered or fetchable.
    Open,
    /// Nothing left to deliver; `next()` returns `None` without I/O.
    Exhausted,
    /// Closed by the caller; reads fail with [`ClientError::CursorClosed`].
    Closed,
}

/// Iterates the results of one query, fetching further batches on demand.
///
/// Callers must [`close`](Self::close) every cursor, drained or not: the
/// server keeps its side open until told otherwise or until it times out.
pub struct Cursor {
    conn: Arc<Connection>,
    namespace: Namespace,
    /// Server handle; 0 once the server has nothing more.
    cursor_id: i64,
    buffer: VecDeque<Document>,
    batch_size: i32,
    /// The server does not enforce limits, so delivery stops here.
    limit: i32,
    delivered: usize,
    state: CursorState,
}

impl Cursor {
    /// Builds a cursor from the first reply to `query`.
    pub(crate) fn new(
        conn: Arc<Connection>,
        namespace: Namespace,
        query: &Query,
        reply: ReplyMessage,
    ) -> Self {
        let mut cursor = Self {
            conn,
            namespace,
            cursor_id: reply.cursor_id,
            buffer: reply.documents.into(),
            batch_size: query.batch_size,
            limit: query.limit,
            delivered: 0,
            state: CursorState::Open,
        };
        cursor.update_state();
        cursor
    }

    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Documents received but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Documents returned so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    fn remaining(&self) -> Option<usize> {
        if self.limit > 0 {
            Some((self.limit as usize).saturating_sub(self.delivered))
        } else {
            None
        }
    }

    fn limit_reached(&self) -> bool {
        self.remaining() == Some(0)
    }

    fn update_state(&mut self) {
        if self.state == CursorState::Open
            && (self.limit_reached() || (self.buffer.is_empty() && self.cursor_id == 0))
        {
            self.state = CursorState::Exhausted;
        }
    }

    fn check_open(&self) -> Result<(), ClientError> {
        if self.state == CursorState::Closed {
            return Err(ClientError::CursorClosed);
        }
        Ok(())
    }

    /// `numberToReturn` for the next GET_MORE: the batch size, capped by
    /// what is left of the limit.
    fn next_batch_size(&self) -> i32 {
        match self.remaining() {
            Some(remaining) if self.batch_size <= 0 || remaining < self.batch_size as usize => {
                i32::try_from(remaining).unwrap_or(i32::MAX)
            }
            _ => self.batch_size.max(0),
        }
    }

    async fn get_more(&mut self) -> Result<(), ClientError> {
        let message = GetMoreMessage::new(self.namespace.clone(), self.cursor_id)
            .with_number_to_return(self.next_batch_size());
        let reply = self.conn.request(&Request::GetMore(message)).await?;

        tracing::debug!(
            "Cursor {} on {} fetched {} documents, next cursor id {}",
            self.cursor_id,
            self.namespace,
            reply.documents.len(),
            reply.cursor_id
        );
        self.cursor_id = reply.cursor_id;
        self.buffer.extend(reply.documents);
        self.update_state();
        Ok(())
    }

    /// Fetches one more batch when the buffer is empty and the server has more.
    async fn fill(&mut self) -> Result<(), ClientError> {
        if self.state == CursorState::Open && self.buffer.is_empty() && self.cursor_id != 0 {
            self.get_more().await?;
        }
        Ok(())
    }

    /// Returns the next document, or `None` when no more results are available.
    ///
    /// Buffered documents are returned without I/O; an empty buffer triggers
    /// a single GET_MORE while the server cursor is live.
    pub async fn next(&mut self) -> Result<Option<Document>, ClientError> {
        self.check_open()?;
        if self.state == CursorState::Exhausted {
            return Ok(None);
        }

        self.fill().await?;
        let doc = self.buffer.pop_front();
        if doc.is_some() {
            self.delivered += 1;
        }
        self.update_state();
        Ok(doc)
    }

    /// Returns whether [`next`](Self::next) would yield a document.
    ///
    /// May fetch a batch to find out.
    pub async fn has_next(&mut self) -> Result<bool, ClientError> {
        self.check_open()?;
        if self.state == CursorState::Exhausted {
            return Ok(false);
        }
        self.fill().await?;
        Ok(!self.buffer.is_empty() && !self.limit_reached())
    }

    /// Drains the cursor into a vector. The cursor is not closed.
    pub async fn collect_all(&mut self) -> Result<Vec<Document>, ClientError> {
        let mut docs = Vec::with_capacity(self.buffer.len());
        while let Some(doc) = self.next().await? {
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Releases the cursor, killing the server side if it is still live.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        self.state = CursorState::Closed;
        self.buffer.clear();

        let cursor_id = std::mem::take(&mut self.cursor_id);
        if cursor_id != 0 {
            tracing::debug!("Killing cursor {} on {}", cursor_id, self.namespace);
            self.conn
                .send(&Request::KillCursors(KillCursorsMessage::single(cursor_id)))
                .await?;
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state != CursorState::Closed && self.cursor_id != 0 {
            tracing::warn!(
                "Cursor {} on {} dropped without close(); server cursor left open",
                self.cursor_id,
                self.namespace
            );
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace)
            .field("cursor_id", &self.cursor_id)
            .field("buffered", &self.buffer.len())
            .field("delivered", &self.delivered)
            .field("state", &self.state)
            .finish()
    }
}
