//! Query options and the query document sent in OP_QUERY.

use crate::document::{Document, Selector};
use crate::error::ProtocolError;
use crate::message::{Namespace, QueryMessage};
use crate::value::Value;

/// A find request: filter, projection, ordering and paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub selector: Selector,
    /// Fields to return; `None` returns whole documents.
    pub projection: Option<Selector>,
    pub order_by: Option<Selector>,
    /// Name of the index the server should use.
    pub hint: Option<String>,
    pub skip: i32,
    /// Maximum documents delivered to the caller; 0 or less means unlimited.
    pub limit: i32,
    /// Documents per batch; 0 leaves it to the server.
    pub batch_size: i32,
}

impl Query {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    /// A query that matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// A database command: the selector is sent verbatim and one reply
    /// document is requested.
    pub fn command(selector: Selector) -> Self {
        Self::new(selector).limit(1)
    }

    pub fn projection(mut self, fields: Selector) -> Self {
        self.projection = Some(fields);
        self
    }

    pub fn order_by(mut self, order: Selector) -> Self {
        self.order_by = Some(order);
        self
    }

    /// Appends one sort key; `direction` is 1 for ascending, -1 for descending.
    pub fn sort(mut self, field: &str, direction: i32) -> Result<Self, ProtocolError> {
        let order = self.order_by.take().unwrap_or_default();
        self.order_by = Some(order.with(field, direction)?);
        Ok(self)
    }

    pub fn hint(mut self, index_name: impl Into<String>) -> Self {
        self.hint = Some(index_name.into());
        self
    }

    pub fn skip(mut self, n: i32) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: i32) -> Self {
        self.limit = n;
        self
    }

    pub fn batch_size(mut self, n: i32) -> Self {
        self.batch_size = n;
        self
    }

    /// The `numberToReturn` for the first batch.
    ///
    /// A positive limit smaller than the batch size caps the batch.
    pub fn number_to_return(&self) -> i32 {
        if self.limit > 0 && (self.batch_size <= 0 || self.limit < self.batch_size) {
            self.limit
        } else {
            self.batch_size.max(0)
        }
    }

    /// The document the server receives.
    ///
    /// Without an order or hint this is the selector itself. Otherwise the
    /// selector is wrapped as `{query, orderby, $hint}` in that key order.
    pub fn complete_query(&self) -> Document {
        if self.order_by.is_none() && self.hint.is_none() {
            return self.selector.as_document().clone();
        }
        let mut wrapper = Document::with_capacity(3);
        wrapper.insert_unchecked("query".to_string(), self.selector.clone().into());
        if let Some(order) = &self.order_by {
            wrapper.insert_unchecked("orderby".to_string(), order.clone().into());
        }
        if let Some(hint) = &self.hint {
            wrapper.insert_unchecked("$hint".to_string(), Value::String(hint.clone()));
        }
        wrapper
    }
}

impl From<Selector> for Query {
    fn from(selector: Selector) -> Self {
        Self::new(selector)
    }
}

impl QueryMessage {
    pub fn from_query(namespace: Namespace, query: &Query) -> Self {
        let mut message = QueryMessage::new(namespace, query.complete_query())
            .with_skip(query.skip)
            .with_number_to_return(query.number_to_return());
        if let Some(projection) = &query.projection {
            message = message.with_projection(projection.as_document().clone());
        }
        message
    }
}
