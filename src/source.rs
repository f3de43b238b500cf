//! Paginated source client primitives.
//!
//! Upstream APIs expose pagination in one of two shapes: a next-page token
//! embedded in the response body, or an RFC 8288 `Link: <...>; rel="next"`
//! response header. Both are normalized into a [`Cursor`] so the engine can
//! treat every source as "cursor in, cursor out".

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;

use crate::models::RawRecord;
use crate::traits::Connector;

/// Position of the next page of upstream results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Opaque token taken from the response body.
    Token(String),
    /// Absolute URL taken from a `Link` header.
    Link(String),
    /// Number of records already consumed in this window. Issued by the
    /// engine when a full page arrived without an upstream cursor.
    Offset(usize),
}

/// One page request issued by a phase loop.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub stream: String,
    /// Lower bound; connectors should return records updated at or after it.
    pub since: DateTime<Utc>,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

/// One page of upstream results, already mapped to raw records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Upstream items that could not be decoded and were dropped.
    pub skipped: usize,
    pub next_cursor: Option<Cursor>,
}

impl Page {
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<Cursor>) -> Self {
        Self {
            records,
            skipped: 0,
            next_cursor,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of items upstream delivered, including skipped ones.
    pub fn fetched(&self) -> usize {
        self.records.len() + self.skipped
    }
}

/// Normalize either pagination shape into a cursor. A body token wins over
/// a `Link` header; empty tokens mean "no more data".
pub fn next_cursor(body_token: Option<&str>, headers: Option<&HeaderMap>) -> Option<Cursor> {
    if let Some(token) = body_token.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(Cursor::Token(token.to_string()));
    }
    headers
        .and_then(|h| h.get(reqwest::header::LINK))
        .and_then(|v| v.to_str().ok())
        .and_then(parse_next_link)
        .map(Cursor::Link)
}

/// Extract the `rel="next"` target from a `Link` header value.
pub fn parse_next_link(value: &str) -> Option<String> {
    for part in value.split(',') {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|s| {
            let s = s.trim();
            s == "rel=\"next\"" || s == "rel=next"
        });
        if is_next && target.starts_with('<') && target.ends_with('>') {
            let url = &target[1..target.len() - 1];
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// Follow upstream cursors until exhausted and return every record of the
/// window. Only upstream cursors are followed; the orchestrator's
/// page-by-page loop is the one that issues disambiguating fetches.
pub async fn collect_all(connector: &dyn Connector, request: PageRequest) -> Result<Vec<RawRecord>> {
    let mut request = request;
    let mut all = Vec::new();
    loop {
        let page = connector.fetch_page(&request).await?;
        all.extend(page.records);
        match page.next_cursor {
            Some(cursor) => request.cursor = Some(cursor),
            None => break,
        }
    }
    Ok(all)
}
