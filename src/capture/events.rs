//! Protocol events delivered by a transport for one transaction.

use axum::body::Bytes;

use crate::archive::model::Header;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub version: String,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone)]
pub enum RequestEvent {
    Head(RequestHead),
    Chunk(Bytes),
    End,
}

/// Response body chunks are accepted but never captured.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    Head(ResponseHead),
    Chunk(Bytes),
    End,
}

/// Which half of the transaction an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Request,
    Response,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Request => f.write_str("request"),
            Side::Response => f.write_str("response"),
        }
    }
}
