//! CoAP message model shared by connections, codecs and observers.

use std::fmt;

use bytes::Bytes;

/// CoAP content-format identifiers used by OCF devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    TextPlain,
    AppJson,
    AppCbor,
    AppOcfCbor,
    Other(u16),
}

impl MediaType {
    /// Map a registered CoAP content-format number to a media type.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => MediaType::TextPlain,
            50 => MediaType::AppJson,
            60 => MediaType::AppCbor,
            10000 => MediaType::AppOcfCbor,
            other => MediaType::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            MediaType::TextPlain => 0,
            MediaType::AppJson => 50,
            MediaType::AppCbor => 60,
            MediaType::AppOcfCbor => 10000,
            MediaType::Other(code) => *code,
        }
    }

    /// Parse the MIME form used by the cloud gateway, e.g. `application/json`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "text/plain" => Some(MediaType::TextPlain),
            "application/json" => Some(MediaType::AppJson),
            "application/cbor" => Some(MediaType::AppCbor),
            "application/vnd.ocf+cbor" => Some(MediaType::AppOcfCbor),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::TextPlain => write!(f, "text/plain"),
            MediaType::AppJson => write!(f, "application/json"),
            MediaType::AppCbor => write!(f, "application/cbor"),
            MediaType::AppOcfCbor => write!(f, "application/vnd.ocf+cbor"),
            MediaType::Other(code) => write!(f, "content-format {}", code),
        }
    }
}

/// CoAP response codes the SDK distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Content,
    Changed,
    Valid,
    BadRequest,
    Forbidden,
    NotFound,
    InternalServerError,
    Other(u8),
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Content => write!(f, "2.05 Content"),
            Code::Changed => write!(f, "2.04 Changed"),
            Code::Valid => write!(f, "2.03 Valid"),
            Code::BadRequest => write!(f, "4.00 Bad Request"),
            Code::Forbidden => write!(f, "4.03 Forbidden"),
            Code::NotFound => write!(f, "4.04 Not Found"),
            Code::InternalServerError => write!(f, "5.00 Internal Server Error"),
            Code::Other(raw) => write!(f, "{}.{:02}", raw >> 5, raw & 0x1f),
        }
    }
}

/// A received CoAP message.
///
/// The body is reference counted, so a message can be cloned into every
/// subscriber and decoded any number of times without copying the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: Code,
    pub content_format: Option<MediaType>,
    /// Observe sequence number for notifications
    pub sequence: Option<u32>,
    pub body: Bytes,
}

impl Message {
    /// A `2.05 Content` message carrying `body` in the given format.
    pub fn content(format: MediaType, body: impl Into<Bytes>) -> Self {
        Self {
            code: Code::Content,
            content_format: Some(format),
            sequence: None,
            body: body.into(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
