//! Domain facades: protocol-flavored sugar over the generic client.
//!
//! Facades never speak a wire protocol. They build contexts with protocol
//! extension verbs and metadata (mailbox, range, criteria, envelope fields)
//! and hand them to the underlying [`Client`], whose connector does the I/O.

use bytes::Bytes;
use serde_json::json;

use crate::body::RequestBody;
use crate::client::Client;
use crate::context::Context;
use crate::error::Result;
use crate::response::Response;

/// IMAP-flavored facade.
pub struct ImapSession {
    client: Client,
    base: String,
}

impl ImapSession {
    /// Wraps a client for an IMAP endpoint such as `imap://mail.example.com`.
    pub fn new(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    /// Establishes the connector session.
    pub async fn connect(&self) -> Result<()> {
        self.client.connect(&self.base).await
    }

    /// Tears the connector session down.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    /// Fetches a message range from a mailbox.
    pub async fn fetch(&self, mailbox: &str, range: &str) -> Result<Response> {
        self.client
            .request(Context::verb("FETCH"), &self.mailbox_url(mailbox))
            .metadata("mailbox", json!(mailbox))
            .metadata("range", json!(range))
            .send()
            .await
    }

    /// Searches a mailbox with protocol criteria (e.g. `UNSEEN`).
    pub async fn search(&self, mailbox: &str, criteria: &str) -> Result<Response> {
        self.client
            .request(Context::verb("SEARCH"), &self.mailbox_url(mailbox))
            .metadata("mailbox", json!(mailbox))
            .metadata("criteria", json!(criteria))
            .send()
            .await
    }

    /// Appends a raw message to a mailbox.
    pub async fn append(&self, mailbox: &str, message: impl Into<Bytes>) -> Result<Response> {
        self.client
            .request(Context::verb("APPEND"), &self.mailbox_url(mailbox))
            .metadata("mailbox", json!(mailbox))
            .body(RequestBody::Bytes(message.into()))
            .send()
            .await
    }

    /// Lists mailboxes matching a pattern (e.g. `*`).
    pub async fn list(&self, pattern: &str) -> Result<Response> {
        self.client
            .request(Context::verb("LIST"), &self.base)
            .metadata("pattern", json!(pattern))
            .send()
            .await
    }

    fn mailbox_url(&self, mailbox: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), mailbox)
    }
}

/// An outbound mail message.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// SMTP-flavored facade.
pub struct SmtpSession {
    client: Client,
    base: String,
}

impl SmtpSession {
    /// Wraps a client for an SMTP endpoint such as `smtp://mail.example.com`.
    pub fn new(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    /// Establishes the connector session.
    pub async fn connect(&self) -> Result<()> {
        self.client.connect(&self.base).await
    }

    /// Tears the connector session down.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    /// Submits a message.
    pub async fn send(&self, message: MailMessage) -> Result<Response> {
        self.client
            .request(Context::verb("SEND"), &self.base)
            .metadata("from", json!(message.from))
            .metadata("to", json!(message.to))
            .metadata("subject", json!(message.subject))
            .body(RequestBody::Text(message.body))
            .send()
            .await
    }
}
