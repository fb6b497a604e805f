//! IMAP session implementation using async-imap
//!
//! One [`ImapSession`] wraps one authenticated protocol session. Sessions
//! are stateful and single-threaded by protocol design; the pool layer is
//! responsible for exclusive access.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mail_parser::MimeHeaders;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::mail::{
    config::{ImapConfig, SecurityType},
    AttachmentMeta, Folder, FolderType, MailError, MailResult, MessageBody, MessageHeader,
    ServerCaps, ThreadNode,
};
use crate::mail::transport::{MailTransport, SessionFactory};
use crate::store::UserId;

type TlsStream = async_native_tls::TlsStream<tokio_util::compat::Compat<tokio::net::TcpStream>>;

/// Fetch attributes for header sync. RFC822.HEADER is included so the
/// References chain can be read; ENVELOPE alone does not carry it.
const HEADER_FETCH_QUERY: &str = "(UID FLAGS ENVELOPE RFC822.HEADER)";

/// Fetch attributes for body sync. PEEK keeps \Seen untouched.
const BODY_FETCH_QUERY: &str = "(UID BODY.PEEK[])";

/// Authenticated IMAP session
pub struct ImapSession {
    session: Option<async_imap::Session<TlsStream>>,
    caps: ServerCaps,
    selected: Option<String>,
}

impl ImapSession {
    /// Connect, authenticate and negotiate capabilities.
    ///
    /// Only connection establishment carries this explicit timeout; command
    /// deadlines are applied by the caller.
    pub async fn connect(config: &ImapConfig, connect_timeout: Duration) -> MailResult<Self> {
        let tls = if config.accept_invalid_certs {
            log::warn!("Accepting invalid TLS certificates for {}", config.host);
            async_native_tls::TlsConnector::new().danger_accept_invalid_certs(true)
        } else {
            async_native_tls::TlsConnector::new()
        };

        let (host, port) = match config.security {
            SecurityType::SSL => (config.host.as_str(), config.port),
            SecurityType::STARTTLS => {
                // No STARTTLS upgrade in the async stack; use implicit TLS
                // on 993 instead.
                (config.host.as_str(), 993)
            }
            SecurityType::NONE => {
                return Err(MailError::Connection(
                    "Insecure connections not supported".to_string(),
                ));
            }
        };

        let address = format!("{}:{}", host, port);

        let stream = tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(&address))
            .await
            .map_err(|_| {
                MailError::Timeout(format!(
                    "connect to {} did not complete within {:?}",
                    address, connect_timeout
                ))
            })?
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let compat_stream = stream.compat();

        let tls_stream = tls
            .connect(host, compat_stream)
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream);

        let mut session = client
            .login(&config.username, &config.password)
            .await
            .map_err(|e| MailError::Authentication(e.0.to_string()))?;

        let caps = session.capabilities().await.map_err(map_imap_err)?;
        let caps = ServerCaps {
            supports_thread: caps.has_str("THREAD=REFERENCES")
                || caps.has_str("THREAD=ORDEREDSUBJECT"),
            supports_special_use: caps.has_str("SPECIAL-USE"),
            supports_idle: caps.has_str("IDLE"),
        };

        log::info!(
            "IMAP connected to {} (thread={}, special-use={}, idle={})",
            config.host,
            caps.supports_thread,
            caps.supports_special_use,
            caps.supports_idle
        );

        Ok(Self {
            session: Some(session),
            caps,
            selected: None,
        })
    }

    /// Get mutable reference to the session
    fn session(&mut self) -> MailResult<&mut async_imap::Session<TlsStream>> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// Select a folder, skipping the round trip when it is already selected
    async fn select(&mut self, folder: &str) -> MailResult<()> {
        let safe_folder = sanitize_folder_name(folder);
        if self.selected.as_deref() == Some(safe_folder.as_str()) {
            return Ok(());
        }

        let session = self.session()?;
        match session.select(&safe_folder).await {
            Ok(_) => {
                self.selected = Some(safe_folder);
                Ok(())
            }
            Err(e) => {
                // Selection state is unknown after a failed SELECT
                self.selected = None;
                Err(map_imap_err(e))
            }
        }
    }
}

#[async_trait]
impl MailTransport for ImapSession {
    fn capabilities(&self) -> ServerCaps {
        self.caps
    }

    async fn list_folders(&mut self) -> MailResult<Vec<Folder>> {
        let special_use = self.caps.supports_special_use;
        let session = self.session()?;

        let mut mailboxes_stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(map_imap_err)?;

        let mut folders = Vec::new();
        while let Some(result) = mailboxes_stream.next().await {
            let mb = result.map_err(map_imap_err)?;
            let name = mb.name().to_string();
            let delimiter = mb
                .delimiter()
                .map(|d: &str| d.to_string())
                .unwrap_or("/".to_string());

            let mut folder_type = if special_use {
                folder_type_from_attrs(mb.attributes())
            } else {
                None
            };
            if folder_type.is_none() {
                folder_type = Some(FolderType::from_name(&name));
            }

            let is_selectable = !mb
                .attributes()
                .iter()
                .any(|a| matches!(a, async_imap::types::NameAttribute::NoSelect));

            folders.push(Folder {
                name: name.split(&delimiter).last().unwrap_or(&name).to_string(),
                path: name,
                folder_type: folder_type.unwrap_or_default(),
                delimiter,
                is_selectable,
                unread_count: 0,
                total_count: 0,
            });
        }

        Ok(folders)
    }

    async fn uid_thread(&mut self, folder: &str) -> MailResult<Vec<ThreadNode>> {
        if !self.caps.supports_thread {
            return Err(MailError::MissingCapability(
                "THREAD=REFERENCES".to_string(),
            ));
        }

        self.select(folder).await?;

        let session = self.session()?;
        let response = session
            .run_command_and_read_response("UID THREAD REFERENCES UTF-8 ALL")
            .await
            .map_err(map_imap_err)?;

        parse_thread_response(&response)
    }

    async fn uid_search(&mut self, folder: &str, query: &str) -> MailResult<Vec<u32>> {
        self.select(folder).await?;

        let query = if query.trim().is_empty() { "ALL" } else { query };

        let session = self.session()?;
        let uids = session.uid_search(query).await.map_err(map_imap_err)?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_headers(&mut self, folder: &str, uids: &[u32]) -> MailResult<Vec<MessageHeader>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        self.select(folder).await?;

        let uid_set = uid_set(uids);
        log::debug!("Fetching headers for {} UIDs in {}", uids.len(), folder);

        let session = self.session()?;
        let mut messages_stream = session
            .uid_fetch(&uid_set, HEADER_FETCH_QUERY)
            .await
            .map_err(map_imap_err)?;

        let mut headers = Vec::new();
        while let Some(result) = messages_stream.next().await {
            let message = result.map_err(map_imap_err)?;

            let uid = match message.uid {
                Some(uid) => uid,
                None => continue,
            };

            let flags_vec: Vec<_> = message.flags().collect();
            let is_read = flags_vec
                .iter()
                .any(|f| matches!(f, async_imap::types::Flag::Seen));
            let is_starred = flags_vec
                .iter()
                .any(|f| matches!(f, async_imap::types::Flag::Flagged));

            let envelope = match message.envelope() {
                Some(envelope) => envelope,
                None => continue,
            };

            let from = envelope
                .from
                .as_ref()
                .and_then(|addrs| addrs.first())
                .map(|addr| {
                    let mailbox = addr
                        .mailbox
                        .as_ref()
                        .map(|m| String::from_utf8_lossy(m).to_string())
                        .unwrap_or_default();
                    let host = addr
                        .host
                        .as_ref()
                        .map(|h| String::from_utf8_lossy(h).to_string())
                        .unwrap_or_default();
                    format!("{}@{}", mailbox, host)
                })
                .unwrap_or_else(|| "unknown".to_string());

            let from_name = envelope
                .from
                .as_ref()
                .and_then(|addrs| addrs.first())
                .and_then(|addr| addr.name.as_ref())
                .map(|n| decode_mime_header(&String::from_utf8_lossy(n)));

            let to: Vec<String> = envelope
                .to
                .as_ref()
                .map(|addrs| {
                    addrs
                        .iter()
                        .map(|addr| {
                            let mailbox = addr
                                .mailbox
                                .as_ref()
                                .map(|m| String::from_utf8_lossy(m).to_string())
                                .unwrap_or_default();
                            let host = addr
                                .host
                                .as_ref()
                                .map(|h| String::from_utf8_lossy(h).to_string())
                                .unwrap_or_default();
                            format!("{}@{}", mailbox, host)
                        })
                        .collect()
                })
                .unwrap_or_default();

            let subject = envelope
                .subject
                .as_ref()
                .map(|s| decode_mime_header(&String::from_utf8_lossy(s)))
                .unwrap_or_else(|| "(No subject)".to_string());

            let message_id = envelope
                .message_id
                .as_ref()
                .map(|id| String::from_utf8_lossy(id).trim().to_string())
                .filter(|id| !id.is_empty());

            let in_reply_to = envelope
                .in_reply_to
                .as_ref()
                .map(|id| String::from_utf8_lossy(id).trim().to_string())
                .filter(|id| !id.is_empty());

            let date = envelope.date.as_ref().and_then(|d| {
                let raw = String::from_utf8_lossy(d);
                chrono::DateTime::parse_from_rfc2822(raw.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&chrono::Utc))
            });

            let references = message
                .header()
                .map(|raw| {
                    let text = String::from_utf8_lossy(raw);
                    parse_message_id_list(&unfold_header(&text, "references").unwrap_or_default())
                })
                .unwrap_or_default();

            headers.push(MessageHeader {
                uid,
                message_id,
                in_reply_to,
                references,
                from,
                from_name,
                to,
                subject,
                date,
                is_read,
                is_starred,
            });
        }

        Ok(headers)
    }

    async fn fetch_bodies(&mut self, folder: &str, uids: &[u32]) -> MailResult<Vec<MessageBody>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        self.select(folder).await?;

        let uid_set = uid_set(uids);
        log::debug!("Fetching bodies for {} UIDs in {}", uids.len(), folder);

        let session = self.session()?;
        let mut messages_stream = session
            .uid_fetch(&uid_set, BODY_FETCH_QUERY)
            .await
            .map_err(map_imap_err)?;

        let mut bodies = Vec::new();
        while let Some(result) = messages_stream.next().await {
            let message = result.map_err(map_imap_err)?;

            let uid = match message.uid {
                Some(uid) => uid,
                None => continue,
            };

            let raw = message.body().unwrap_or(&[]);
            let (body_text, body_html, attachments) = parse_email_body(raw);

            bodies.push(MessageBody {
                uid,
                body_text,
                body_html,
                attachments,
            });
        }

        Ok(bodies)
    }

    async fn noop(&mut self) -> MailResult<()> {
        let session = self.session()?;
        session.noop().await.map_err(map_imap_err)
    }

    async fn idle_wait(&mut self, folder: &str, timeout: Duration) -> MailResult<bool> {
        if !self.caps.supports_idle {
            return Err(MailError::MissingCapability("IDLE".to_string()));
        }

        self.select(folder).await?;

        let session = self.session.take().ok_or(MailError::NotConnected)?;
        let mut idle = session.idle();

        if let Err(e) = idle.init().await {
            // Session stays gone; the pool will evict on the next probe
            return Err(map_imap_err(e));
        }

        let (idle_future, stop_source) = idle.wait();
        let result = tokio::time::timeout(timeout, idle_future).await;
        drop(stop_source);

        let session = idle.done().await.map_err(map_imap_err)?;
        self.session = Some(session);

        match result {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(map_imap_err(e)),
            // Quiet interval; the caller re-issues IDLE
            Err(_) => Ok(false),
        }
    }

    async fn logout(&mut self) -> MailResult<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.map_err(map_imap_err)?;
        }
        Ok(())
    }
}

/// Production session factory: looks up a user's IMAP settings and dials out
pub struct ImapSessionFactory<L> {
    lookup: L,
    connect_timeout: Duration,
}

impl<L> ImapSessionFactory<L>
where
    L: Fn(UserId) -> MailResult<ImapConfig> + Send + Sync,
{
    pub fn new(lookup: L, connect_timeout: Duration) -> Self {
        Self {
            lookup,
            connect_timeout,
        }
    }
}

#[async_trait]
impl<L> SessionFactory for ImapSessionFactory<L>
where
    L: Fn(UserId) -> MailResult<ImapConfig> + Send + Sync,
{
    async fn connect(&self, user_id: UserId) -> MailResult<Box<dyn MailTransport>> {
        let config = (self.lookup)(user_id)?;
        let session = ImapSession::connect(&config, self.connect_timeout).await?;
        Ok(Box::new(session))
    }
}

/// Map async-imap errors into the house taxonomy. Io and lost-connection
/// failures are transport errors; everything else is a protocol error.
fn map_imap_err(e: async_imap::error::Error) -> MailError {
    match e {
        async_imap::error::Error::Io(err) => MailError::Connection(err.to_string()),
        async_imap::error::Error::ConnectionLost => {
            MailError::Connection("connection lost".to_string())
        }
        other => MailError::Imap(other.to_string()),
    }
}

/// Semantic folder type from SPECIAL-USE attributes, if any
fn folder_type_from_attrs(attrs: &[async_imap::types::NameAttribute]) -> Option<FolderType> {
    use async_imap::types::NameAttribute;

    for attr in attrs {
        match attr {
            NameAttribute::Sent => return Some(FolderType::Sent),
            NameAttribute::Drafts => return Some(FolderType::Drafts),
            NameAttribute::Trash => return Some(FolderType::Trash),
            NameAttribute::Junk => return Some(FolderType::Junk),
            NameAttribute::Archive | NameAttribute::All => return Some(FolderType::Archive),
            NameAttribute::Extension(label) => {
                if label.as_ref() == "\\Spam" {
                    return Some(FolderType::Junk);
                }
            }
            _ => {}
        }
    }
    None
}

/// Build an IMAP UID set from a list of UIDs
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the untagged `* THREAD` response into a forest of UID trees.
///
/// REFERENCES semantics: inside a group, a leading UID is the parent of
/// everything that follows it at the same level. A group with several
/// sibling roots describes a thread whose root message is missing; the
/// siblings collapse onto the first one so the thread stays in one piece.
pub fn parse_thread_response(raw: &[u8]) -> MailResult<Vec<ThreadNode>> {
    let text = String::from_utf8_lossy(raw);

    let line = text
        .lines()
        .find(|l| l.trim_start().to_ascii_uppercase().starts_with("* THREAD"))
        .ok_or_else(|| MailError::Imap("missing THREAD response".to_string()))?;

    let body = line.trim_start();
    let body = &body["* THREAD".len()..];

    let tokens = tokenize_thread_line(body)?;
    let mut pos = 0;
    let mut forest = Vec::new();

    while pos < tokens.len() {
        match tokens[pos] {
            ThreadToken::Open => {
                let (nodes, next) = parse_thread_group(&tokens, pos + 1)?;
                pos = next;
                let mut nodes = nodes.into_iter();
                if let Some(mut root) = nodes.next() {
                    root.children.extend(nodes);
                    forest.push(root);
                }
            }
            _ => {
                return Err(MailError::Imap(
                    "malformed THREAD response: expected '('".to_string(),
                ));
            }
        }
    }

    Ok(forest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadToken {
    Open,
    Close,
    Uid(u32),
}

fn tokenize_thread_line(body: &str) -> MailResult<Vec<ThreadToken>> {
    let mut tokens = Vec::new();
    let mut digits = String::new();

    for c in body.chars() {
        match c {
            '(' | ')' | ' ' | '\t' => {
                if !digits.is_empty() {
                    let uid = digits
                        .parse::<u32>()
                        .map_err(|_| MailError::Imap("bad UID in THREAD response".to_string()))?;
                    tokens.push(ThreadToken::Uid(uid));
                    digits.clear();
                }
                match c {
                    '(' => tokens.push(ThreadToken::Open),
                    ')' => tokens.push(ThreadToken::Close),
                    _ => {}
                }
            }
            '0'..='9' => digits.push(c),
            _ => {
                return Err(MailError::Imap(format!(
                    "unexpected character '{}' in THREAD response",
                    c
                )));
            }
        }
    }

    if !digits.is_empty() {
        let uid = digits
            .parse::<u32>()
            .map_err(|_| MailError::Imap("bad UID in THREAD response".to_string()))?;
        tokens.push(ThreadToken::Uid(uid));
    }

    Ok(tokens)
}

/// Parse tokens inside one parenthesized group, starting after its '('.
/// Returns the group's sibling roots and the position after its ')'.
fn parse_thread_group(
    tokens: &[ThreadToken],
    mut pos: usize,
) -> MailResult<(Vec<ThreadNode>, usize)> {
    match tokens.get(pos) {
        Some(ThreadToken::Uid(uid)) => {
            // A UID heads the group; the rest of the group descends from it
            let mut node = ThreadNode::new(*uid);
            let (children, next) = parse_thread_group(tokens, pos + 1)?;
            node.children = children;
            Ok((vec![node], next))
        }
        Some(ThreadToken::Open) => {
            // Sibling subtrees (the common parent is absent)
            let mut siblings = Vec::new();
            while let Some(token) = tokens.get(pos) {
                match token {
                    ThreadToken::Open => {
                        let (nodes, next) = parse_thread_group(tokens, pos + 1)?;
                        pos = next;
                        siblings.extend(nodes);
                    }
                    ThreadToken::Close => return Ok((siblings, pos + 1)),
                    ThreadToken::Uid(_) => {
                        return Err(MailError::Imap(
                            "malformed THREAD response: UID after subtree".to_string(),
                        ));
                    }
                }
            }
            Err(MailError::Imap(
                "malformed THREAD response: unbalanced parentheses".to_string(),
            ))
        }
        Some(ThreadToken::Close) => Ok((Vec::new(), pos + 1)),
        None => Err(MailError::Imap(
            "malformed THREAD response: unbalanced parentheses".to_string(),
        )),
    }
}

/// Decode MIME encoded header (RFC 2047)
fn decode_mime_header(input: &str) -> String {
    if !input.contains("=?") {
        return input.to_string();
    }

    let mut result = input.to_string();

    // Handle UTF-8 Base64 encoded strings =?charset?B?text?=
    if let Ok(re_b64) = regex_lite::Regex::new(r"=\?([^?]+)\?[Bb]\?([^?]+)\?=") {
        result = re_b64
            .replace_all(&result, |caps: &regex_lite::Captures| {
                let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .unwrap_or_else(|| encoded.to_string())
            })
            .to_string();
    }

    // Handle quoted-printable =?charset?Q?text?=
    if let Ok(re_qp) = regex_lite::Regex::new(r"=\?([^?]+)\?[Qq]\?([^?]+)\?=") {
        result = re_qp
            .replace_all(&result, |caps: &regex_lite::Captures| {
                let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                decode_quoted_printable(encoded)
            })
            .to_string();
    }

    result.replace('_', " ")
}

/// Decode quoted-printable string
fn decode_quoted_printable(input: &str) -> String {
    let mut result = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '=' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                result.push(byte);
            }
        } else if c == '_' {
            result.push(b' ');
        } else {
            result.push(c as u8);
        }
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Sanitize folder name for IMAP operations to prevent command injection
fn sanitize_folder_name(folder: &str) -> String {
    folder
        .chars()
        .filter(|c| {
            c.is_alphanumeric()
                || *c == '/'
                || *c == '.'
                || *c == '-'
                || *c == '_'
                || *c == '['
                || *c == ']'
                || *c == ' '
        })
        .collect::<String>()
        .replace('\r', "")
        .replace('\n', "")
        .replace('\0', "")
}

/// Extract one header's unfolded value from a raw RFC 5322 header block
fn unfold_header(raw: &str, name: &str) -> Option<String> {
    let mut value: Option<String> = None;

    for line in raw.lines() {
        if let Some(acc) = value.as_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                acc.push(' ');
                acc.push_str(line.trim());
                continue;
            }
            break;
        }

        if let Some((field, rest)) = line.split_once(':') {
            if field.eq_ignore_ascii_case(name) {
                value = Some(rest.trim().to_string());
            }
        }
    }

    value
}

/// Message-IDs (angle-bracketed) from a header value, in order
fn parse_message_id_list(value: &str) -> Vec<String> {
    let Ok(re) = regex_lite::Regex::new(r"<[^<>]+>") else {
        return Vec::new();
    };
    re.find_iter(value).map(|m| m.as_str().to_string()).collect()
}

/// Parse email body using mail-parser
fn parse_email_body(body: &[u8]) -> (Option<String>, Option<String>, Vec<AttachmentMeta>) {
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();

    if let Some(message) = mail_parser::MessageParser::default().parse(body) {
        body_text = message.body_text(0).map(|s| s.to_string());
        body_html = message.body_html(0).map(|s| s.to_string());

        for (index, attachment) in message.attachments().enumerate() {
            let filename = attachment
                .attachment_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("attachment_{}", index));

            let content_type = attachment
                .content_type()
                .map(|ct| ct.ctype().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let size = attachment.contents().len() as u32;

            let content_id = attachment.content_id().map(|id| id.to_string());
            let is_inline = content_id.is_some() || attachment.is_message();

            attachments.push(AttachmentMeta {
                filename,
                content_type,
                size,
                index,
                content_id,
                is_inline,
            });
        }
    }

    (body_text, body_html, attachments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mime_header_plain() {
        assert_eq!(decode_mime_header("Hello World"), "Hello World");
    }

    #[test]
    fn test_decode_mime_header_base64() {
        // "=?UTF-8?B?SGVsbG8=?=" is base64 for "Hello"
        assert_eq!(decode_mime_header("=?UTF-8?B?SGVsbG8=?="), "Hello");
    }

    #[test]
    fn test_uid_set_formatting() {
        assert_eq!(uid_set(&[1, 5, 9]), "1,5,9");
        assert_eq!(uid_set(&[42]), "42");
    }

    #[test]
    fn test_unfold_header_continuation() {
        let raw = "Subject: hi\r\nReferences: <a@x>\r\n <b@y>\r\nFrom: c@z\r\n";
        let refs = unfold_header(raw, "References").unwrap();
        assert_eq!(parse_message_id_list(&refs), vec!["<a@x>", "<b@y>"]);
    }

    #[test]
    fn test_unfold_header_missing() {
        assert_eq!(unfold_header("Subject: hi\r\n", "References"), None);
    }

    #[test]
    fn test_parse_thread_flat_forest() {
        let forest = parse_thread_response(b"* THREAD (166)(167)(168 169)\r\n").unwrap();
        assert_eq!(forest.len(), 3);
        assert_eq!(forest[0].uid, 166);
        assert_eq!(forest[2].uid, 168);
        assert_eq!(forest[2].children.len(), 1);
        assert_eq!(forest[2].children[0].uid, 169);
    }

    #[test]
    fn test_parse_thread_nested_subtrees() {
        // 3 is root; 6 replies to 3; 4 and 44 both reply to 6
        let forest = parse_thread_response(b"* THREAD (3 6 (4)(44))\r\n").unwrap();
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(root.uid, 3);
        assert_eq!(root.children.len(), 1);
        let child = &root.children[0];
        assert_eq!(child.uid, 6);
        assert_eq!(
            child.children.iter().map(|n| n.uid).collect::<Vec<_>>(),
            vec![4, 44]
        );
    }

    #[test]
    fn test_parse_thread_missing_root_collapses_siblings() {
        let forest = parse_thread_response(b"* THREAD ((170)(171))\r\n").unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].uid, 170);
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].uid, 171);
    }

    #[test]
    fn test_parse_thread_flatten_membership() {
        let forest = parse_thread_response(b"* THREAD (1 2 (3)(4 5))(6)\r\n").unwrap();
        assert_eq!(forest[0].flatten(), vec![1, 2, 3, 4, 5]);
        assert_eq!(forest[1].flatten(), vec![6]);
    }

    #[test]
    fn test_parse_thread_rejects_garbage() {
        assert!(parse_thread_response(b"* THREAD (1 x)\r\n").is_err());
        assert!(parse_thread_response(b"A1 OK done\r\n").is_err());
    }

    #[test]
    fn test_sanitize_folder_name_strips_injection() {
        assert_eq!(
            sanitize_folder_name("INBOX\r\nA1 DELETE INBOX"),
            "INBOXA1 DELETE INBOX"
        );
        assert_eq!(sanitize_folder_name("[Gmail]/Sent Mail"), "[Gmail]/Sent Mail");
    }
}
