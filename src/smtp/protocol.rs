//! Line-level SMTP state machine for one inbound connection.
//!
//! The session answers protocol-only commands itself (HELO, NOOP, RSET, ...)
//! and hands everything that needs a policy decision back to the caller as a
//! [`SessionEvent`]: recipient acceptance, the start of DATA and the final
//! reply to the message.

use anyhow::Result;
use log::{debug, warn};
use mailparse::{addrparse, MailAddr};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const GREETING: &str = "220 MailCourier ESMTP ready";

/// Longest command line accepted, CRLF included (RFC 5321 §4.5.3.1).
const MAX_COMMAND_LINE: usize = 1000;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    /// Connected, waiting for HELO/EHLO.
    Fresh,
    /// Greeted, no transaction open.
    Ready,
    /// MAIL FROM accepted.
    Sender,
    /// At least one RCPT TO seen.
    Recipients,
    /// Receiving message content.
    Data,
}

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(Option<String>),
    RcptTo(Option<String>),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

/// What the caller must act on after a line has been processed.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Continue,
    Quit,
    /// The peer closed the connection.
    Closed,
    MailFrom(String),
    /// The caller answers with `250` or `550`.
    RcptTo(String),
    /// DATA was requested; the caller either calls [`SmtpSession::begin_data`]
    /// or refuses with `503`.
    DataRequested,
    /// A complete message, dot-unstuffed, with CRLF line endings. The caller
    /// writes the final reply.
    Message(Vec<u8>),
    Reset,
}

pub fn parse_command(line: &str) -> Command {
    let upper = line.to_ascii_uppercase();
    let argument = || line.split_whitespace().nth(1).unwrap_or_default().to_string();

    if upper.starts_with("HELO") {
        Command::Helo(argument())
    } else if upper.starts_with("EHLO") {
        Command::Ehlo(argument())
    } else if upper.starts_with("MAIL FROM:") {
        Command::MailFrom(extract_address(line))
    } else if upper.starts_with("RCPT TO:") {
        Command::RcptTo(extract_address(line))
    } else if upper == "DATA" {
        Command::Data
    } else if upper == "RSET" {
        Command::Rset
    } else if upper.starts_with("NOOP") {
        Command::Noop
    } else if upper == "QUIT" {
        Command::Quit
    } else {
        Command::Unknown(line.to_string())
    }
}

/// Address inside `MAIL FROM:<...>` / `RCPT TO:<...>`, ignoring ESMTP
/// parameters such as `SIZE=`. The null sender `<>` yields an empty string.
fn extract_address(line: &str) -> Option<String> {
    let (_, rest) = line.split_once(':')?;
    let rest = rest.trim();
    let spec = match rest.strip_prefix('<') {
        Some(inner) => inner.split_once('>').map(|(addr, _)| addr)?,
        None => rest.split_whitespace().next().unwrap_or_default(),
    };
    if spec.is_empty() {
        return Some(String::new());
    }

    match addrparse(spec) {
        Ok(list) => match list.first() {
            Some(MailAddr::Single(info)) => Some(info.addr.clone()),
            _ => None,
        },
        Err(e) => {
            warn!("Unparseable address '{}': {}", spec, e);
            None
        }
    }
}

/// Removes the transparency dot from a content line (RFC 5321 §4.5.2).
fn unstuff(line: &[u8]) -> &[u8] {
    line.strip_prefix(b".").unwrap_or(line)
}

/// One read from the peer, without its line terminator.
struct RawLine {
    bytes: Vec<u8>,
    /// The read stopped at the length cap before reaching LF.
    truncated: bool,
}

pub struct SmtpSession<R, W> {
    reader: R,
    writer: W,
    state: SessionState,
    message: Vec<u8>,
    max_message_bytes: usize,
    oversized: bool,
    /// The previous DATA read was cut at the cap; the next read is its tail.
    in_long_line: bool,
}

impl<R, W> SmtpSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, max_message_bytes: usize) -> Self {
        Self {
            reader,
            writer,
            state: SessionState::Fresh,
            message: Vec::new(),
            max_message_bytes,
            oversized: false,
            in_long_line: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn greet(&mut self) -> Result<()> {
        self.reply(GREETING).await
    }

    /// Reads one line and advances the session.
    pub async fn next_event(&mut self) -> Result<SessionEvent> {
        let Some(line) = self.read_line().await? else {
            return Ok(SessionEvent::Closed);
        };

        if self.state == SessionState::Data {
            return self.absorb_data_line(line).await;
        }

        if line.truncated {
            warn!("Command line exceeds {} bytes, closing connection", MAX_COMMAND_LINE);
            self.reply("500 5.5.2 Line too long").await?;
            return Ok(SessionEvent::Quit);
        }

        let line = String::from_utf8_lossy(&line.bytes).trim().to_string();
        debug!("SMTP({:?}) <- {}", self.state, line);
        self.handle_command(parse_command(&line)).await
    }

    async fn handle_command(&mut self, command: Command) -> Result<SessionEvent> {
        use SessionState::*;

        match (self.state, command) {
            (_, Command::Quit) => {
                self.reply("221 Bye").await?;
                Ok(SessionEvent::Quit)
            }
            (_, Command::Noop) => {
                self.reply("250 OK").await?;
                Ok(SessionEvent::Continue)
            }
            (_, Command::Helo(domain)) => {
                self.reply(&format!("250 MailCourier greets {}", or_client(&domain))).await?;
                self.state = Ready;
                Ok(SessionEvent::Reset)
            }
            (_, Command::Ehlo(domain)) => {
                self.reply(&format!("250-MailCourier greets {}", or_client(&domain))).await?;
                self.reply(&format!("250-SIZE {}", self.max_message_bytes)).await?;
                self.reply("250 8BITMIME").await?;
                self.state = Ready;
                Ok(SessionEvent::Reset)
            }
            (Fresh, _) => {
                self.reply("503 Bad sequence of commands (send HELO/EHLO first)").await?;
                Ok(SessionEvent::Continue)
            }
            (_, Command::Rset) => {
                self.reply("250 OK").await?;
                self.state = Ready;
                Ok(SessionEvent::Reset)
            }
            (Ready, Command::MailFrom(Some(sender))) => {
                self.reply("250 OK").await?;
                self.state = Sender;
                Ok(SessionEvent::MailFrom(sender))
            }
            (Sender | Recipients, Command::RcptTo(Some(recipient))) if !recipient.is_empty() => {
                self.state = Recipients;
                Ok(SessionEvent::RcptTo(recipient))
            }
            (_, Command::MailFrom(None)) => {
                self.reply("501 Syntax error in MAIL FROM parameters").await?;
                Ok(SessionEvent::Continue)
            }
            (_, Command::RcptTo(_)) if matches!(self.state, Sender | Recipients) => {
                self.reply("501 Syntax error in RCPT TO parameters").await?;
                Ok(SessionEvent::Continue)
            }
            (Recipients, Command::Data) => Ok(SessionEvent::DataRequested),
            (_, Command::Unknown(line)) => {
                warn!("Unrecognized SMTP command: {}", line);
                self.reply("500 Command not recognized").await?;
                Ok(SessionEvent::Continue)
            }
            (state, command) => {
                debug!("{:?} is out of sequence in state {:?}", command, state);
                self.reply("503 Bad sequence of commands").await?;
                Ok(SessionEvent::Continue)
            }
        }
    }

    /// Accepts DATA after the caller approved the transaction.
    pub async fn begin_data(&mut self) -> Result<()> {
        self.reply("354 Start mail input; end with <CRLF>.<CRLF>").await?;
        self.message.clear();
        self.oversized = false;
        self.in_long_line = false;
        self.state = SessionState::Data;
        Ok(())
    }

    async fn absorb_data_line(&mut self, line: RawLine) -> Result<SessionEvent> {
        if self.in_long_line {
            self.in_long_line = line.truncated;
            return Ok(SessionEvent::Continue);
        }
        if line.truncated {
            self.mark_oversized();
            self.in_long_line = true;
            return Ok(SessionEvent::Continue);
        }

        let line = line.bytes.as_slice();
        if line == b"." {
            self.state = SessionState::Ready;
            let message = std::mem::take(&mut self.message);
            if self.oversized {
                self.reply("552 Message exceeds fixed maximum message size").await?;
                return Ok(SessionEvent::Continue);
            }
            debug!("SMTP message complete ({} bytes)", message.len());
            return Ok(SessionEvent::Message(message));
        }

        let content = unstuff(line);
        if self.message.len() + content.len() + 2 > self.max_message_bytes {
            self.mark_oversized();
        } else if !self.oversized {
            self.message.extend_from_slice(content);
            self.message.extend_from_slice(b"\r\n");
        }
        Ok(SessionEvent::Continue)
    }

    fn mark_oversized(&mut self) {
        if !self.oversized {
            warn!("Message exceeds {} bytes, discarding content", self.max_message_bytes);
        }
        self.oversized = true;
        self.message = Vec::new();
    }

    /// Reads up to the next LF, or `None` at EOF.
    ///
    /// A single read never buffers more than one command line, or one
    /// maximum-size message line while in DATA.
    async fn read_line(&mut self) -> Result<Option<RawLine>> {
        let limit = if self.state == SessionState::Data {
            self.max_message_bytes + 2
        } else {
            MAX_COMMAND_LINE
        };

        let mut buffer = Vec::new();
        let read = (&mut self.reader)
            .take(limit as u64)
            .read_until(b'\n', &mut buffer)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        let truncated = read == limit && buffer.last() != Some(&b'\n');
        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }
        Ok(Some(RawLine {
            bytes: buffer,
            truncated,
        }))
    }

    pub async fn reply(&mut self, line: &str) -> Result<()> {
        debug!("SMTP -> {}", line);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn or_client(domain: &str) -> &str {
    if domain.is_empty() {
        "client"
    } else {
        domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn session(input: &str) -> SmtpSession<BufReader<&[u8]>, Vec<u8>> {
        SmtpSession::new(BufReader::new(input.as_bytes()), Vec::new(), 1024)
    }

    fn written(session: &SmtpSession<BufReader<&[u8]>, Vec<u8>>) -> String {
        String::from_utf8_lossy(&session.writer).to_string()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("HELO relay.x.com"), Command::Helo("relay.x.com".into()));
        assert_eq!(parse_command("ehlo"), Command::Ehlo(String::new()));
        assert_eq!(
            parse_command("MAIL FROM:<a@x.com> SIZE=1000"),
            Command::MailFrom(Some("a@x.com".into()))
        );
        assert_eq!(parse_command("MAIL FROM:<>"), Command::MailFrom(Some(String::new())));
        assert_eq!(
            parse_command("rcpt to: inbox@y.com"),
            Command::RcptTo(Some("inbox@y.com".into()))
        );
        assert_eq!(parse_command("RCPT TO:<broken"), Command::RcptTo(None));
        assert_eq!(parse_command("data"), Command::Data);
        assert_eq!(parse_command("RSET"), Command::Rset);
        assert_eq!(parse_command("NOOP ping"), Command::Noop);
        assert_eq!(parse_command("QUIT"), Command::Quit);
        assert_eq!(parse_command("VRFY root"), Command::Unknown("VRFY root".into()));
    }

    #[test]
    fn test_unstuff() {
        assert_eq!(unstuff(b"..leading dot"), b".leading dot");
        assert_eq!(unstuff(b"..."), b"..");
        assert_eq!(unstuff(b".single"), b"single");
        assert_eq!(unstuff(b"plain"), b"plain");
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let mut s = session(
            "EHLO relay\r\nMAIL FROM:<a@x.com>\r\nRCPT TO:<inbox@y.com>\r\nDATA\r\n\
             Subject: Hi\r\n\r\n..dotted\r\nbody\r\n.\r\nQUIT\r\n",
        );
        s.greet().await.unwrap();

        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Reset);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::MailFrom("a@x.com".into()));
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::RcptTo("inbox@y.com".into()));
        assert_eq!(s.state(), SessionState::Recipients);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::DataRequested);
        s.begin_data().await.unwrap();

        let mut event = s.next_event().await.unwrap();
        while event == SessionEvent::Continue {
            event = s.next_event().await.unwrap();
        }
        assert_eq!(
            event,
            SessionEvent::Message(b"Subject: Hi\r\n\r\n.dotted\r\nbody\r\n".to_vec())
        );
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Quit);

        let out = written(&s);
        assert!(out.starts_with("220 MailCourier"));
        assert!(out.contains("250-SIZE 1024\r\n250 8BITMIME\r\n"));
        assert!(out.contains("354 Start mail input"));
        assert!(out.ends_with("221 Bye\r\n"));
    }

    #[tokio::test]
    async fn test_commands_out_of_sequence() {
        let mut s = session("MAIL FROM:<a@x.com>\r\nHELO x\r\nRCPT TO:<b@y.com>\r\nDATA\r\n");
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Continue);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Reset);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Continue);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Continue);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Closed);

        let out = written(&s);
        assert_eq!(out.matches("503 Bad sequence").count(), 3, "Got: {}", out);
    }

    #[tokio::test]
    async fn test_rset_clears_transaction() {
        let mut s = session("HELO x\r\nMAIL FROM:<a@x.com>\r\nRSET\r\nRCPT TO:<b@y.com>\r\n");
        s.next_event().await.unwrap();
        s.next_event().await.unwrap();
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Reset);
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Continue);
        assert!(written(&s).ends_with("503 Bad sequence of commands\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let big = "x".repeat(2000);
        let input = format!("HELO x\r\nMAIL FROM:<a@x.com>\r\nRCPT TO:<b@y.com>\r\nDATA\r\n{}\r\n.\r\n", big);
        let mut s = session(&input);
        for _ in 0..3 {
            s.next_event().await.unwrap();
        }
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::DataRequested);
        s.begin_data().await.unwrap();
        // Capped head of the long line, its tail, then the terminator.
        for _ in 0..3 {
            assert_eq!(s.next_event().await.unwrap(), SessionEvent::Continue);
        }
        assert!(written(&s).ends_with("552 Message exceeds fixed maximum message size\r\n"));
        assert_eq!(s.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_reads_are_bounded_without_line_feed() {
        let flood = "x".repeat(1_000_000);

        let mut s = session(&flood);
        let line = s.read_line().await.unwrap().unwrap();
        assert!(line.truncated);
        assert_eq!(line.bytes.len(), MAX_COMMAND_LINE);

        let mut s = session(&flood);
        s.state = SessionState::Data;
        let line = s.read_line().await.unwrap().unwrap();
        assert!(line.truncated);
        assert_eq!(line.bytes.len(), 1024 + 2);
    }

    #[tokio::test]
    async fn test_overlong_command_line_closes_session() {
        let input = format!("EHLO {}\r\nQUIT\r\n", "a".repeat(5000));
        let mut s = session(&input);
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Quit);
        assert!(written(&s).ends_with("500 5.5.2 Line too long\r\n"));
    }

    #[tokio::test]
    async fn test_dot_in_tail_of_long_line_does_not_end_data() {
        let input = format!(
            "HELO x\r\nMAIL FROM:<a@x.com>\r\nRCPT TO:<b@y.com>\r\nDATA\r\n{}.\r\nmore\r\n.\r\n",
            "x".repeat(1024 + 2)
        );
        let mut s = session(&input);
        for _ in 0..3 {
            s.next_event().await.unwrap();
        }
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::DataRequested);
        s.begin_data().await.unwrap();

        let mut event = s.next_event().await.unwrap();
        while event == SessionEvent::Continue && s.state() == SessionState::Data {
            event = s.next_event().await.unwrap();
        }
        assert_eq!(s.next_event().await.unwrap(), SessionEvent::Closed);
        let out = written(&s);
        assert!(out.ends_with("552 Message exceeds fixed maximum message size\r\n"), "Got: {}", out);
        assert!(!out.contains("500 "), "tail of the long line was read as a command: {}", out);
    }
}
