//! Parsing of interactive user commands into wire frames
//!
//! One input line becomes at most one command. Double quotes group words
//! into a single token (`send 2 "hello there"`), matching the interactive
//! syntax users expect from the command loop.

use thiserror::Error;

/// One parsed user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `send <dst> <text>` — route text to a client or room identifier.
    Send { dst: u32, text: String },
    /// `join <room>`
    Join { room: u32 },
    /// `leave <room>`
    Leave { room: u32 },
    /// `connect` — register this client's identifier.
    Connect,
    /// `disconnect` — unregister this client's identifier.
    Disconnect,
    /// `exit` — leave the interactive loop; nothing goes on the wire.
    Exit,
}

impl Command {
    /// Encodes this command as the frame to send, with `ident` as the
    /// source. `Exit` is purely local and encodes to `None`.
    pub fn to_frame(&self, ident: u32) -> Option<Vec<u8>> {
        match self {
            Command::Send { dst, text } => {
                Some(shared::encode_send(ident, *dst, 0, text.as_bytes()))
            }
            Command::Join { room } => Some(shared::encode_join(ident, *room)),
            Command::Leave { room } => Some(shared::encode_leave(ident, *room)),
            Command::Connect => Some(shared::encode_connect(ident)),
            Command::Disconnect => Some(shared::encode_disconnect(ident)),
            Command::Exit => None,
        }
    }
}

/// Why an input line did not produce a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// Splits a line into tokens. A `"` toggles quoting; inside quotes spaces
/// are ordinary characters. The quotes themselves are dropped.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut in_quote = false;

    for c in line.chars() {
        if c == '"' {
            in_quote = !in_quote;
            continue;
        }
        if c == ' ' && !in_quote {
            if !token.is_empty() {
                tokens.push(std::mem::take(&mut token));
            }
            continue;
        }
        token.push(c);
    }

    if !token.is_empty() {
        tokens.push(token);
    }

    tokens
}

fn parse_ident(token: &str, usage: &'static str) -> Result<u32, ParseError> {
    token.parse().map_err(|_| ParseError::Usage(usage))
}

/// Parses one input line. Blank lines produce `Ok(None)`; anything else is
/// either a command or a [`ParseError`] to show the user.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let tokens = tokenize(line);
    let verb = match tokens.first() {
        Some(verb) => verb,
        None => return Ok(None),
    };

    let command = match verb.as_str() {
        "send" => {
            if tokens.len() < 3 {
                return Err(ParseError::Usage("send <dst> <message>"));
            }
            Command::Send {
                dst: parse_ident(&tokens[1], "send <dst> <message>")?,
                text: tokens[2].clone(),
            }
        }
        "join" => {
            if tokens.len() < 2 {
                return Err(ParseError::Usage("join <room>"));
            }
            Command::Join {
                room: parse_ident(&tokens[1], "join <room>")?,
            }
        }
        "leave" => {
            if tokens.len() < 2 {
                return Err(ParseError::Usage("leave <room>"));
            }
            Command::Leave {
                room: parse_ident(&tokens[1], "leave <room>")?,
            }
        }
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "exit" => Command::Exit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };

    Ok(Some(command))
}
