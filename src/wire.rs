//! On-wire message codec (RFC 1350 packets plus the RFC 2347 option
//! extension). Pure data transformation; no I/O happens here.

use std::collections::BTreeMap;

use thiserror::Error;

pub const OPCODE_READ: u8 = 1;
pub const OPCODE_WRITE: u8 = 2;
pub const OPCODE_DATA: u8 = 3;
pub const OPCODE_ACK: u8 = 4;
pub const OPCODE_ERROR: u8 = 5;
pub const OPCODE_OACK: u8 = 6;

/// Errors that can arise when decoding a raw datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("impossibly short message")]
    ShortMessage,
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("null terminator not found")]
    UnterminatedNullString,
}

/// TFTP error codes carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,
    NoSuchFile = 1,
    AccessViolation = 2,
    TooMuchData = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionAcknowledgeSurprise = 8,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::NoSuchFile,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::TooMuchData,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionAcknowledgeSurprise,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Option name/value pairs as they appear in requests and option
/// acknowledgements. Keys are lowercased on both encode and decode;
/// `BTreeMap` keeps the encode order deterministic.
pub type Options = BTreeMap<String, String>;

/// A TFTP message and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Read request opening a download.
    Read {
        filename: String,
        mode: String,
        options: Options,
    },

    /// Write request opening an upload.
    Write {
        filename: String,
        mode: String,
        options: Options,
    },

    /// One block of file data. A body strictly shorter than the negotiated
    /// block size marks the final block.
    Data { block: u16, body: Vec<u8> },

    /// Acknowledges a data block; block 0 acknowledges a write request or
    /// an option acknowledgement.
    Ack { block: u16 },

    /// Terminates the exchange.
    Error {
        code: ErrorCode,
        explanation: String,
    },

    /// The server's accepted subset of client-proposed options.
    OAck { options: Options },
}

impl Message {
    /// Encodes into `buf`, clearing it first. Reuses the buffer's capacity
    /// so the per-session send buffer is not reallocated every block.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        match self {
            Message::Read {
                filename,
                mode,
                options,
            } => {
                buf.extend_from_slice(&[0, OPCODE_READ]);
                push_null_string(buf, filename);
                push_null_string(buf, mode);
                push_options(buf, options);
            }
            Message::Write {
                filename,
                mode,
                options,
            } => {
                buf.extend_from_slice(&[0, OPCODE_WRITE]);
                push_null_string(buf, filename);
                push_null_string(buf, mode);
                push_options(buf, options);
            }
            Message::Data { block, body } => {
                buf.extend_from_slice(&[0, OPCODE_DATA]);
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(body);
            }
            Message::Ack { block } => {
                buf.extend_from_slice(&[0, OPCODE_ACK]);
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Message::Error { code, explanation } => {
                buf.extend_from_slice(&[0, OPCODE_ERROR]);
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_null_string(buf, explanation);
            }
            Message::OAck { options } => {
                buf.extend_from_slice(&[0, OPCODE_OACK]);
                push_options(buf, options);
            }
        }
    }

    /// Allocating convenience around [`Message::encode_into`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes one datagram. The final null-terminated string in a buffer
    /// may omit its terminator; everything else is rejected with the
    /// matching [`WireError`].
    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        if buf.len() < 2 {
            return Err(WireError::ShortMessage);
        }
        // leading byte of the opcode is always zero
        if buf[0] != 0 {
            return Err(WireError::UnknownOpcode);
        }

        match buf[1] {
            OPCODE_READ => {
                let (filename, mode, options) = decode_request(buf)?;
                Ok(Message::Read {
                    filename,
                    mode,
                    options,
                })
            }
            OPCODE_WRITE => {
                let (filename, mode, options) = decode_request(buf)?;
                Ok(Message::Write {
                    filename,
                    mode,
                    options,
                })
            }
            OPCODE_DATA => {
                if buf.len() < 4 {
                    return Err(WireError::ShortMessage);
                }
                Ok(Message::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    body: buf[4..].to_vec(),
                })
            }
            OPCODE_ACK => {
                if buf.len() < 4 {
                    return Err(WireError::ShortMessage);
                }
                Ok(Message::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            OPCODE_ERROR => {
                if buf.len() < 8 {
                    return Err(WireError::ShortMessage);
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]).into();
                let mut rest = &buf[4..];
                let explanation = pop_null_string(&mut rest)?;
                Ok(Message::Error { code, explanation })
            }
            OPCODE_OACK => {
                if buf.len() < 6 {
                    return Err(WireError::ShortMessage);
                }
                let mut rest = &buf[2..];
                Ok(Message::OAck {
                    options: pop_option_map(&mut rest)?,
                })
            }
            _ => Err(WireError::UnknownOpcode),
        }
    }
}

fn decode_request(buf: &[u8]) -> Result<(String, String, Options), WireError> {
    if buf.len() < 8 {
        return Err(WireError::ShortMessage);
    }
    let mut rest = &buf[2..];
    let filename = pop_null_string(&mut rest)?;
    let mode = pop_null_string(&mut rest)?.to_lowercase();
    let options = pop_option_map(&mut rest)?;
    Ok((filename, mode, options))
}

fn push_null_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn push_options(buf: &mut Vec<u8>, options: &Options) {
    for (key, value) in options {
        push_null_string(buf, &key.to_lowercase());
        push_null_string(buf, value);
    }
}

/// Pops the next null-terminated string, advancing `buf` past it. When no
/// terminator exists the remainder of the buffer is taken as the string;
/// callers needing a later field will then fail on the emptied buffer.
fn pop_null_string(buf: &mut &[u8]) -> Result<String, WireError> {
    if buf.is_empty() {
        return Err(WireError::UnterminatedNullString);
    }
    match buf.iter().position(|&b| b == 0) {
        Some(end) => {
            let s = String::from_utf8_lossy(&buf[..end]).into_owned();
            *buf = &buf[end + 1..];
            Ok(s)
        }
        None => {
            let s = String::from_utf8_lossy(buf).into_owned();
            *buf = &[];
            Ok(s)
        }
    }
}

fn pop_option_map(buf: &mut &[u8]) -> Result<Options, WireError> {
    let mut options = Options::new();
    while !buf.is_empty() {
        let key = pop_null_string(buf)?.to_lowercase();
        let value = pop_null_string(buf)?;
        options.insert(key, value);
    }
    Ok(options)
}
