// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use std::io::{self, Cursor, Read};
use std::string::FromUtf8Error;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest array nesting the decoder accepts. Decoding recurses once per level, so this bounds
/// stack usage on hostile input.
pub const MAX_DEPTH: usize = 512;

/// Largest bulk string payload the decoder accepts, same as Redis' `proto-max-bulk-len` default.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The stream ended cleanly, before the first byte of a frame.
    #[error("end of stream")]
    EndOfStream,
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    #[error("malformed length: {0:?}")]
    MalformedLength(String),
    #[error("malformed integer: {0:?}")]
    MalformedInteger(String),
    #[error("bulk string is not terminated by CRLF")]
    MissingTerminator,
    #[error("frame nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("protocol error; invalid frame format")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// The null bulk string, `$-1`.
    Null,
    Array(Vec<Frame>),
    /// The null array, `*-1`.
    NullArray,
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Builds the array of bulk strings clients use to send commands, e.g. `SET foo bar`.
    pub fn command<I, T>(args: I) -> Frame
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let args = args
            .into_iter()
            .map(|arg| Frame::Bulk(Bytes::copy_from_slice(arg.as_ref())))
            .collect();

        Frame::Array(args)
    }

    /// Reads exactly one frame from `src`, leaving the stream positioned right after it.
    ///
    /// Returns [`Error::EndOfStream`] when the stream is exhausted before the frame starts, which
    /// is how callers looping over a stream know they are done. A stream that ends anywhere
    /// after the first byte yields [`Error::Incomplete`] instead.
    pub fn decode<R: Read>(src: &mut R) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = match read_byte(src) {
            Ok(byte) => byte,
            Err(Error::Incomplete) => return Err(Error::EndOfStream),
            Err(err) => return Err(err),
        };

        decode_value(src, first_byte, 0)
    }

    /// Parses a frame out of an in-memory buffer. Running out of buffered bytes, at any point,
    /// is reported as [`Error::Incomplete`].
    ///
    /// Nothing is copied until the whole frame is buffered, so a large bulk string arriving in
    /// many reads is not re-read on every attempt.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        if !src.has_remaining() {
            return Err(Error::Incomplete);
        }

        let start = src.position();
        check(src, 0)?;
        src.set_position(start);

        match Frame::decode(src) {
            Err(Error::EndOfStream) => Err(Error::Incomplete),
            res => res,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    /// Appends the wire encoding of the frame to `dst`.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(u8::from(DataType::SimpleString));
                dst.put_slice(s.as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Error(s) => {
                dst.put_u8(u8::from(DataType::SimpleError));
                dst.put_slice(s.as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Integer(i) => {
                dst.put_u8(u8::from(DataType::Integer));
                dst.put_slice(i.to_string().as_bytes());
                dst.put_slice(CRLF);
            }
            // $<length>\r\n<data>\r\n
            Frame::Bulk(bytes) => {
                dst.put_u8(u8::from(DataType::BulkString));
                dst.put_slice(bytes.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(bytes);
                dst.put_slice(CRLF);
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            // *<number-of-elements>\r\n<element-1>...<element-n>
            Frame::Array(arr) => {
                dst.put_u8(u8::from(DataType::Array));
                dst.put_slice(arr.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                for frame in arr {
                    frame.write_to(dst);
                }
            }
            Frame::NullArray => dst.put_slice(b"*-1\r\n"),
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}", arr.len())?;
                for frame in arr {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}

fn decode_value<R: Read>(src: &mut R, first_byte: u8, depth: usize) -> Result<Frame, Error> {
    match DataType::try_from(first_byte)? {
        DataType::SimpleString => {
            let string = String::from_utf8(read_line(src)?)?;
            Ok(Frame::Simple(string))
        }
        DataType::SimpleError => {
            let string = String::from_utf8(read_line(src)?)?;
            Ok(Frame::Error(string))
        }
        DataType::Integer => {
            let line = read_line(src)?;
            let integer = parse_i64(&line)
                .ok_or_else(|| Error::MalformedInteger(String::from_utf8_lossy(&line).into()))?;

            Ok(Frame::Integer(integer))
        }
        // $<length>\r\n<data>\r\n
        DataType::BulkString => {
            let length = read_length(src)?;
            if length == -1 {
                return Ok(Frame::Null);
            }
            if !(0..=MAX_BULK_LEN).contains(&length) {
                return Err(Error::MalformedLength(length.to_string()));
            }

            // The payload is binary safe, it is never scanned for CRLF.
            let data = read_payload(src, length as usize)?;

            let mut terminator = [0u8; 2];
            read_into(src, &mut terminator)?;
            if &terminator != CRLF {
                return Err(Error::MissingTerminator);
            }

            Ok(Frame::Bulk(Bytes::from(data)))
        }
        // *<number-of-elements>\r\n<element-1>...<element-n>
        DataType::Array => {
            let length = read_length(src)?;
            if length == -1 {
                return Ok(Frame::NullArray);
            }
            if length < 0 {
                return Err(Error::MalformedLength(length.to_string()));
            }
            if depth >= MAX_DEPTH {
                return Err(Error::TooDeep(MAX_DEPTH));
            }

            // The declared count is untrusted, cap the up-front allocation.
            let mut frames = Vec::with_capacity(length.min(1024) as usize);
            for _ in 0..length {
                let first_byte = read_byte(src)?;
                frames.push(decode_value(src, first_byte, depth + 1)?);
            }

            Ok(Frame::Array(frames))
        }
    }
}

/// Walks one buffered frame without copying payloads, failing with [`Error::Incomplete`] as soon
/// as the buffer runs out.
fn check(src: &mut Cursor<&[u8]>, depth: usize) -> Result<(), Error> {
    match DataType::try_from(read_byte(src)?)? {
        DataType::SimpleString | DataType::SimpleError | DataType::Integer => {
            skip_line(src)?;
        }
        DataType::BulkString => {
            let length = read_length(src)?;
            if length == -1 {
                return Ok(());
            }
            if !(0..=MAX_BULK_LEN).contains(&length) {
                return Err(Error::MalformedLength(length.to_string()));
            }

            let length = length as usize + CRLF.len();
            if src.remaining() < length {
                return Err(Error::Incomplete);
            }
            src.advance(length);
        }
        DataType::Array => {
            let length = read_length(src)?;
            if length < 0 {
                return Ok(());
            }
            if depth >= MAX_DEPTH {
                return Err(Error::TooDeep(MAX_DEPTH));
            }

            for _ in 0..length {
                check(src, depth + 1)?;
            }
        }
    }

    Ok(())
}

fn skip_line(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
    let start = src.position() as usize;
    let rest = &src.get_ref()[start..];

    let end = rest
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)?;

    src.advance(end + CRLF.len());
    Ok(())
}

/// Reads up to and including the first CRLF, returning the line without it.
fn read_line<R: Read>(src: &mut R) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();
    loop {
        line.push(read_byte(src)?);
        if line.ends_with(CRLF) {
            line.truncate(line.len() - CRLF.len());
            return Ok(line);
        }
    }
}

fn read_length<R: Read>(src: &mut R) -> Result<i64, Error> {
    let line = read_line(src)?;
    parse_i64(&line).ok_or_else(|| Error::MalformedLength(String::from_utf8_lossy(&line).into()))
}

fn parse_i64(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

fn read_payload<R: Read>(src: &mut R, length: usize) -> Result<Vec<u8>, Error> {
    // Grows with the bytes actually read rather than trusting the declared length.
    let mut data = Vec::new();
    Read::take(&mut *src, length as u64).read_to_end(&mut data)?;
    if data.len() < length {
        return Err(Error::Incomplete);
    }
    Ok(data)
}

fn read_byte<R: Read>(src: &mut R) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    read_into(src, &mut byte)?;
    Ok(byte[0])
}

fn read_into<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    src.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::Incomplete,
        _ => Error::Io(err),
    })
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}
