//! Binary wire protocol between clients and the service.
//!
//! Frames are `[u32 BE total length][u8 command][payload]`, where the length
//! counts the prefix itself. Strings inside payloads are
//! `[u32 BE byte length][raw bytes]` with no terminator, so scripts and
//! passports may carry arbitrary bytes.

use thiserror::Error;

/// Bytes taken by the length prefix plus the command byte.
pub const HEADER_LEN: usize = 5;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors produced while decoding frames or payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("declared frame length {declared} does not match received {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown command byte {0}")]
    UnknownCommand(u8),

    #[error("payload truncated: {needed} bytes needed at offset {offset}")]
    Truncated { offset: usize, needed: usize },
}

/// Command tag carried in byte 4 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Handshake = 0,
    Run = 1,
    Stop = 2,
    Status = 3,
    Log = 4,
    Result = 5,
}

impl Command {
    /// First byte value that is not a command. Anything at or above it is rejected.
    pub const SENTINEL: u8 = 6;

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::Run),
            2 => Some(Self::Stop),
            3 => Some(Self::Status),
            4 => Some(Self::Log),
            5 => Some(Self::Result),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ProtocolError::UnknownCommand(value))
    }
}

/// Severity attached to task log frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Operation = 0,
    Info = 1,
    Failed = 2,
    Succeed = 3,
}

impl LogLevel {
    /// Console marker used by the local runner.
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Operation => "[*]",
            Self::Info => "[=]",
            Self::Failed => "[-]",
            Self::Succeed => "[+]",
        }
    }

    /// Maps a `logger.<name>` binding to its level.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "operation" => Some(Self::Operation),
            "info" => Some(Self::Info),
            "failed" => Some(Self::Failed),
            "succeed" => Some(Self::Succeed),
            _ => None,
        }
    }
}

/// Reads the declared total length from the first four bytes, if present.
pub fn declared_len(packet: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_LEN] = packet.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Raw command byte at the fixed header offset.
pub fn command_byte(packet: &[u8]) -> Option<u8> {
    packet.get(LENGTH_PREFIX_LEN).copied()
}

/// Validates a complete frame and returns its command and a payload reader.
pub fn decode_frame(packet: &[u8]) -> Result<(Command, PayloadReader<'_>), ProtocolError> {
    if packet.len() < HEADER_LEN {
        return Err(ProtocolError::TooShort(packet.len()));
    }
    let declared = declared_len(packet).ok_or(ProtocolError::TooShort(packet.len()))?;
    if declared != packet.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: packet.len(),
        });
    }
    let command = Command::try_from(packet[LENGTH_PREFIX_LEN])?;
    Ok((command, PayloadReader::new(&packet[HEADER_LEN..])))
}

/// Builds one outbound frame, patching the length prefix on `finish`.
#[derive(Debug)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new(command: Command) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0; LENGTH_PREFIX_LEN]);
        buf.push(command as u8);
        Self { buf }
    }

    #[must_use]
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    #[must_use]
    pub fn bool(self, value: bool) -> Self {
        self.u8(u8::from(value))
    }

    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    #[must_use]
    pub fn bytes(mut self, value: &[u8]) -> Self {
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(&value[..len as usize]);
        self
    }

    #[must_use]
    pub fn string(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = u32::try_from(self.buf.len()).unwrap_or(u32::MAX);
        self.buf[..LENGTH_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
        self.buf
    }
}

/// Cursor over a frame payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(needed)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::Truncated {
                offset: self.pos,
                needed,
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        let len = u32::from_be_bytes(raw) as usize;
        self.take(len)
    }

    /// Reads a string, replacing invalid UTF-8 sequences. Use
    /// [`read_bytes`](Self::read_bytes) where the exact bytes matter.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.read_bytes()?).into_owned())
    }
}

/// Payload of a client `run` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub user_id: u64,
    pub task_id: u64,
    /// Raw language byte; validated by the service.
    pub language: u8,
    pub name: String,
    /// Script source, byte for byte as sent.
    pub script: Vec<u8>,
    pub passport: Vec<u8>,
    /// Comma-joined method names.
    pub call_methods: String,
}

impl RunRequest {
    pub fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_id: reader.read_u64()?,
            task_id: reader.read_u64()?,
            language: reader.read_u8()?,
            name: reader.read_string()?,
            script: reader.read_bytes()?.to_vec(),
            passport: reader.read_bytes()?.to_vec(),
            call_methods: reader.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        FrameWriter::new(Command::Run)
            .u64(self.user_id)
            .u64(self.task_id)
            .u8(self.language)
            .string(&self.name)
            .bytes(&self.script)
            .bytes(&self.passport)
            .string(&self.call_methods)
            .finish()
    }
}

pub fn handshake_request(secret: &[u8]) -> Vec<u8> {
    FrameWriter::new(Command::Handshake).bytes(secret).finish()
}

pub fn handshake_reply(ok: bool) -> Vec<u8> {
    FrameWriter::new(Command::Handshake).bool(ok).finish()
}

/// `runner_id == 0` means the sandbox could not be created.
pub fn run_reply(runner_id: u64) -> Vec<u8> {
    FrameWriter::new(Command::Run)
        .bool(runner_id != 0)
        .u64(runner_id)
        .finish()
}

pub fn runner_request(command: Command, runner_id: u64) -> Vec<u8> {
    FrameWriter::new(command).u64(runner_id).finish()
}

pub fn stop_reply(accepted: bool) -> Vec<u8> {
    FrameWriter::new(Command::Stop).bool(accepted).finish()
}

pub fn status_reply(status: u8) -> Vec<u8> {
    FrameWriter::new(Command::Status).u8(status).finish()
}

pub fn log_frame(user_id: u64, task_id: u64, level: LogLevel, name: &str, message: &str) -> Vec<u8> {
    FrameWriter::new(Command::Log)
        .u64(user_id)
        .u64(task_id)
        .u8(level as u8)
        .string(name)
        .string(message)
        .finish()
}

pub fn result_frame(user_id: u64, task_id: u64, result: bool, runner_id: u64) -> Vec<u8> {
    FrameWriter::new(Command::Result)
        .u64(user_id)
        .u64(task_id)
        .bool(result)
        .u64(runner_id)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_counts_itself() {
        let frame = handshake_reply(true);
        assert_eq!(frame, vec![0, 0, 0, 6, 0, 1]);
        assert_eq!(declared_len(&frame), Some(frame.len()));
    }

    #[test]
    fn strings_are_length_prefixed_not_terminated() {
        let frame = handshake_request(b"a\0b");
        assert_eq!(&frame[HEADER_LEN..], &[0, 0, 0, 3, b'a', 0, b'b']);

        let (command, mut reader) = decode_frame(&frame).unwrap();
        assert_eq!(command, Command::Handshake);
        assert_eq!(reader.read_bytes().unwrap(), b"a\0b");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn run_request_decodes_all_fields() {
        let request = RunRequest {
            user_id: 7,
            task_id: 9,
            language: 2,
            name: "demo".into(),
            script: "function main() { return true; }".into(),
            passport: "token".into(),
            call_methods: "main,other".into(),
        };
        let frame = request.encode();
        let (command, mut reader) = decode_frame(&frame).unwrap();
        assert_eq!(command, Command::Run);
        assert_eq!(RunRequest::decode(&mut reader).unwrap(), request);
    }

    #[test]
    fn script_and_passport_keep_arbitrary_bytes() {
        let frame = FrameWriter::new(Command::Run)
            .u64(1)
            .u64(2)
            .u8(0)
            .string("raw")
            .bytes(&[0xff, 0xfe])
            .bytes(&[0xff, 0xfe])
            .string("main")
            .finish();
        let (_, mut reader) = decode_frame(&frame).unwrap();
        let request = RunRequest::decode(&mut reader).unwrap();
        assert_eq!(request.script, vec![0xff, 0xfe]);
        assert_eq!(request.passport, vec![0xff, 0xfe]);
        assert_eq!(request.encode(), frame);
        assert_eq!(PayloadReader::new(&[0, 0, 0, 2, 0xff, 0xfe]).read_bytes().unwrap(), &[0xff, 0xfe]);
    }

    #[test]
    fn rejects_declared_length_mismatch() {
        let mut frame = handshake_reply(true);
        frame.push(0);
        assert_eq!(
            decode_frame(&frame).unwrap_err(),
            ProtocolError::LengthMismatch {
                declared: 6,
                actual: 7
            }
        );
    }

    #[test]
    fn rejects_commands_at_or_above_sentinel() {
        let frame = vec![0, 0, 0, 5, Command::SENTINEL];
        assert_eq!(
            decode_frame(&frame).unwrap_err(),
            ProtocolError::UnknownCommand(Command::SENTINEL)
        );
        assert!(Command::from_u8(255).is_none());
        assert_eq!(Command::from_u8(5), Some(Command::Result));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let frame = FrameWriter::new(Command::Status).u8(1).finish();
        let (_, mut reader) = decode_frame(&frame).unwrap();
        assert!(matches!(
            reader.read_u64(),
            Err(ProtocolError::Truncated { offset: 0, needed: 8 })
        ));
    }

    #[test]
    fn string_length_beyond_payload_is_truncated() {
        let frame = FrameWriter::new(Command::Handshake)
            .u64(0xFFFF_FFFF_0000_0000)
            .finish();
        let (_, mut reader) = decode_frame(&frame).unwrap();
        assert!(reader.read_bytes().is_err());
    }

    #[test]
    fn result_frame_layout() {
        let frame = result_frame(1, 2, true, 3);
        let (command, mut reader) = decode_frame(&frame).unwrap();
        assert_eq!(command, Command::Result);
        assert_eq!(reader.read_u64().unwrap(), 1);
        assert_eq!(reader.read_u64().unwrap(), 2);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u64().unwrap(), 3);
    }

    #[test]
    fn log_levels_map_from_binding_names() {
        assert_eq!(LogLevel::from_name("failed"), Some(LogLevel::Failed));
        assert_eq!(LogLevel::from_name("debug"), None);
        assert_eq!(LogLevel::Succeed.marker(), "[+]");
    }
}
