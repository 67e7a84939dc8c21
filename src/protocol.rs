//! Wire protocol framing.
//!
//! Every unit on the wire is either a single-byte command (`ESCAPE, code`)
//! or a block command carrying a payload (`ESCAPE, BLOCK_BEGIN, code,
//! data..., ESCAPE, BLOCK_END`). A literal ESCAPE byte inside block data
//! is doubled on the wire and collapsed back to one byte when decoded.

/// Protocol command codes. All codes live in the `0xF0..=0xFF` range;
/// any byte below that range is never a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    SetCwd = 0xF0,
    SetEnv = 0xF1,
    GetEnv = 0xF2,
    ProcessKill = 0xF3,
    ProcessInterupt = 0xF4,
    ProcessSignal = 0xF5,
    AbortOutput = 0xF6,
    AreYouThere = 0xF7,
    ProcessExecute = 0xF8,
    ProcessWrite = 0xF9,
    ProcessStdout = 0xFA,
    ProcessStderr = 0xFB,
    ProcessExitcode = 0xFC,
    BlockBegin = 0xFD,
    BlockEnd = 0xFE,
    Escape = 0xFF,
}

impl Code {
    /// Maps a raw byte to a command code, `None` for anything outside the
    /// command range.
    pub fn from_byte(byte: u8) -> Option<Code> {
        Some(match byte {
            0xF0 => Code::SetCwd,
            0xF1 => Code::SetEnv,
            0xF2 => Code::GetEnv,
            0xF3 => Code::ProcessKill,
            0xF4 => Code::ProcessInterupt,
            0xF5 => Code::ProcessSignal,
            0xF6 => Code::AbortOutput,
            0xF7 => Code::AreYouThere,
            0xF8 => Code::ProcessExecute,
            0xF9 => Code::ProcessWrite,
            0xFA => Code::ProcessStdout,
            0xFB => Code::ProcessStderr,
            0xFC => Code::ProcessExitcode,
            0xFD => Code::BlockBegin,
            0xFE => Code::BlockEnd,
            0xFF => Code::Escape,
            _ => return None,
        })
    }

    /// Wire name of the command, for logging.
    pub fn name(self) -> &'static str {
        match self {
            Code::SetCwd => "SET_CWD",
            Code::SetEnv => "SET_ENV",
            Code::GetEnv => "GET_ENV",
            Code::ProcessKill => "PROCESS_KILL",
            Code::ProcessInterupt => "PROCESS_INTERUPT",
            Code::ProcessSignal => "PROCESS_SIGNAL",
            Code::AbortOutput => "ABORT_OUTPUT",
            Code::AreYouThere => "ARE_YOU_THERE",
            Code::ProcessExecute => "PROCESS_EXECUTE",
            Code::ProcessWrite => "PROCESS_WRITE",
            Code::ProcessStdout => "PROCESS_STDOUT",
            Code::ProcessStderr => "PROCESS_STDERR",
            Code::ProcessExitcode => "PROCESS_EXITCODE",
            Code::BlockBegin => "BLOCK_BEGIN",
            Code::BlockEnd => "BLOCK_END",
            Code::Escape => "ESCAPE",
        }
    }
}

/// One decoded protocol unit. `data` is `None` for single-byte commands
/// and the unescaped payload for block commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: Code,
    pub data: Option<Vec<u8>>,
}

impl Frame {
    pub fn bare(code: Code) -> Self {
        Self { code, data: None }
    }

    pub fn block(code: Code, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: Some(data.into()),
        }
    }

    /// Serializes the frame back into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        match &self.data {
            Some(data) => encode(self.code, data),
            None => vec![Code::Escape as u8, self.code as u8],
        }
    }
}

/// Encodes a block command, doubling every literal ESCAPE byte in the
/// payload.
pub fn encode(code: Code, data: &[u8]) -> Vec<u8> {
    let escape = Code::Escape as u8;
    let mut out = Vec::with_capacity(data.len() + 6);
    out.push(escape);
    out.push(Code::BlockBegin as u8);
    out.push(code as u8);
    for &byte in data {
        out.push(byte);
        if byte == escape {
            out.push(escape);
        }
    }
    out.push(escape);
    out.push(Code::BlockEnd as u8);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    AwaitEscape,
    AwaitCommand,
    AwaitBlockCommand,
    AwaitBlockData,
    AwaitBlockEscapeOrEnd,
}

/// Streaming frame decoder.
///
/// Fed one byte at a time; a frame is only ever emitted on the transition
/// back to `AwaitEscape`. Malformed sequences never wedge the decoder:
/// any unexpected byte drops it back to `AwaitEscape` so the next
/// well-formed frame decodes normally.
#[derive(Debug)]
pub struct Decoder {
    state: ParserState,
    command: Option<Code>,
    data: Vec<u8>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: ParserState::AwaitEscape,
            command: None,
            data: Vec::new(),
        }
    }

    /// Advances the state machine by one input byte.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        const ESCAPE: u8 = Code::Escape as u8;
        const BLOCK_END: u8 = Code::BlockEnd as u8;

        match self.state {
            ParserState::AwaitEscape => {
                // Anything that is not the escape byte is inert noise.
                if byte == ESCAPE {
                    self.state = ParserState::AwaitCommand;
                }
                None
            }
            ParserState::AwaitCommand => match Code::from_byte(byte) {
                Some(Code::BlockBegin) => {
                    self.state = ParserState::AwaitBlockCommand;
                    None
                }
                Some(code) => {
                    self.state = ParserState::AwaitEscape;
                    Some(Frame::bare(code))
                }
                None => {
                    self.state = ParserState::AwaitEscape;
                    None
                }
            },
            ParserState::AwaitBlockCommand => match Code::from_byte(byte) {
                Some(code) => {
                    self.command = Some(code);
                    self.data.clear();
                    self.state = ParserState::AwaitBlockData;
                    None
                }
                None => {
                    self.state = ParserState::AwaitEscape;
                    None
                }
            },
            ParserState::AwaitBlockData => {
                if byte == ESCAPE {
                    self.state = ParserState::AwaitBlockEscapeOrEnd;
                } else {
                    self.data.push(byte);
                }
                None
            }
            ParserState::AwaitBlockEscapeOrEnd => {
                if byte == ESCAPE {
                    // Doubled escape: one literal ESCAPE byte of payload.
                    self.data.push(ESCAPE);
                    self.state = ParserState::AwaitBlockData;
                    None
                } else if byte == BLOCK_END {
                    self.state = ParserState::AwaitEscape;
                    let code = self.command.take()?;
                    Some(Frame::block(code, std::mem::take(&mut self.data)))
                } else {
                    // Unterminated block: discard and resynchronize.
                    self.command = None;
                    self.data.clear();
                    self.state = ParserState::AwaitEscape;
                    None
                }
            }
        }
    }

    /// Feeds a chunk of bytes, collecting every completed frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|&byte| self.push(byte)).collect()
    }
}
