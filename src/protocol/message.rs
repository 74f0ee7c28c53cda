use bytes::Bytes;

use crate::protocol::codec::CodecError;

/// Kind tag of a protocol message. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    Ping = 1,
    RequestRunDir = 2,
    RunDir = 3,
    ParameterNames = 4,
    ObservationNames = 5,
    RequestLinpack = 6,
    Linpack = 7,
    StartRun = 8,
    RunFinished = 9,
    RunFailed = 10,
    RunKilled = 11,
    RequestKill = 12,
    Terminate = 13,
    CorruptMessage = 14,
    Ready = 15,
}

impl MessageKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = CodecError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        let kind = match code {
            1 => MessageKind::Ping,
            2 => MessageKind::RequestRunDir,
            3 => MessageKind::RunDir,
            4 => MessageKind::ParameterNames,
            5 => MessageKind::ObservationNames,
            6 => MessageKind::RequestLinpack,
            7 => MessageKind::Linpack,
            8 => MessageKind::StartRun,
            9 => MessageKind::RunFinished,
            10 => MessageKind::RunFailed,
            11 => MessageKind::RunKilled,
            12 => MessageKind::RequestKill,
            13 => MessageKind::Terminate,
            14 => MessageKind::CorruptMessage,
            15 => MessageKind::Ready,
            other => return Err(CodecError::UnknownKind(other)),
        };
        Ok(kind)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Ping => "PING",
            MessageKind::RequestRunDir => "REQUEST_RUN_DIR",
            MessageKind::RunDir => "RUN_DIR",
            MessageKind::ParameterNames => "PARAM_NAMES",
            MessageKind::ObservationNames => "OBS_NAMES",
            MessageKind::RequestLinpack => "REQUEST_LINPACK",
            MessageKind::Linpack => "LINPACK",
            MessageKind::StartRun => "START_RUN",
            MessageKind::RunFinished => "RUN_FINISHED",
            MessageKind::RunFailed => "RUN_FAILED",
            MessageKind::RunKilled => "RUN_KILLED",
            MessageKind::RequestKill => "REQUEST_KILL",
            MessageKind::Terminate => "TERMINATE",
            MessageKind::CorruptMessage => "CORRUPT_MESSAGE",
            MessageKind::Ready => "READY",
        };
        f.write_str(name)
    }
}

/// One protocol message.
///
/// `group_id` and `run_id` correlate a START_RUN with its eventual
/// RUN_FINISHED / RUN_FAILED / RUN_KILLED reply; control messages use zero.
/// `info_text` is a free-form annotation, `payload` is interpreted per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub group_id: i32,
    pub run_id: i32,
    pub info_text: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        group_id: i32,
        run_id: i32,
        info_text: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind,
            group_id,
            run_id,
            info_text: info_text.into(),
            payload: payload.into(),
        }
    }

    /// A message with no correlation ids, text or payload.
    pub fn control(kind: MessageKind) -> Self {
        Self::new(kind, 0, 0, String::new(), Bytes::new())
    }

    pub fn with_info(mut self, info_text: impl Into<String>) -> Self {
        self.info_text = info_text.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}
