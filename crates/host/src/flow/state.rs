use std::fmt;

/// Lifecycle state of the flow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    /// No flow active.
    #[default]
    Idle,
    /// A flow worker is executing.
    Running,
    /// The flow is blocked on user input.
    Paused,
    /// `resume_flow` was called; the worker is waking up.
    Resuming,
    /// `cancel_flow` was called; waiting for the worker to unwind.
    Cancelling,
}

impl FlowState {
    /// Kebab-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Cancelling => "cancelling",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` is a permitted flow-state transition.
///
/// Pure by contract: all locking lives in the mutating entry point.
/// Same-state is not listed here; the entry point treats it as a no-op.
pub const fn valid_transition(from: FlowState, to: FlowState) -> bool {
    use FlowState::*;
    matches!(
        (from, to),
        (Idle, Running)
            | (Running, Paused)
            | (Running, Cancelling)
            | (Running, Idle)
            | (Paused, Resuming)
            | (Paused, Cancelling)
            | (Paused, Running)
            | (Resuming, Running)
            | (Cancelling, Idle)
    )
}

/// Closed enumeration of flows with their stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FlowType {
    /// Read card info, optionally factory-resetting first.
    GetAppInfo = 0,
    /// Export the full key set of an existing account.
    RecoverAccount = 1,
    /// Initialize and load a new account onto the card.
    LoadAccount = 2,
    /// Export the login (Whisper + encryption) keys.
    Login = 3,
    /// Export public keys for arbitrary paths.
    ExportPublic = 4,
    /// Sign a transaction hash.
    Sign = 5,
    /// Change the PIN.
    ChangePin = 6,
    /// Change the PUK.
    ChangePuk = 7,
    /// Change the pairing password.
    ChangePairing = 8,
    /// Read on-card metadata.
    GetMetadata = 12,
    /// Write on-card metadata.
    StoreMetadata = 13,
}

impl TryFrom<u32> for FlowType {
    type Error = crate::Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::GetAppInfo,
            1 => Self::RecoverAccount,
            2 => Self::LoadAccount,
            3 => Self::Login,
            4 => Self::ExportPublic,
            5 => Self::Sign,
            6 => Self::ChangePin,
            7 => Self::ChangePuk,
            8 => Self::ChangePairing,
            12 => Self::GetMetadata,
            13 => Self::StoreMetadata,
            other => return Err(crate::Error::UnknownFlow(other)),
        })
    }
}
