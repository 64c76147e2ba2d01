//! The boundary between the core and the out-of-process desktop shell.
//!
//! The core never draws UI; it emits [`UiEvent`]s over an mpsc channel and
//! accepts [`UiCommand`]s back. The shell also reads the call total and
//! uptime through [`crate::bbs::BbsServer`] accessors.

use chrono::{DateTime, Utc};

/// Observable line/session events, each tagged with the line id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    LineRegistered { line: usize },
    LineConnected { line: usize, peer: String },
    LineDisconnected { line: usize },
    LineActivity { line: usize, text: String },
    LineUserBound { line: usize, real_name: String },
    LineUserUnbound { line: usize },
    TransferActive { line: usize, active: bool },
}

/// Commands accepted from the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    DisconnectLine(usize),
    /// Start a local logon on a `local`-typed line.
    LogonLine(usize),
    ViewLine(usize),
    SetAcceptingConnections(bool),
    SetChatPager(bool),
}

/// Terminal status of one call, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Answered,
    Hungup,
    Aborted,
    Rejected,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Answered => "Answered",
            CallStatus::Hungup => "Hungup",
            CallStatus::Aborted => "Aborted",
            CallStatus::Rejected => "Rejected",
        }
    }
}

/// One `Logs/Calls` CSV record: `DD/MM/YYYY,HH:MM:SS,<line>,<user-id>,<status>`.
pub fn call_log_record(
    when: DateTime<Utc>,
    line: usize,
    user_id: Option<u32>,
    status: CallStatus,
) -> String {
    format!(
        "{},{},{},{}",
        when.format("%d/%m/%Y,%H:%M:%S"),
        line,
        user_id.map(|id| id.to_string()).unwrap_or_else(|| "0".into()),
        status.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn call_log_format() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 7, 22, 5, 9).unwrap();
        assert_eq!(
            call_log_record(ts, 3, Some(42), CallStatus::Answered),
            "07/03/2025,22:05:09,3,42,Answered"
        );
        assert_eq!(
            call_log_record(ts, 0, None, CallStatus::Rejected),
            "07/03/2025,22:05:09,0,0,Rejected"
        );
    }
}
