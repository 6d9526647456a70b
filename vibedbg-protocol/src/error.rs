//! The error taxonomy: a fixed table of codes, categories, and suggestions.
//!
//! `ErrorCode` and `ErrorCategory` are plain data, not an exception type —
//! callers match on them instead of catching anything.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidMessage = 1,
    CommandFailed = 2,
    Timeout = 3,
    ConnectionLost = 4,
    InvalidParameter = 5,
    UnknownCommand = 6,
    ExtensionNotLoaded = 7,
    SymbolLoadError = 8,
    MemoryAccessError = 9,
    ProcessNotFound = 10,
    ThreadError = 11,
    InternalError = 16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCategory {
    System = 0,
    Timeout = 1,
    Communication = 2,
    UserInput = 3,
    Extension = 4,
    Symbol = 5,
    Memory = 6,
    Process = 7,
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        use ErrorCategory::*;
        match self {
            ErrorCode::InvalidMessage => System,
            ErrorCode::CommandFailed => System,
            ErrorCode::Timeout => Timeout,
            ErrorCode::ConnectionLost => Communication,
            ErrorCode::InvalidParameter => UserInput,
            ErrorCode::UnknownCommand => UserInput,
            ErrorCode::ExtensionNotLoaded => Extension,
            ErrorCode::SymbolLoadError => Symbol,
            ErrorCode::MemoryAccessError => Memory,
            ErrorCode::ProcessNotFound => Process,
            ErrorCode::ThreadError => Process,
            ErrorCode::InternalError => System,
        }
    }

    /// The fixed suggestion string for this code, per the external-interface table.
    pub fn suggestion(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => {
                "Check message format and ensure it follows the protocol specification"
            }
            ErrorCode::CommandFailed => "Verify the command syntax and try again",
            ErrorCode::Timeout => "Increase timeout value or check if the target is responsive",
            ErrorCode::ExtensionNotLoaded => "Load the extension first using the connect command",
            ErrorCode::ProcessNotFound => "Ensure the target process is running and accessible",
            ErrorCode::MemoryAccessError => "Check memory addresses and permissions",
            _ => "Check the logs for more detailed error information",
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_match_table() {
        assert_eq!(ErrorCode::Timeout.category(), ErrorCategory::Timeout);
        assert_eq!(ErrorCode::ConnectionLost.category(), ErrorCategory::Communication);
        assert_eq!(ErrorCode::InvalidParameter.category(), ErrorCategory::UserInput);
        assert_eq!(ErrorCode::UnknownCommand.category(), ErrorCategory::UserInput);
        assert_eq!(ErrorCode::ExtensionNotLoaded.category(), ErrorCategory::Extension);
        assert_eq!(ErrorCode::SymbolLoadError.category(), ErrorCategory::Symbol);
        assert_eq!(ErrorCode::MemoryAccessError.category(), ErrorCategory::Memory);
        assert_eq!(ErrorCode::ProcessNotFound.category(), ErrorCategory::Process);
        assert_eq!(ErrorCode::ThreadError.category(), ErrorCategory::Process);
        assert_eq!(ErrorCode::InternalError.category(), ErrorCategory::System);
    }

    #[test]
    fn fallback_suggestion_for_uncatalogued_codes() {
        assert_eq!(
            ErrorCode::ThreadError.suggestion(),
            "Check the logs for more detailed error information"
        );
    }
}
