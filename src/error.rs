//! Error taxonomy for the PS2 runtime core.
//!
//! Every fallible core operation returns a [`Ps2Error`]. The logging policy
//! (see [`log_and_continue`]) is applied once, at the point an error is
//! handled rather than where it is constructed, so one fault produces
//! exactly one diagnostic line.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Ps2Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Ps2Error {
    #[error("unaligned {width}-byte access at {address:#010x}")]
    AlignmentError { address: u32, width: u8 },

    #[error("address {address:#010x} is not mapped to RDRAM, scratchpad or a known I/O region")]
    UnmappedAddressError { address: u32 },

    #[error("invalid GIF tag: {reason}")]
    InvalidGifTag { reason: String },

    #[error("DMA configuration error on channel {channel}: {reason}")]
    DmaConfigError { channel: u8, reason: String },

    #[error("override registration failed: {reason}")]
    OverrideRegistrationError { reason: String },

    #[error("malformed VAG data: {reason}")]
    VagFormatError { reason: String },

    #[error("I/O error: {operation} - {message}")]
    IoError { operation: String, message: String },

    #[error("configuration error: {setting} - {reason}")]
    ConfigurationError { setting: String, reason: String },

    #[error("ELF load failure: {reason}")]
    ElfLoadError { reason: String },
}

impl Ps2Error {
    pub fn alignment(address: u32, width: u8) -> Self {
        Ps2Error::AlignmentError { address, width }
    }

    pub fn unmapped(address: u32) -> Self {
        Ps2Error::UnmappedAddressError { address }
    }

    pub fn invalid_gif_tag(reason: impl Into<String>) -> Self {
        Ps2Error::InvalidGifTag { reason: reason.into() }
    }

    pub fn dma_config(channel: u8, reason: impl Into<String>) -> Self {
        Ps2Error::DmaConfigError { channel, reason: reason.into() }
    }

    pub fn override_registration(reason: impl Into<String>) -> Self {
        Ps2Error::OverrideRegistrationError { reason: reason.into() }
    }

    pub fn vag_format(reason: impl Into<String>) -> Self {
        Ps2Error::VagFormatError { reason: reason.into() }
    }

    pub fn io(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Ps2Error::IoError { operation: operation.into(), message: message.into() }
    }

    pub fn configuration(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Ps2Error::ConfigurationError { setting: setting.into(), reason: reason.into() }
    }

    pub fn elf_load(reason: impl Into<String>) -> Self {
        Ps2Error::ElfLoadError { reason: reason.into() }
    }

    /// Whether the engine can drop the offending packet/tag/access and keep running.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Ps2Error::ElfLoadError { .. } | Ps2Error::ConfigurationError { .. }
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Ps2Error::ElfLoadError { .. } => ErrorSeverity::Critical,
            Ps2Error::ConfigurationError { .. } => ErrorSeverity::Critical,
            Ps2Error::AlignmentError { .. }
            | Ps2Error::UnmappedAddressError { .. }
            | Ps2Error::InvalidGifTag { .. }
            | Ps2Error::DmaConfigError { .. }
            | Ps2Error::VagFormatError { .. } => ErrorSeverity::Warning,
            Ps2Error::OverrideRegistrationError { .. } => ErrorSeverity::Error,
            Ps2Error::IoError { .. } => ErrorSeverity::Error,
        }
    }

    /// Component tag used in the single diagnostic line the policy requires.
    pub fn component(&self) -> &'static str {
        match self {
            Ps2Error::AlignmentError { .. } | Ps2Error::UnmappedAddressError { .. } => "memory",
            Ps2Error::InvalidGifTag { .. } => "gif",
            Ps2Error::DmaConfigError { .. } => "dma",
            Ps2Error::OverrideRegistrationError { .. } => "registry",
            Ps2Error::VagFormatError { .. } => "audio",
            Ps2Error::IoError { .. } => "io",
            Ps2Error::ConfigurationError { .. } => "config",
            Ps2Error::ElfLoadError { .. } => "elf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Log a single diagnostic line for `err` at the severity its kind implies,
/// then let the caller decide whether to continue. Called at every drop
/// site instead of logging ad-hoc at construction time.
pub fn log_and_continue(err: &Ps2Error) {
    match err.severity() {
        ErrorSeverity::Warning => log::warn!(target: "ps2", "[{}] {}", err.component(), err),
        ErrorSeverity::Error => log::error!(target: "ps2", "[{}] {}", err.component(), err),
        ErrorSeverity::Critical => {
            log::error!(target: "ps2", "[{}] CRITICAL: {}", err.component(), err)
        }
    }
}
