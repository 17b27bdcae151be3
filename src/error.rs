//! Fault taxonomy shared by every USBD operation.

use thiserror::Error;

/// Faults reported by a host controller driver, passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HcdFault {
    #[error("endpoint stalled")]
    Stall,
    #[error("babble detected")]
    Babble,
    #[error("CRC or bus timeout")]
    CrcTimeout,
    #[error("bit stuffing error")]
    Bitstuff,
    #[error("short packet")]
    ShortPacket,
    #[error("data toggle mismatch")]
    DataToggle,
    #[error("insufficient bus bandwidth")]
    Bandwidth,
    #[error("SOF interval out of range")]
    SofInterval,
    #[error("host controller fault")]
    General,
}

/// Errors returned by USBD operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbdError {
    #[error("bad or stale handle")]
    BadHandle,
    #[error("bad parameter: {0}")]
    BadParam(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of {0}")]
    OutOfResources(&'static str),
    #[error("internal fault: {0}")]
    General(String),
    #[error("USBD is not initialized")]
    NotInitialized,
    #[error("operation timed out")]
    Timeout,
    #[error("HCD fault: {0}")]
    Hcd(#[from] HcdFault),
    #[error("transfer canceled")]
    Canceled,
    #[error("transfer cannot be canceled")]
    CannotCancel,
    #[error("node is not a hub")]
    NotHub,
    #[error("operation not supported")]
    NotSupported,
}

impl UsbdError {
    /// Faults that leave the referenced object unusable; callers must not retry them.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::BadHandle | Self::NotInitialized)
    }

    /// Transient bus faults a class driver may choose to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Hcd(HcdFault::CrcTimeout)
                | Self::Hcd(HcdFault::Babble)
                | Self::Hcd(HcdFault::Bitstuff)
                | Self::Hcd(HcdFault::DataToggle)
        )
    }
}

pub type Result<T, E = UsbdError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hcd_fault_converts() {
        let err: UsbdError = HcdFault::Bandwidth.into();
        assert_eq!(err, UsbdError::Hcd(HcdFault::Bandwidth));
        assert_eq!(err.to_string(), "HCD fault: insufficient bus bandwidth");
    }

    #[test]
    fn test_classification() {
        assert!(UsbdError::BadHandle.is_structural());
        assert!(!UsbdError::BadHandle.is_transient());
        assert!(UsbdError::Hcd(HcdFault::CrcTimeout).is_transient());
        assert!(!UsbdError::Hcd(HcdFault::Stall).is_transient());
    }
}
