// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors returned by the NAT engine

use std::net::Ipv4Addr;

/// Errors of the translation engine and of its administrative operations.
///
/// Messages are the ones reported to operators by the control front end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NatError {
    #[error("Mapping already exist.")]
    AlreadyExists,
    #[error("Mapping not exist.")]
    NoSuchEntry,
    #[error("No such VRF id.")]
    NoSuchFib(u32),
    #[error("External port already in use.")]
    PortInUse(u16),
    #[error("No free outside address and port.")]
    Exhausted,
    #[error("Not supported in static mapping only mode.")]
    FeatureDisabled,
    #[error("Maximum number of translations reached for user {0}.")]
    UserSessionLimitExceeded(Ipv4Addr),
    #[error("Not implemented.")]
    Unimplemented,
    #[error("End address less than start address.")]
    InvalidRange(Ipv4Addr, Ipv4Addr),
}

impl NatError {
    /// Return code of the binary control API for this error.
    #[must_use]
    pub fn api_code(&self) -> i32 {
        match self {
            NatError::NoSuchFib(_) => -3,
            NatError::NoSuchEntry => -6,
            NatError::PortInUse(_) | NatError::InvalidRange(..) => -7,
            NatError::Unimplemented => -9,
            NatError::FeatureDisabled => -30,
            NatError::AlreadyExists => -81,
            // only raised on the packet path, no dedicated code
            NatError::Exhausted | NatError::UserSessionLimitExceeded(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            NatError::PortInUse(3606).to_string(),
            "External port already in use."
        );
        assert_eq!(NatError::NoSuchFib(7).to_string(), "No such VRF id.");
        assert_eq!(NatError::AlreadyExists.to_string(), "Mapping already exist.");
        assert_eq!(
            NatError::InvalidRange(Ipv4Addr::new(1, 1, 1, 9), Ipv4Addr::new(1, 1, 1, 1))
                .to_string(),
            "End address less than start address."
        );
    }

    #[test]
    fn test_api_codes() {
        assert_eq!(NatError::NoSuchFib(1).api_code(), -3);
        assert_eq!(NatError::NoSuchEntry.api_code(), -6);
        assert_eq!(NatError::PortInUse(2000).api_code(), -7);
        assert_eq!(NatError::AlreadyExists.api_code(), -81);
        assert_eq!(NatError::Exhausted.api_code(), -1);
    }
}
