// Error taxonomy shared by both backends
//
// Every fallible call returns anyhow::Result. The typed RhiError rides inside
// the anyhow::Error so callers can tell the three failure classes apart with
// `err.downcast_ref::<RhiError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// Device memory or a fixed-size pool ran out. Never transient.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// The caller broke a usage rule of the API.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The active backend cannot do what was asked (format, usage, surface...).
    #[error("unsupported by the {backend} backend: {what}")]
    Unsupported { backend: &'static str, what: String },
}

impl RhiError {
    pub fn is_allocation(&self) -> bool {
        matches!(self, RhiError::Allocation(_))
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, RhiError::ContractViolation(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, RhiError::Unsupported { .. })
    }
}

/// Classify an anyhow error coming out of this crate.
pub fn classify(err: &anyhow::Error) -> Option<&RhiError> {
    err.chain().find_map(|cause| cause.downcast_ref::<RhiError>())
}

/// Bail out of the current function with a contract violation.
macro_rules! violation {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::new($crate::error::RhiError::ContractViolation(format!($($arg)*))))
    };
}

/// Bail out of the current function with an allocation failure.
macro_rules! exhausted {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::new($crate::error::RhiError::Allocation(format!($($arg)*))))
    };
}

/// Bail out of the current function with a capability mismatch.
macro_rules! unsupported {
    ($backend:expr, $($arg:tt)*) => {
        return Err(anyhow::Error::new($crate::error::RhiError::Unsupported {
            backend: $backend,
            what: format!($($arg)*),
        }))
    };
}

pub(crate) use {exhausted, unsupported, violation};

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn fails() -> anyhow::Result<()> {
        violation!("list is {}", "recording")
    }

    #[test]
    fn classify_sees_through_context() {
        let err = fails().context("while submitting").unwrap_err();
        let kind = classify(&err).expect("typed error in chain");
        assert!(kind.is_contract_violation());
        assert_eq!(kind.to_string(), "contract violation: list is recording");
    }

    #[test]
    fn plain_anyhow_errors_are_unclassified() {
        let err = anyhow::anyhow!("vkCreateBuffer failed");
        assert!(classify(&err).is_none());
    }
}
