//! Device activation gate consulted before connecting

use futures_util::future::BoxFuture;

/// Result of asking the registration service about this device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationStatus {
    pub needs_activation: bool,
    /// Code the user enters out of band to confirm the device
    pub verification_code: Option<String>,
    pub challenge: Option<String>,
}

/// Precondition checked by `VoiceSession::connect`.
pub trait ActivationGate: Send + Sync {
    fn check_status(&self) -> BoxFuture<'_, anyhow::Result<ActivationStatus>>;

    /// Wait until the device is confirmed. `false` means activation failed
    /// or was abandoned.
    fn activate(&self) -> BoxFuture<'_, anyhow::Result<bool>>;
}

/// Gate for devices that need no activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlreadyActivated;

impl ActivationGate for AlreadyActivated {
    fn check_status(&self) -> BoxFuture<'_, anyhow::Result<ActivationStatus>> {
        Box::pin(async { Ok(ActivationStatus::default()) })
    }

    fn activate(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async { Ok(true) })
    }
}
