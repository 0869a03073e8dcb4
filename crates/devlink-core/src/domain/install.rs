//! Install stage machine.
//!
//! Installing a package is a multi-step conversation with the device:
//!
//! ```text
//! Uploading ──> Installing ──> Verifying ──> Done
//!     │             │              │
//!     └─────────────┴──────────────┴──────> Failed
//! ```
//!
//! Each non-terminal stage leaves something behind on the device if it fails
//! half way (a partial upload, an install that was started).  The stage knows
//! which [`CompensatingAction`] undoes that, so the workflow can run the
//! cleanup without ad hoc nested error handling.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current stage of an install job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallStage {
    /// Package bytes are being streamed to the device in chunks.
    Uploading,
    /// The device has been asked to install the uploaded artifact.
    Installing,
    /// Waiting for the device to report that the install completed.
    Verifying,
    /// The app is installed.
    Done,
    /// The job failed; any compensation has already been attempted.
    Failed,
}

/// Action that undoes the device-side effects of a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensatingAction {
    /// Ask the device to discard the uploaded artifact and cancel any install
    /// started from it.
    AbortUpload,
}

impl InstallStage {
    /// Returns the stage that follows a successful completion of `self`, or
    /// `None` for terminal stages.
    pub fn next(self) -> Option<Self> {
        match self {
            InstallStage::Uploading => Some(InstallStage::Installing),
            InstallStage::Installing => Some(InstallStage::Verifying),
            InstallStage::Verifying => Some(InstallStage::Done),
            InstallStage::Done | InstallStage::Failed => None,
        }
    }

    /// Returns the compensating action required when this stage fails.
    ///
    /// Every stage before `Done` may have left an artifact on the device.
    pub fn compensation(self) -> Option<CompensatingAction> {
        match self {
            InstallStage::Uploading | InstallStage::Installing | InstallStage::Verifying => {
                Some(CompensatingAction::AbortUpload)
            }
            InstallStage::Done | InstallStage::Failed => None,
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallStage::Uploading => "uploading",
            InstallStage::Installing => "installing",
            InstallStage::Verifying => "verifying",
            InstallStage::Done => "done",
            InstallStage::Failed => "failed",
        };
        f.write_str(s)
    }
}
