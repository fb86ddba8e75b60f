//! Transfer progress record for one update attempt.

use std::fmt;

/// Status of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Nothing sent yet.
    #[default]
    Ready,
    /// Prepare acknowledged; packages (or Reset) in flight.
    AwaitingAck,
    /// Reset acknowledged with status 1.
    Succeeded,
    /// Aborted.
    Failed,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Ready => write!(f, "READY"),
            TransferStatus::AwaitingAck => write!(f, "AWAITING_ACK"),
            TransferStatus::Succeeded => write!(f, "SUCCEEDED"),
            TransferStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Progress of a single update attempt.
///
/// Owned and mutated only by the updater; a fresh record is created for
/// every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub status: TransferStatus,
    /// 1-based cursor of the next package to send.
    pub next_package_index: u32,
    /// Empty responses/timeouts since the last acknowledged package.
    pub consecutive_failures: u32,
    pub prepare_acked: bool,
    pub reset_acked: bool,
    /// Device reported a fully standard update. Informational only.
    pub standard_update_hint: bool,
    /// Packages acknowledged during this attempt.
    pub packages_sent: u32,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self {
            status: TransferStatus::Ready,
            next_package_index: 1,
            consecutive_failures: 0,
            prepare_acked: false,
            reset_acked: false,
            standard_update_hint: false,
            packages_sent: 0,
        }
    }
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledged Prepare and the device's resume point.
    pub fn prepare_acknowledged(&mut self, resume_index: u16, standard_update: bool) {
        self.next_package_index = resume_index as u32;
        self.standard_update_hint = standard_update;
        self.prepare_acked = true;
        self.goto(TransferStatus::AwaitingAck);
    }

    /// Record an acknowledged SendData and advance the cursor.
    pub fn package_acknowledged(&mut self) {
        self.consecutive_failures = 0;
        self.next_package_index += 1;
        self.packages_sent += 1;
    }

    /// Record an empty response/timeout. Returns the new failure count.
    pub fn package_failed(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    /// Whether every package up to `package_count` has been acknowledged.
    pub fn transfer_done(&self, package_count: u16) -> bool {
        self.next_package_index > package_count as u32
    }

    /// Record the Reset response. Only status 1 completes the update.
    pub fn reset_acknowledged(&mut self, accepted: bool) {
        self.reset_acked = true;
        if accepted {
            self.goto(TransferStatus::Succeeded);
        }
    }

    pub fn fail(&mut self) {
        self.goto(TransferStatus::Failed);
    }

    fn goto(&mut self, status: TransferStatus) {
        if self.status != status {
            tracing::debug!(from = %self.status, to = %status, "Transfer status");
            self.status = status;
        }
    }
}
