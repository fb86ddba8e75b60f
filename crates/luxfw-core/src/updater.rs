//! Firmware updater - high-level orchestrator for one update attempt.
//!
//! Drives the three update phases over a single connection:
//!
//! 1. **Prepare** (0x21): announce package count and image checksum; the
//!    device answers with the package index it wants next.
//! 2. **SendData** (0x22): push packages from that index on. Empty responses
//!    and read timeouts are retried with a backoff; ten in a row abort.
//! 3. **Reset** (0x23): the device confirms the image with status 1.
//!
//! The connection is released on every exit path before `update_firmware`
//! returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{LogLevel, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
use crate::package::FirmwarePackage;
use crate::protocol::constants::*;
use crate::protocol::{
    DecodeError, DeviceId, FrameBuilder, FrameError, decode_reset_status, decode_resume_index,
    decode_standard_update_flag,
};
use crate::state::TransferProgress;
use crate::transport::{DeviceTransport, ObservableTransport, TcpTransport, TransportError};

/// Configuration for the firmware updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Datalogger address.
    pub host: String,
    /// Datalogger TCP port.
    pub port: u16,
    /// Datalogger serial.
    pub datalog_sn: String,
    /// Inverter/BMS serial. Takes precedence over `datalog_sn` in frames.
    pub inverter_sn: Option<String>,
    /// Connect/read/write timeout.
    pub io_timeout_ms: u64,
    /// Delay after each acknowledged package.
    pub pacing_ms: u64,
    /// Delay before resending an unanswered package.
    pub retry_backoff_ms: u64,
    /// Consecutive unanswered sends before the update is aborted.
    pub max_consecutive_failures: u32,
    /// Emit a progress event every N packages.
    pub progress_interval: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            datalog_sn: DEFAULT_DATALOG_SN.to_string(),
            inverter_sn: None,
            io_timeout_ms: IO_TIMEOUT_MS,
            pacing_ms: PACKAGE_PACING_MS,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdaterConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.io_timeout_ms == 0 {
            anyhow::bail!("io_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Serial encoded into every frame.
    pub fn device_serial(&self) -> &str {
        self.inverter_sn.as_deref().unwrap_or(&self.datalog_sn)
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.device_serial())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Why an update attempt failed.
///
/// By the time a caller sees one of these, the connection is closed.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Connection to device failed: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("{stage}: undecodable response: {source}")]
    ProtocolDecode {
        stage: UpdatePhase,
        #[source]
        source: DecodeError,
    },

    #[error("Transfer: missing data for package {index}")]
    MissingPackageData { index: u16 },

    #[error("No physical address for package {index} (file type 2)")]
    MissingPhysicalAddress { index: u16 },

    #[error("Transfer: cannot frame package {index}: {source}")]
    Frame {
        index: u16,
        #[source]
        source: FrameError,
    },

    #[error("Transfer: package {index} unanswered {failures} times in a row")]
    RetriesExhausted { index: u16, failures: u32 },

    #[error("Reset: device did not confirm the update ({})", describe_status(.status))]
    DeviceRejected { status: Option<u8> },

    #[error("{stage}: transport error{}: {source}", describe_index(.index))]
    Transport {
        stage: UpdatePhase,
        index: Option<u16>,
        #[source]
        source: TransportError,
    },

    #[error("{stage}: cancelled")]
    Cancelled { stage: UpdatePhase },
}

fn describe_status(status: &Option<u8>) -> String {
    match status {
        Some(s) => format!("status {s}"),
        None => "no status in response".to_string(),
    }
}

fn describe_index(index: &Option<u16>) -> String {
    match index {
        Some(i) => format!(" at package {i}"),
        None => String::new(),
    }
}

/// Summary of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub total_packages: u16,
    /// Package the device asked to start from.
    pub resume_index: u16,
    /// Packages acknowledged during this attempt.
    pub packages_sent: u32,
    pub standard_update_hint: bool,
}

/// Cooperative cancellation flag shared with the host.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Firmware updater - pushes one package to one device per call.
pub struct FirmwareUpdater<T: DeviceTransport, O: UpdateObserver> {
    config: UpdaterConfig,
    transport: T,
    observer: Arc<O>,
    cancel: CancelToken,
    progress: TransferProgress,
}

impl FirmwareUpdater<TcpTransport, TracingObserver> {
    /// Create an updater talking TCP with the default tracing observer.
    pub fn new(config: UpdaterConfig) -> Self {
        let transport = TcpTransport::with_timeout(config.io_timeout());
        Self::with_transport(config, transport, Arc::new(TracingObserver))
    }
}

impl<T: DeviceTransport, O: UpdateObserver> FirmwareUpdater<T, O> {
    /// Create an updater with a custom transport and observer.
    pub fn with_transport(config: UpdaterConfig, transport: T, observer: Arc<O>) -> Self {
        Self {
            config,
            transport,
            observer,
            cancel: CancelToken::new(),
            progress: TransferProgress::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Token that aborts a running update at the next phase boundary or
    /// package.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Progress of the most recent attempt.
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Push `package` to the device.
    #[instrument(
        skip_all,
        fields(
            host = %self.config.host,
            port = self.config.port,
            device = %self.config.device_serial()
        )
    )]
    pub fn update_firmware(
        &mut self,
        package: &FirmwarePackage,
    ) -> Result<UpdateReport, UpdateError> {
        self.progress = TransferProgress::new();

        let result = {
            let mut run = UpdateRun {
                transport: ObservableTransport::new(&mut self.transport, self.observer.as_ref()),
                observer: self.observer.as_ref(),
                config: &self.config,
                cancel: &self.cancel,
                progress: &mut self.progress,
                package,
                phase: UpdatePhase::Connecting,
            };
            run.execute()
            // `run` drops here and releases the connection.
        };

        match &result {
            Ok(report) => {
                info!(
                    packages_sent = report.packages_sent,
                    total = report.total_packages,
                    "Firmware update completed successfully"
                );
                self.observer.on_event(&UpdateEvent::Complete);
            }
            Err(e) => {
                self.observer.on_event(&UpdateEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
        result
    }
}

/// Resources borrowed for one update attempt.
///
/// Dropping it closes the connection, so every return path out of
/// [`FirmwareUpdater::update_firmware`] releases the socket.
struct UpdateRun<'a, T: DeviceTransport, O: UpdateObserver> {
    transport: ObservableTransport<'a, T, O>,
    observer: &'a O,
    config: &'a UpdaterConfig,
    cancel: &'a CancelToken,
    progress: &'a mut TransferProgress,
    package: &'a FirmwarePackage,
    phase: UpdatePhase,
}

impl<T: DeviceTransport, O: UpdateObserver> Drop for UpdateRun<'_, T, O> {
    fn drop(&mut self) {
        self.transport.close();
    }
}

impl<T: DeviceTransport, O: UpdateObserver> UpdateRun<'_, T, O> {
    fn execute(&mut self) -> Result<UpdateReport, UpdateError> {
        let result = self.run_phases();
        if let Err(e) = &result {
            // A rejected Reset leaves the record awaiting acknowledgement.
            if !matches!(e, UpdateError::DeviceRejected { .. }) {
                self.progress.fail();
            }
            warn!(phase = %self.phase, error = %e, "Update aborted");
            self.enter(UpdatePhase::Error);
        }
        result
    }

    fn run_phases(&mut self) -> Result<UpdateReport, UpdateError> {
        let package = self.package;
        let total = validate(package)?;
        let frames = FrameBuilder::new(self.config.device_id(), package);

        self.log(
            LogLevel::Info,
            format!(
                "Starting firmware update: {} ({} packages, {} variant)",
                package.name.as_deref().unwrap_or("<unnamed>"),
                total,
                package.variant
            ),
        );

        self.connect()?;
        let resume_index = self.prepare(&frames, total)?;
        self.transfer(&frames, total)?;
        self.reset(&frames)?;

        Ok(UpdateReport {
            total_packages: total,
            resume_index,
            packages_sent: self.progress.packages_sent,
            standard_update_hint: self.progress.standard_update_hint,
        })
    }

    fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UpdateEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn enter(&mut self, phase: UpdatePhase) {
        if self.phase != phase {
            self.emit(UpdateEvent::PhaseChanged {
                from: self.phase,
                to: phase,
            });
            self.phase = phase;
        }
    }

    fn check_cancelled(&self) -> Result<(), UpdateError> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled { stage: self.phase });
        }
        Ok(())
    }

    fn pause(&self, ms: u64) {
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms));
        }
    }

    fn connect(&mut self) -> Result<(), UpdateError> {
        let config = self.config;
        self.check_cancelled()?;
        self.transport
            .connect(&config.host, config.port)
            .map_err(|source| UpdateError::Connection {
                host: config.host.clone(),
                port: config.port,
                source,
            })
    }

    /// Phase 1. Not retried: any failure here aborts the update.
    fn prepare(&mut self, frames: &FrameBuilder<'_>, total: u16) -> Result<u16, UpdateError> {
        self.enter(UpdatePhase::Prepare);
        self.check_cancelled()?;

        let response = self
            .transport
            .send(&frames.prepare())
            .map_err(|source| UpdateError::Transport {
                stage: UpdatePhase::Prepare,
                index: None,
                source,
            })?;

        let decode_error = |source| UpdateError::ProtocolDecode {
            stage: UpdatePhase::Prepare,
            source,
        };
        let resume_index = decode_resume_index(&response, total).map_err(decode_error)?;
        let standard_update = decode_standard_update_flag(&response).map_err(decode_error)?;

        self.progress
            .prepare_acknowledged(resume_index, standard_update);
        info!(
            resume_index,
            standard_update,
            total,
            "Prepare successful, starting from package {}",
            resume_index
        );
        self.emit(UpdateEvent::Resumed {
            index: resume_index,
            standard_update,
        });
        Ok(resume_index)
    }

    /// Phase 2. Sends packages from the resume index through `total`.
    fn transfer(&mut self, frames: &FrameBuilder<'_>, total: u16) -> Result<(), UpdateError> {
        self.enter(UpdatePhase::Transfer);
        let package = self.package;
        let interval = self.config.progress_interval.max(1);

        while !self.progress.transfer_done(total) {
            self.check_cancelled()?;

            // Bounded by `total` while the loop runs.
            let index = self.progress.next_package_index as u16;

            let payload = package
                .payload(index)
                .ok_or(UpdateError::MissingPackageData { index })?;
            let frame = frames.send_data(index, payload).map_err(|e| match e {
                FrameError::MissingPhysicalAddress { index } => {
                    UpdateError::MissingPhysicalAddress { index }
                }
                source => UpdateError::Frame { index, source },
            })?;

            match self.transport.send(&frame) {
                Ok(response) if !response.is_empty() => {
                    self.progress.package_acknowledged();
                    debug!(index, response = %response, "Package acknowledged");
                    if index as u32 % interval == 0 || index == total {
                        self.emit(UpdateEvent::Progress {
                            current: index,
                            total,
                        });
                    }
                    self.pause(self.config.pacing_ms);
                }
                Ok(_) => self.package_unanswered(index)?,
                Err(e) if e.is_transient() => {
                    debug!(index, error = %e, "Send timed out");
                    self.package_unanswered(index)?
                }
                Err(source) => {
                    return Err(UpdateError::Transport {
                        stage: UpdatePhase::Transfer,
                        index: Some(index),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn package_unanswered(&mut self, index: u16) -> Result<(), UpdateError> {
        let failures = self.progress.package_failed();
        if failures >= self.config.max_consecutive_failures.max(1) {
            warn!(index, failures, "Too many errors, aborting update");
            return Err(UpdateError::RetriesExhausted { index, failures });
        }
        self.emit(UpdateEvent::Retry { index, failures });
        self.pause(self.config.retry_backoff_ms);
        Ok(())
    }

    /// Phase 3. Sent once; only status 1 counts as success.
    fn reset(&mut self, frames: &FrameBuilder<'_>) -> Result<(), UpdateError> {
        self.enter(UpdatePhase::Reset);
        self.check_cancelled()?;

        if self.package.variant.uses_lux_reset() {
            debug!("Using Lux reset dialect");
        }

        let response = self
            .transport
            .send(&frames.reset())
            .map_err(|source| UpdateError::Transport {
                stage: UpdatePhase::Reset,
                index: None,
                source,
            })?;

        // Undecodable and non-1 statuses are the same outcome.
        let status = decode_reset_status(&response).ok();
        let accepted = status == Some(RESET_STATUS_ACCEPTED);
        self.progress.reset_acknowledged(accepted);

        if !accepted {
            warn!(?status, response = %response, "Reset not confirmed by device");
            return Err(UpdateError::DeviceRejected { status });
        }

        self.enter(UpdatePhase::Complete);
        Ok(())
    }
}

/// Check that the package can be pushed and return its package count.
fn validate(package: &FirmwarePackage) -> Result<u16, UpdateError> {
    if !package.done_download {
        return Err(UpdateError::InvalidPackage(
            "firmware is not fully downloaded".into(),
        ));
    }
    let total = package.package_count();
    if total == 0 {
        return Err(UpdateError::InvalidPackage("package has no data".into()));
    }
    if let Some(index) = package.first_missing_address() {
        return Err(UpdateError::MissingPhysicalAddress { index });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::package::{LuxExtras, ProtocolVariant};
    use crate::state::TransferStatus;
    use crate::transport::{MockReply, MockTransport};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<UpdateEvent>>,
    }

    impl RecordingObserver {
        fn progress(&self) -> Vec<(u16, u16)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    UpdateEvent::Progress { current, total } => Some((*current, *total)),
                    _ => None,
                })
                .collect()
        }

        fn retries(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, UpdateEvent::Retry { .. }))
                .count()
        }

        fn failed(&self) -> bool {
            self.events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, UpdateEvent::Failed { .. }))
        }
    }

    impl UpdateObserver for RecordingObserver {
        fn on_event(&self, event: &UpdateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    /// Cancels the update once package `at` is acknowledged.
    struct CancellingObserver {
        at: u16,
        token: CancelToken,
    }

    impl UpdateObserver for CancellingObserver {
        fn on_event(&self, event: &UpdateEvent) {
            if let UpdateEvent::Progress { current, .. } = event {
                if *current == self.at {
                    self.token.cancel();
                }
            }
        }
    }

    fn fast_config() -> UpdaterConfig {
        UpdaterConfig {
            inverter_sn: Some("BA12345678".into()),
            pacing_ms: 0,
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn firmware(packages: usize) -> FirmwarePackage {
        let mut package = FirmwarePackage::new(1, (packages * 4) as u32, 0xDEADBEEF, *b"TAIL");
        package.split_image(&vec![0x5A; packages * 4], 4).unwrap();
        package
    }

    fn prepare_response(resume: u16) -> Vec<u8> {
        let mut r = vec![0u8; 18];
        r[1] = OP_UPDATE_PREPARE;
        r[16..18].copy_from_slice(&resume.to_le_bytes());
        r
    }

    fn reset_response(status: u8) -> Vec<u8> {
        let mut r = vec![0u8; 17];
        r[1] = OP_UPDATE_RESET;
        r[16] = status;
        r
    }

    const ACK: &[u8] = &[0x00, OP_UPDATE_SEND_DATA, 0x01];

    fn updater(
        mock: &MockTransport,
        config: UpdaterConfig,
    ) -> (
        FirmwareUpdater<MockTransport, RecordingObserver>,
        Arc<RecordingObserver>,
    ) {
        let observer = Arc::new(RecordingObserver::default());
        let updater = FirmwareUpdater::with_transport(config, mock.clone(), observer.clone());
        (updater, observer)
    }

    #[test]
    fn test_end_to_end_success() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        for _ in 0..3 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let (mut updater, observer) = updater(&mock, fast_config());
        let report = updater.update_firmware(&firmware(3)).unwrap();

        assert_eq!(report.total_packages, 3);
        assert_eq!(report.resume_index, 1);
        assert_eq!(report.packages_sent, 3);
        assert_eq!(updater.progress().next_package_index, 4);
        assert_eq!(updater.progress().status, TransferStatus::Succeeded);
        assert!(updater.progress().prepare_acked);
        assert!(updater.progress().reset_acked);
        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.close_count(), 1);
        assert!(!mock.is_connected());
        assert_eq!(
            mock.endpoint(),
            Some((DEFAULT_HOST.to_string(), DEFAULT_PORT))
        );

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0][1], OP_UPDATE_PREPARE);
        assert_eq!(&writes[0][2..12], b"BA12345678");
        for (i, frame) in writes[1..4].iter().enumerate() {
            assert_eq!(frame[1], OP_UPDATE_SEND_DATA);
            assert_eq!(frame[12] as usize, i + 1);
        }
        assert_eq!(writes[4][1], OP_UPDATE_RESET);
        assert_eq!(observer.progress(), vec![(3, 3)]);
    }

    #[test]
    fn test_resumes_from_device_index() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(3));
        mock.queue_response(ACK);
        mock.queue_response(ACK);
        mock.queue_response(&reset_response(1));

        let (mut updater, _) = updater(&mock, fast_config());
        let report = updater.update_firmware(&firmware(4)).unwrap();

        assert_eq!(report.resume_index, 3);
        assert_eq!(report.packages_sent, 2);
        assert_eq!(updater.progress().next_package_index, 5);
        let writes = mock.get_writes();
        assert_eq!(writes[1][12], 3);
        assert_eq!(writes[2][12], 4);
    }

    #[test]
    fn test_out_of_range_resume_starts_over() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(25));
        for _ in 0..2 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let (mut updater, _) = updater(&mock, fast_config());
        let report = updater.update_firmware(&firmware(2)).unwrap();
        assert_eq!(report.resume_index, 1);
        assert_eq!(report.packages_sent, 2);
    }

    #[test]
    fn test_retry_exhaustion() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_empty(10);
        mock.queue_response(ACK);

        let (mut updater, observer) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(3)).unwrap_err();

        assert!(matches!(
            err,
            UpdateError::RetriesExhausted {
                index: 1,
                failures: 10
            }
        ));
        assert_eq!(updater.progress().next_package_index, 1);
        assert_eq!(updater.progress().status, TransferStatus::Failed);
        assert_eq!(mock.get_writes().len(), 11);
        assert_eq!(mock.pending_replies(), 1);
        assert_eq!(mock.close_count(), 1);
        assert_eq!(observer.retries(), 9);
        assert!(observer.failed());
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_empty(2);
        mock.queue(MockReply::Timeout);
        for _ in 0..3 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let (mut updater, observer) = updater(&mock, fast_config());
        updater.update_firmware(&firmware(3)).unwrap();

        assert_eq!(observer.retries(), 3);
        assert_eq!(updater.progress().consecutive_failures, 0);
        let writes = mock.get_writes();
        // Package 1 was sent four times.
        let resends = writes
            .iter()
            .filter(|w| w[1] == OP_UPDATE_SEND_DATA && w[12] == 1)
            .count();
        assert_eq!(resends, 4);
    }

    #[test]
    fn test_failures_reset_after_ack() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_empty(9);
        mock.queue_response(ACK);
        mock.queue_empty(9);
        mock.queue_response(ACK);
        mock.queue_response(&reset_response(1));

        let (mut updater, _) = updater(&mock, fast_config());
        assert!(updater.update_firmware(&firmware(2)).is_ok());
    }

    #[test]
    fn test_empty_prepare_response_is_fatal() {
        let mock = MockTransport::new();
        mock.queue_empty(1);
        mock.queue_response(&prepare_response(1));

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(3)).unwrap_err();

        assert!(matches!(
            err,
            UpdateError::ProtocolDecode {
                stage: UpdatePhase::Prepare,
                ..
            }
        ));
        assert_eq!(mock.get_writes().len(), 1);
        assert_eq!(mock.close_count(), 1);
        assert_eq!(updater.progress().status, TransferStatus::Failed);
    }

    #[test]
    fn test_short_prepare_response_is_fatal() {
        let mock = MockTransport::new();
        mock.queue_response(&[0u8; 17]);

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(3)).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::ProtocolDecode {
                source: DecodeError::ResponseTooShort { needed: 18, actual: 17, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_prepare_timeout_is_fatal() {
        let mock = MockTransport::new();
        mock.queue(MockReply::Timeout);

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(3)).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Transport {
                stage: UpdatePhase::Prepare,
                index: None,
                ..
            }
        ));
        assert_eq!(mock.get_writes().len(), 1);
    }

    #[test]
    fn test_standard_update_hint() {
        let mock = MockTransport::new();
        let mut prepare = prepare_response(0);
        prepare[16] = b'A';
        mock.queue_response(&prepare);
        for _ in 0..3 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let (mut updater, _) = updater(&mock, fast_config());
        let report = updater.update_firmware(&firmware(3)).unwrap();
        assert!(report.standard_update_hint);
        // 'A' (65) is past the package count, so the transfer starts over.
        assert_eq!(report.resume_index, 1);
    }

    #[test]
    fn test_connection_failure() {
        let mock = MockTransport::new();
        mock.refuse_connect();

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(3)).unwrap_err();

        assert!(matches!(err, UpdateError::Connection { port: 8899, .. }));
        assert!(mock.get_writes().is_empty());
        assert_eq!(mock.close_count(), 0);
        assert_eq!(updater.progress().status, TransferStatus::Failed);
    }

    #[test]
    fn test_missing_package_is_fatal() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_response(ACK);
        mock.queue_response(ACK);

        let mut package = firmware(3);
        package.packages.remove(&2);

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&package).unwrap_err();

        assert!(matches!(err, UpdateError::MissingPackageData { index: 2 }));
        assert_eq!(updater.progress().next_package_index, 2);
        assert_eq!(updater.progress().status, TransferStatus::Failed);
        assert_eq!(mock.get_writes().len(), 2);
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_missing_physical_address_rejected_before_connect() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));

        let mut package = firmware(2);
        package.file_type = 2;
        package.physical_addresses.insert(2, 0x0800_0200);

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&package).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::MissingPhysicalAddress { index: 1 }
        ));
        assert_eq!(mock.connect_count(), 0);
        assert!(mock.get_writes().is_empty());
        assert_eq!(updater.progress().status, TransferStatus::Failed);
    }

    #[test]
    fn test_lux_type_2_sends_without_addresses() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_response(ACK);
        mock.queue_response(ACK);
        mock.queue_response(&reset_response(1));

        let mut package = firmware(2);
        package.file_type = 2;
        package.variant = ProtocolVariant::Lux(LuxExtras {
            length_table: [4, 3, 2, 1],
            file_handle_type: None,
        });

        let (mut updater, _) = updater(&mock, fast_config());
        updater.update_firmware(&package).unwrap();
        assert_eq!(&mock.get_writes()[1][17..21], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_write_error_during_transfer_is_fatal() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue(MockReply::WriteError);
        mock.queue_response(ACK);

        let (mut updater, observer) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(3)).unwrap_err();

        assert!(matches!(
            err,
            UpdateError::Transport {
                stage: UpdatePhase::Transfer,
                index: Some(1),
                ..
            }
        ));
        assert_eq!(observer.retries(), 0);
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_reset_rejected() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_response(ACK);
        mock.queue_response(&reset_response(0));

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(1)).unwrap_err();

        assert!(matches!(err, UpdateError::DeviceRejected { status: Some(0) }));
        assert!(updater.progress().reset_acked);
        assert_eq!(updater.progress().status, TransferStatus::AwaitingAck);
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_reset_without_status() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_response(ACK);
        mock.queue_empty(1);

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&firmware(1)).unwrap_err();

        assert!(matches!(err, UpdateError::DeviceRejected { status: None }));
        assert!(updater.progress().reset_acked);
        assert_eq!(updater.progress().status, TransferStatus::AwaitingAck);
    }

    #[test]
    fn test_cancel_before_start() {
        let mock = MockTransport::new();
        let (mut updater, _) = updater(&mock, fast_config());
        updater.cancel_token().cancel();

        let err = updater.update_firmware(&firmware(3)).unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled { .. }));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_cancel_during_transfer_closes_socket() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        for _ in 0..5 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let token = CancelToken::new();
        let observer = Arc::new(CancellingObserver {
            at: 2,
            token: token.clone(),
        });
        let config = UpdaterConfig {
            progress_interval: 1,
            ..fast_config()
        };
        let mut updater = FirmwareUpdater::with_transport(config, mock.clone(), observer)
            .with_cancel_token(token.clone());

        let err = updater.update_firmware(&firmware(5)).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Cancelled {
                stage: UpdatePhase::Transfer
            }
        ));
        assert_eq!(updater.progress().next_package_index, 3);
        assert_eq!(mock.close_count(), 1);
        assert!(!mock.is_connected());

        token.reset();
        assert!(!updater.cancel_token().is_cancelled());
    }

    /// Cancels the update on the first event matching `trigger`.
    struct CancelOn {
        trigger: fn(&UpdateEvent) -> bool,
        token: CancelToken,
    }

    impl UpdateObserver for CancelOn {
        fn on_event(&self, event: &UpdateEvent) {
            if (self.trigger)(event) {
                self.token.cancel();
            }
        }
    }

    fn cancelling_updater(
        mock: &MockTransport,
        trigger: fn(&UpdateEvent) -> bool,
    ) -> FirmwareUpdater<MockTransport, CancelOn> {
        let token = CancelToken::new();
        let observer = Arc::new(CancelOn {
            trigger,
            token: token.clone(),
        });
        FirmwareUpdater::with_transport(fast_config(), mock.clone(), observer)
            .with_cancel_token(token)
    }

    #[test]
    fn test_cancel_before_prepare() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));

        let mut updater =
            cancelling_updater(&mock, |e| matches!(e, UpdateEvent::Connected { .. }));
        let err = updater.update_firmware(&firmware(3)).unwrap_err();

        assert!(matches!(
            err,
            UpdateError::Cancelled {
                stage: UpdatePhase::Prepare
            }
        ));
        assert_eq!(mock.connect_count(), 1);
        assert!(mock.get_writes().is_empty());
        assert_eq!(mock.close_count(), 1);
        assert!(!updater.progress().prepare_acked);
    }

    #[test]
    fn test_cancel_before_reset() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        for _ in 0..3 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let mut updater = cancelling_updater(&mock, |e| {
            matches!(e, UpdateEvent::Progress { current, total } if current == total)
        });
        let err = updater.update_firmware(&firmware(3)).unwrap_err();

        assert!(matches!(
            err,
            UpdateError::Cancelled {
                stage: UpdatePhase::Reset
            }
        ));
        let writes = mock.get_writes();
        assert_eq!(writes.len(), 4);
        assert!(writes.iter().all(|w| w[1] != OP_UPDATE_RESET));
        assert_eq!(mock.pending_replies(), 1);
        assert_eq!(mock.close_count(), 1);
        assert_eq!(updater.progress().next_package_index, 4);
        assert!(!updater.progress().reset_acked);
        assert_eq!(updater.progress().status, TransferStatus::Failed);
    }

    #[test]
    fn test_progress_interval() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        for _ in 0..25 {
            mock.queue_response(ACK);
        }
        mock.queue_response(&reset_response(1));

        let (mut updater, observer) = updater(&mock, fast_config());
        updater.update_firmware(&firmware(25)).unwrap();
        assert_eq!(observer.progress(), vec![(10, 25), (20, 25), (25, 25)]);
    }

    #[test]
    fn test_lux_frames() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_response(ACK);
        mock.queue_response(&reset_response(1));

        let mut package = firmware(1);
        package.variant = ProtocolVariant::Lux(LuxExtras {
            length_table: [0x10, 0x20, 0x30, 0x40],
            file_handle_type: Some(1),
        });
        package.bms_header_id = Some(7);

        let (mut updater, _) = updater(&mock, fast_config());
        updater.update_firmware(&package).unwrap();

        let writes = mock.get_writes();
        assert_eq!(&writes[1][17..21], &[0x10, 0x20, 0x30, 0x40]);
        assert_eq!(&writes[2][13..15], &[7, 0]);
    }

    #[test]
    fn test_incomplete_download_is_rejected() {
        let mock = MockTransport::new();
        let mut package = firmware(2);
        package.done_download = false;

        let (mut updater, _) = updater(&mock, fast_config());
        let err = updater.update_firmware(&package).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidPackage(_)));
        assert_eq!(mock.connect_count(), 0);
    }

    #[test]
    fn test_empty_package_is_rejected() {
        let mock = MockTransport::new();
        let package = FirmwarePackage::new(1, 0, 0, [0; 4]);
        let mut updater =
            FirmwareUpdater::with_transport(fast_config(), mock.clone(), Arc::new(NullObserver));
        assert!(matches!(
            updater.update_firmware(&package),
            Err(UpdateError::InvalidPackage(_))
        ));
    }

    #[test]
    fn test_progress_is_fresh_per_attempt() {
        let mock = MockTransport::new();
        mock.queue_response(&prepare_response(1));
        mock.queue_empty(10);
        mock.queue_response(&prepare_response(1));
        mock.queue_response(ACK);
        mock.queue_response(&reset_response(1));

        let (mut updater, _) = updater(&mock, fast_config());
        assert!(updater.update_firmware(&firmware(1)).is_err());
        assert_eq!(updater.progress().consecutive_failures, 10);

        updater.update_firmware(&firmware(1)).unwrap();
        assert_eq!(updater.progress().consecutive_failures, 0);
        assert_eq!(updater.progress().status, TransferStatus::Succeeded);
        assert_eq!(mock.connect_count(), 2);
        assert_eq!(mock.close_count(), 2);
    }

    #[test]
    fn test_error_messages_name_stage_and_index() {
        let err = UpdateError::RetriesExhausted {
            index: 42,
            failures: 10,
        };
        assert_eq!(
            err.to_string(),
            "Transfer: package 42 unanswered 10 times in a row"
        );
        let err = UpdateError::DeviceRejected { status: None };
        assert_eq!(
            err.to_string(),
            "Reset: device did not confirm the update (no status in response)"
        );
        let err = UpdateError::Transport {
            stage: UpdatePhase::Transfer,
            index: Some(3),
            source: TransportError::WriteFailed("broken pipe".into()),
        };
        assert_eq!(
            err.to_string(),
            "Transfer: transport error at package 3: Write failed: broken pipe"
        );
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let path = std::env::temp_dir().join(format!("luxfw-config-{}.toml", std::process::id()));
        let config = UpdaterConfig {
            host: "192.168.1.50".into(),
            inverter_sn: Some("BA12345678".into()),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = UpdaterConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let path =
            std::env::temp_dir().join(format!("luxfw-zero-timeout-{}.toml", std::process::id()));
        std::fs::write(&path, "io_timeout_ms = 0\n").unwrap();
        let err = UpdaterConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("io_timeout_ms"));
        std::fs::remove_file(&path).ok();
        assert!(UpdaterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_connection_error_names_endpoint_once() {
        let err = UpdateError::Connection {
            host: "127.0.0.1".into(),
            port: 8899,
            source: TransportError::ConnectFailed {
                addr: "127.0.0.1:8899".into(),
                message: "connection refused".into(),
            },
        };
        let message = err.to_string();
        assert_eq!(message.matches("127.0.0.1:8899").count(), 1, "{message}");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: UpdaterConfig = toml::from_str("port = 9000").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.max_consecutive_failures, 10);
        assert_eq!(config.device_serial(), DEFAULT_DATALOG_SN);
        assert_eq!(config.device_id().as_bytes(), b"FFFFFFFFFF");
    }

    #[test]
    fn test_update_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let mut opcodes = Vec::new();
            loop {
                let n = socket.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                let opcode = buf[1];
                opcodes.push(opcode);
                let reply = match opcode {
                    OP_UPDATE_PREPARE => prepare_response(1),
                    OP_UPDATE_RESET => reset_response(1),
                    _ => ACK.to_vec(),
                };
                socket.write_all(&reply).unwrap();
            }
            opcodes
        });

        let config = UpdaterConfig {
            host: "127.0.0.1".into(),
            port,
            ..fast_config()
        };
        let mut updater = FirmwareUpdater::with_transport(
            config,
            TcpTransport::new(),
            Arc::new(NullObserver),
        );
        let report = updater.update_firmware(&firmware(3)).unwrap();
        assert_eq!(report.packages_sent, 3);
        assert!(!updater.transport().is_connected());

        let opcodes = device.join().unwrap();
        assert_eq!(
            opcodes,
            vec![
                OP_UPDATE_PREPARE,
                OP_UPDATE_SEND_DATA,
                OP_UPDATE_SEND_DATA,
                OP_UPDATE_SEND_DATA,
                OP_UPDATE_RESET
            ]
        );
    }
}
