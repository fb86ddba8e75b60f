//! Protocol constants for the inverter/BMS TCP update protocol.

// ============================================================================
// Endpoint Defaults
// ============================================================================

/// Default address of the datalogger access point.
pub const DEFAULT_HOST: &str = "10.10.10.1";

/// Default TCP port of the datalogger.
pub const DEFAULT_PORT: u16 = 8899;

/// Serial used when the datalogger serial is unknown.
pub const DEFAULT_DATALOG_SN: &str = "FFFFFFFFFFFFFFFFFFFF";

// ============================================================================
// Opcodes (Host -> Device)
// ============================================================================

/// Prepare an update: announces package count and image checksum.
pub const OP_UPDATE_PREPARE: u8 = 0x21;

/// Send one firmware package.
pub const OP_UPDATE_SEND_DATA: u8 = 0x22;

/// Finish the update and reset into the new image.
pub const OP_UPDATE_RESET: u8 = 0x23;

// ============================================================================
// Frame Layout
// ============================================================================

/// Length of the device serial field.
pub const DEVICE_ID_LEN: usize = 10;

/// Offset of the device serial field in every frame.
pub const DEVICE_ID_OFFSET: usize = 2;

/// Trailing CRC16 length.
pub const CRC_LEN: usize = 2;

/// Prepare frame size (fixed).
pub const PREPARE_FRAME_LEN: usize = 24;

/// Reset frame size (fixed).
pub const RESET_FRAME_LEN: usize = 21;

/// SendData header size up to the payload.
pub const SEND_DATA_HEADER_LEN: usize = 21;

/// Bytes the length field counts on top of the payload (the address field).
pub const SEND_DATA_LEN_EXTRA: usize = 4;

// ============================================================================
// Response Layout
// ============================================================================

/// Offset of the resume index (u16 LE) in a Prepare response.
pub const RESUME_INDEX_OFFSET: usize = 16;

/// Offset of the standard-update flag byte in a Prepare response.
pub const STANDARD_UPDATE_FLAG_OFFSET: usize = 16;

/// Offset of the status byte in a Reset response.
pub const RESET_STATUS_OFFSET: usize = 16;

/// Flag value marking a fully standard update.
pub const STANDARD_UPDATE_FLAG: u8 = b'A';

/// Reset status reported when the device accepted the image.
pub const RESET_STATUS_ACCEPTED: u8 = 1;

// ============================================================================
// Timing & Limits
// ============================================================================

/// Socket connect/read/write timeout.
pub const IO_TIMEOUT_MS: u64 = 5000;

/// Size of the single read buffer used per command.
pub const RESPONSE_BUFFER_LEN: usize = 1024;

/// Delay between acknowledged packages.
pub const PACKAGE_PACING_MS: u64 = 100;

/// Delay before retrying a package after an empty response.
pub const RETRY_BACKOFF_MS: u64 = 500;

/// Consecutive empty responses tolerated before the update is aborted.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Progress is reported every N packages (and on the last one).
pub const PROGRESS_INTERVAL: u32 = 10;
