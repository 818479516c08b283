//! GATT UUIDs, command byte tables, and device identification for the
//! respiration belt.
//!
//! The belt speaks a vendor protocol whose packet layout is not publicly
//! documented.  The command frames below were captured from working sessions;
//! they are kept as named constants so the byte values never appear inline
//! elsewhere in the crate.
//!
//! Command frame shape as observed on the wire:
//!
//! ```text
//! byte 0     : 0x58 command marker
//! byte 1     : total frame length
//! bytes 2..3 : sequence / checksum slot (the device accepts zero)
//! byte 4     : command id
//! bytes 5..  : command-specific payload
//! ```

use uuid::Uuid;

use crate::error::ProtocolError;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service exposed by the belt.
pub const BELT_SERVICE_UUID: Uuid = Uuid::from_u128(0xd91714ef_28b9_4f91_ba16_f0d9a604f112);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Write characteristic that accepts command frames.
pub const COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf4bf14a6_c7d5_4b6d_8aa8_df1a7c83adcb);

/// Notify characteristic that carries command echoes and measurement packets.
pub const RESPONSE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xb41e6675_a329_40e0_aa01_44d2f444babe);

// ── Device identification ─────────────────────────────────────────────────────

/// Advertised-name prefix shared by every belt in the device family
/// (e.g. `"GDX-RB 0K1023A7"`).
pub const DEVICE_NAME_PREFIX: &str = "GDX-RB";

/// `true` when `device_name` belongs to the respiration-belt family.
///
/// ```
/// # use breathbelt_rs::protocol::is_target_device;
/// assert!(is_target_device("GDX-RB 0K1023A7"));
/// assert!(!is_target_device("Polar H10 1A2B3C"));
/// ```
pub fn is_target_device(device_name: &str) -> bool {
    has_name_prefix(device_name, DEVICE_NAME_PREFIX)
}

/// Prefix match used by scanning when a custom prefix is configured.
///
/// Leading whitespace in advertised names (seen on some Linux stacks) is
/// ignored; an empty prefix never matches.
pub fn has_name_prefix(device_name: &str, prefix: &str) -> bool {
    !prefix.is_empty() && device_name.trim_start().starts_with(prefix)
}

// ── Command frames ────────────────────────────────────────────────────────────

/// First byte of every host → device command frame.
pub const COMMAND_MARKER: u8 = 0x58;

/// Command ids (byte 4 of a frame).
pub mod command_id {
    pub const START_STOP_MEASUREMENT: u8 = 0x18;
    pub const ENABLE_SENSOR: u8 = 0x1A;
    pub const SET_SAMPLE_PERIOD: u8 = 0x1B;
    pub const GET_SENSOR_LIST: u8 = 0x51;
    pub const GET_DEVICE_INFO: u8 = 0x55;
}

/// Multi-byte activation sequence that wakes the force sensor.
///
/// Must be sent before any measurement command; firmware ignores
/// start-measurement until it has seen this frame.
pub const ENABLE_SENSOR_COMMAND: [u8; 25] = [
    0x58, 0x19, 0xFE, 0x3F, 0x1A, 0xA5, 0x4A, 0x06, 0x49, 0x07, 0x48, 0x08, 0x47, 0x09, 0x46,
    0x0A, 0x45, 0x0B, 0x44, 0x0C, 0x43, 0x0D, 0x42, 0x0E, 0x41,
];

/// Header of the set-sample-period frame; the period in milliseconds follows
/// as a little-endian `u16` (see [`encode_sample_period`]).
pub const SET_SAMPLE_PERIOD_HEADER: [u8; 5] = [0x58, 0x07, 0x00, 0x00, 0x1B];

/// Begin streaming measurement packets on the response characteristic.
///
/// Also used as the keep-alive frame: some firmware stops streaming unless it
/// sees this periodically.
pub const START_MEASUREMENT_COMMAND: [u8; 11] =
    [0x58, 0x0B, 0x00, 0x00, 0x18, 0xFF, 0x01, 0x00, 0x00, 0x00, 0x00];

/// Stop streaming measurement packets.
pub const STOP_MEASUREMENT_COMMAND: [u8; 6] = [0x58, 0x06, 0x00, 0x00, 0x18, 0x00];

/// Request the device info block (name, firmware, battery).
pub const GET_DEVICE_INFO_COMMAND: [u8; 5] = [0x58, 0x05, 0x00, 0x00, 0x55];

/// Request the list of sensor channels the device exposes.
pub const GET_SENSOR_LIST_COMMAND: [u8; 5] = [0x58, 0x05, 0x00, 0x00, 0x51];

/// Default sample period in milliseconds (10 Hz).
pub const DEFAULT_SAMPLE_PERIOD_MS: u16 = 100;

/// Named device commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    EnableSensor,
    /// Sample period in milliseconds.
    SetSamplePeriod(u16),
    StartMeasurement,
    StopMeasurement,
    /// Periodic re-activation; identical bytes to `StartMeasurement`.
    KeepAlive,
    GetDeviceInfo,
    GetSensorList,
}

impl CommandKind {
    /// Resolve a command by its textual name, as typed in the CLI.
    ///
    /// `set-sample-rate` uses [`DEFAULT_SAMPLE_PERIOD_MS`]; a specific period
    /// can be given as `set-sample-rate:<ms>`.
    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        let name = name.trim();
        if let Some(ms) = name.strip_prefix("set-sample-rate:") {
            return ms
                .parse::<u16>()
                .map(CommandKind::SetSamplePeriod)
                .map_err(|_| ProtocolError::UnknownCommand(name.to_owned()));
        }
        match name {
            "enable-sensor" => Ok(CommandKind::EnableSensor),
            "set-sample-rate" => Ok(CommandKind::SetSamplePeriod(DEFAULT_SAMPLE_PERIOD_MS)),
            "start" | "start-measurement" => Ok(CommandKind::StartMeasurement),
            "stop" | "stop-measurement" => Ok(CommandKind::StopMeasurement),
            "keep-alive" | "heartbeat" => Ok(CommandKind::KeepAlive),
            "device-info" => Ok(CommandKind::GetDeviceInfo),
            "sensor-list" => Ok(CommandKind::GetSensorList),
            other => Err(ProtocolError::UnknownCommand(other.to_owned())),
        }
    }
}

/// Encode a sample period for the set-sample-period frame.
///
/// ```
/// # use breathbelt_rs::protocol::encode_sample_period;
/// assert_eq!(encode_sample_period(100), [0x64, 0x00]);
/// ```
pub fn encode_sample_period(period_ms: u16) -> [u8; 2] {
    period_ms.to_le_bytes()
}

/// Return the fixed byte frame for `kind`.
pub fn build_command(kind: CommandKind) -> Vec<u8> {
    match kind {
        CommandKind::EnableSensor => ENABLE_SENSOR_COMMAND.to_vec(),
        CommandKind::SetSamplePeriod(period_ms) => {
            let mut frame = SET_SAMPLE_PERIOD_HEADER.to_vec();
            frame.extend_from_slice(&encode_sample_period(period_ms));
            frame
        }
        CommandKind::StartMeasurement | CommandKind::KeepAlive => {
            START_MEASUREMENT_COMMAND.to_vec()
        }
        CommandKind::StopMeasurement => STOP_MEASUREMENT_COMMAND.to_vec(),
        CommandKind::GetDeviceInfo => GET_DEVICE_INFO_COMMAND.to_vec(),
        CommandKind::GetSensorList => GET_SENSOR_LIST_COMMAND.to_vec(),
    }
}
