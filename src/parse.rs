//! Heuristic decoders for belt notification payloads.
//!
//! All functions in this module are pure and safe to call from any async or
//! sync context.
//!
//! # Why heuristic
//!
//! The measurement packet layout is not documented and differs between
//! firmware revisions.  Instead of committing to one layout the decoder keeps
//! an ordered list of interpretations and tries each at every byte offset
//! where it fits:
//!
//! | Strategy | Width | Conversion |
//! |---|---|---|
//! | [`DecodeStrategy::U8Scaled`] | 1 | `byte / 100` |
//! | [`DecodeStrategy::U16LeScaled`] | 2 | `u16 LE / 100` |
//! | [`DecodeStrategy::U16BeScaled`] | 2 | `u16 BE / 100` |
//! | [`DecodeStrategy::F32Le`] | 4 | IEEE-754 LE |
//! | [`DecodeStrategy::F32Be`] | 4 | IEEE-754 BE |
//!
//! Strategies are tried in list order; for each strategy offsets run from 0
//! upward.  The first candidate inside the plausible force range wins.  The
//! order is fixed, so identical bytes always produce the identical reading.

use crate::protocol::command_id;
use crate::types::{ForceReading, RawSample};

// ── Strategies ────────────────────────────────────────────────────────────────

/// Interpretation of a byte window as a force value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStrategy {
    U8Scaled,
    U16LeScaled,
    U16BeScaled,
    F32Le,
    F32Be,
}

/// Default try-order.
pub const DEFAULT_STRATEGIES: [DecodeStrategy; 5] = [
    DecodeStrategy::U8Scaled,
    DecodeStrategy::U16LeScaled,
    DecodeStrategy::U16BeScaled,
    DecodeStrategy::F32Le,
    DecodeStrategy::F32Be,
];

/// Divisor applied by the integer strategies (raw counts → Newtons).
pub const INTEGER_SCALE: f32 = 100.0;

impl DecodeStrategy {
    /// Bytes consumed from the offset.
    pub fn width(self) -> usize {
        match self {
            DecodeStrategy::U8Scaled => 1,
            DecodeStrategy::U16LeScaled | DecodeStrategy::U16BeScaled => 2,
            DecodeStrategy::F32Le | DecodeStrategy::F32Be => 4,
        }
    }

    /// The raw interpretation function for this strategy.
    pub fn decoder(self) -> fn(&[u8], usize) -> Option<f32> {
        match self {
            DecodeStrategy::U8Scaled => decode_u8_scaled,
            DecodeStrategy::U16LeScaled => decode_u16_le_scaled,
            DecodeStrategy::U16BeScaled => decode_u16_be_scaled,
            DecodeStrategy::F32Le => decode_f32_le,
            DecodeStrategy::F32Be => decode_f32_be,
        }
    }

    /// Apply the strategy at `offset`; `None` when the window does not fit or
    /// the result is not a finite number.
    pub fn apply(self, data: &[u8], offset: usize) -> Option<f32> {
        (self.decoder())(data, offset)
    }
}

fn window<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    data.get(offset..end)?.try_into().ok()
}

/// `data[offset] / 100`.
pub fn decode_u8_scaled(data: &[u8], offset: usize) -> Option<f32> {
    data.get(offset).map(|&b| b as f32 / INTEGER_SCALE)
}

/// Little-endian `u16` at `offset`, divided by 100.
pub fn decode_u16_le_scaled(data: &[u8], offset: usize) -> Option<f32> {
    window::<2>(data, offset).map(|w| u16::from_le_bytes(w) as f32 / INTEGER_SCALE)
}

/// Big-endian `u16` at `offset`, divided by 100.
pub fn decode_u16_be_scaled(data: &[u8], offset: usize) -> Option<f32> {
    window::<2>(data, offset).map(|w| u16::from_be_bytes(w) as f32 / INTEGER_SCALE)
}

/// Little-endian IEEE-754 `f32` at `offset`; NaN and infinities are rejected.
pub fn decode_f32_le(data: &[u8], offset: usize) -> Option<f32> {
    window::<4>(data, offset)
        .map(f32::from_le_bytes)
        .filter(|v| v.is_finite())
}

/// Big-endian IEEE-754 `f32` at `offset`; NaN and infinities are rejected.
pub fn decode_f32_be(data: &[u8], offset: usize) -> Option<f32> {
    window::<4>(data, offset)
        .map(f32::from_be_bytes)
        .filter(|v| v.is_finite())
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// One interpretation of a packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceCandidate {
    pub strategy: DecodeStrategy,
    pub offset: usize,
    pub value: f32,
}

/// Ordered strategy list plus the plausibility window.
#[derive(Debug, Clone)]
pub struct ForceDecoder {
    strategies: Vec<DecodeStrategy>,
    /// Exclusive bounds.
    min_force: f32,
    max_force: f32,
}

impl Default for ForceDecoder {
    fn default() -> Self {
        Self::new(0.0, 40.0)
    }
}

impl ForceDecoder {
    /// Decoder with the default strategy order and an exclusive
    /// `(min_force, max_force)` plausibility window.
    pub fn new(min_force: f32, max_force: f32) -> Self {
        Self {
            strategies: DEFAULT_STRATEGIES.to_vec(),
            min_force,
            max_force,
        }
    }

    /// Replace the try-order.  An empty list makes every packet undecodable.
    pub fn with_strategies(mut self, strategies: Vec<DecodeStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn strategies(&self) -> &[DecodeStrategy] {
        &self.strategies
    }

    pub fn is_plausible(&self, value: f32) -> bool {
        value > self.min_force && value < self.max_force
    }

    /// Every interpretation of `data`, plausible or not, in try-order.
    pub fn candidates(&self, data: &[u8]) -> Vec<ForceCandidate> {
        let mut out = Vec::new();
        for &strategy in &self.strategies {
            let width = strategy.width();
            if data.len() < width {
                continue;
            }
            for offset in 0..=data.len() - width {
                if let Some(value) = strategy.apply(data, offset) {
                    out.push(ForceCandidate { strategy, offset, value });
                }
            }
        }
        out
    }

    /// First plausible interpretation of `data`, or `None`.
    pub fn select(&self, data: &[u8]) -> Option<ForceCandidate> {
        if packet_kind(data) != PacketKind::Measurement {
            return None;
        }
        self.strategies.iter().find_map(|&strategy| {
            let width = strategy.width();
            if data.len() < width {
                return None;
            }
            (0..=data.len() - width).find_map(|offset| {
                strategy
                    .apply(data, offset)
                    .filter(|&v| self.is_plausible(v))
                    .map(|value| ForceCandidate { strategy, offset, value })
            })
        })
    }

    /// Decode `data` into a reading stamped with `timestamp`.
    pub fn decode(&self, data: &[u8], timestamp: f64) -> Option<ForceReading> {
        self.select(data).map(|c| ForceReading {
            value: c.value,
            timestamp,
        })
    }

    /// Decode a full notification.
    pub fn decode_sample(&self, sample: &RawSample) -> Option<ForceReading> {
        self.decode(&sample.bytes, sample.received_at)
    }
}

/// Decode with the default strategies and the `(0, 40)` N window.
///
/// ```
/// # use breathbelt_rs::parse::decode_force;
/// let r = decode_force(&[0x00, 0x80, 0x00, 0x00], 0.0).unwrap();
/// assert!((r.value - 1.28).abs() < 1e-6);
/// ```
pub fn decode_force(data: &[u8], timestamp: f64) -> Option<ForceReading> {
    ForceDecoder::default().decode(data, timestamp)
}

/// Every interpretation under the default strategies, for diagnostics.
pub fn decode_candidates(data: &[u8]) -> Vec<ForceCandidate> {
    ForceDecoder::default().candidates(data)
}

// ── Packet classification ─────────────────────────────────────────────────────

/// First byte of a device → host command response.
pub const RESPONSE_MARKER: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Empty,
    /// Echo of a host command; byte 1 carries the command id.
    CommandResponse(u8),
    Measurement,
}

/// Separate command echoes from measurement packets so echoes never reach
/// the force decoder.
///
/// A packet is a command response only when it starts with
/// [`RESPONSE_MARKER`] and its second byte is a known command id; anything
/// else is treated as measurement data.
pub fn packet_kind(data: &[u8]) -> PacketKind {
    match data {
        [] => PacketKind::Empty,
        [RESPONSE_MARKER, id, ..] if is_known_command_id(*id) => PacketKind::CommandResponse(*id),
        _ => PacketKind::Measurement,
    }
}

fn is_known_command_id(id: u8) -> bool {
    matches!(
        id,
        command_id::START_STOP_MEASUREMENT
            | command_id::ENABLE_SENSOR
            | command_id::SET_SAMPLE_PERIOD
            | command_id::GET_SENSOR_LIST
            | command_id::GET_DEVICE_INFO
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_at_offset_one() {
        let c = ForceDecoder::default().select(&[0x00, 0x80, 0x00, 0x00]).unwrap();
        assert_eq!(c.strategy, DecodeStrategy::U8Scaled);
        assert_eq!(c.offset, 1);
        assert!((c.value - 1.28).abs() < 1e-6);
    }

    #[test]
    fn all_zero_packet_is_not_plausible() {
        assert!(decode_force(&[0, 0, 0, 0, 0, 0], 0.0).is_none());
    }

    #[test]
    fn empty_packet_decodes_to_none() {
        assert!(decode_force(&[], 0.0).is_none());
        assert!(decode_candidates(&[]).is_empty());
    }

    #[test]
    fn strategies_respect_their_width() {
        assert_eq!(decode_u16_le_scaled(&[0x10], 0), None);
        assert_eq!(decode_f32_le(&[0, 0, 0], 0), None);
        assert_eq!(decode_u8_scaled(&[5], 1), None);
        assert_eq!(decode_u16_le_scaled(&[0xE8, 0x03], 0), Some(10.0));
        assert_eq!(decode_u16_be_scaled(&[0x03, 0xE8], 0), Some(10.0));
        assert_eq!(decode_f32_le(&2.5f32.to_le_bytes(), 0), Some(2.5));
        assert_eq!(decode_f32_be(&2.5f32.to_be_bytes(), 0), Some(2.5));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert_eq!(decode_f32_le(&f32::NAN.to_le_bytes(), 0), None);
        assert_eq!(decode_f32_be(&f32::INFINITY.to_be_bytes(), 0), None);
    }

    #[test]
    fn float_only_decoder_finds_embedded_value() {
        let mut packet = vec![0xAA, 0xBB];
        packet.extend_from_slice(&12.5f32.to_le_bytes());
        let dec = ForceDecoder::default().with_strategies(vec![DecodeStrategy::F32Le]);
        let c = dec.select(&packet).unwrap();
        assert_eq!(c.offset, 2);
        assert_eq!(c.value, 12.5);
    }

    #[test]
    fn selection_is_deterministic() {
        let packet = [0x07, 0x31, 0x9A, 0x41, 0x00, 0x12];
        let first = ForceDecoder::default().select(&packet);
        for _ in 0..10 {
            assert_eq!(ForceDecoder::default().select(&packet), first);
        }
    }

    #[test]
    fn candidates_cover_every_offset() {
        // 3 bytes: 3 u8 + 2 u16le + 2 u16be, floats do not fit.
        assert_eq!(decode_candidates(&[1, 2, 3]).len(), 7);
    }

    #[test]
    fn command_responses_are_not_decoded() {
        let echo = [RESPONSE_MARKER, command_id::GET_DEVICE_INFO, 0x10, 0x20];
        assert_eq!(packet_kind(&echo), PacketKind::CommandResponse(command_id::GET_DEVICE_INFO));
        assert!(decode_force(&echo, 0.0).is_none());
        // Same marker with an unknown id is still measurement data.
        assert_eq!(packet_kind(&[RESPONSE_MARKER, 0x99]), PacketKind::Measurement);
    }

    #[test]
    fn decode_sample_keeps_timestamp() {
        let sample = RawSample { bytes: vec![0, 50], received_at: 1234.0 };
        let r = ForceDecoder::default().decode_sample(&sample).unwrap();
        assert_eq!(r.timestamp, 1234.0);
        assert!((r.value - 0.5).abs() < 1e-6);
    }
}
