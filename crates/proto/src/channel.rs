//! Unreliable-link emulation on top of a reliable transport.
//!
//! The receiving side runs every inbound DATA payload through
//! [`ChannelCondition::apply`] before checksum verification, so loss and
//! corruption exercise the NACK/retransmission machinery exactly as a real
//! lossy link would.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Probabilistic fault model for one direction of a connection.
///
/// A fixed-shape value: the fields always exist and `apply` branches on
/// them, whatever mode the peer has configured.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelCondition {
    pub loss_probability: f64,
    pub corruption_probability: f64,
    pub delay_probability: f64,
    pub delay_seconds: f64,
}

impl ChannelCondition {
    /// Build a condition with probabilities clamped to `[0, 1]` and a
    /// non-negative delay.
    pub fn clamped(loss: f64, corruption: f64, delay: f64, delay_seconds: f64) -> Self {
        Self {
            loss_probability: loss.clamp(0.0, 1.0),
            corruption_probability: corruption.clamp(0.0, 1.0),
            delay_probability: delay.clamp(0.0, 1.0),
            delay_seconds: delay_seconds.max(0.0),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.loss_probability == 0.0
            && self.corruption_probability == 0.0
            && self.delay_probability == 0.0
    }

    /// Run one payload through the simulated channel.
    ///
    /// Faults are evaluated in order: loss, corruption, delay. Loss returns
    /// `None` and the caller must treat the packet as dropped (emitting a
    /// NACK on the receiving side). Corruption bumps one byte so the
    /// checksum fails, and short-circuits loss: at most one of the two fires
    /// per call. Delay blocks the current thread for `delay_seconds` and is
    /// independent of the loss/corruption branch.
    pub fn apply(&self, payload: &[u8], sequence: u16) -> Option<Vec<u8>> {
        let mut rng = rand::rng();

        if fires(self.loss_probability, &mut rng) {
            log::debug!("channel dropped packet seq={sequence}");
            return None;
        }

        let mut out = payload.to_vec();
        if fires(self.corruption_probability, &mut rng) && !out.is_empty() {
            let index = rng.random_range(0..out.len());
            out[index] = out[index].wrapping_add(1);
            log::debug!("channel corrupted packet seq={sequence} at byte {index}");
        }

        if fires(self.delay_probability, &mut rng) && self.delay_seconds > 0.0 {
            log::debug!(
                "channel delaying packet seq={sequence} by {:.2}s",
                self.delay_seconds
            );
            std::thread::sleep(Duration::from_secs_f64(self.delay_seconds));
        }

        Some(out)
    }
}

fn fires<R: Rng>(probability: f64, rng: &mut R) -> bool {
    probability >= 1.0 || (probability > 0.0 && rng.random::<f64>() < probability)
}

/// JSON mirror of [`ChannelCondition`] carried by CHANNEL_CONFIG packets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub loss_prob: f64,
    #[serde(default)]
    pub corruption_prob: f64,
    #[serde(default)]
    pub delay_prob: f64,
    #[serde(default)]
    pub delay_time: f64,
}

impl From<ChannelConfig> for ChannelCondition {
    fn from(config: ChannelConfig) -> Self {
        ChannelCondition::clamped(
            config.loss_prob,
            config.corruption_prob,
            config.delay_prob,
            config.delay_time,
        )
    }
}

impl From<ChannelCondition> for ChannelConfig {
    fn from(condition: ChannelCondition) -> Self {
        ChannelConfig {
            loss_prob: condition.loss_probability,
            corruption_prob: condition.corruption_probability,
            delay_prob: condition.delay_probability,
            delay_time: condition.delay_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum;

    #[test]
    fn normal_condition_passes_payload_through() {
        let condition = ChannelCondition::default();
        assert!(condition.is_normal());
        let out = condition.apply(b"abc", 0).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn full_loss_always_drops() {
        let condition = ChannelCondition::clamped(1.0, 0.0, 0.0, 0.0);
        for seq in 0..20 {
            assert!(condition.apply(b"abc", seq).is_none());
        }
    }

    #[test]
    fn full_corruption_always_fails_checksum() {
        let condition = ChannelCondition::clamped(0.0, 1.0, 0.0, 0.0);
        let payload = b"some payload bytes";
        let expected = checksum(payload);
        for seq in 0..20 {
            let out = condition.apply(payload, seq).unwrap();
            assert_ne!(checksum(&out), expected);
        }
    }

    #[test]
    fn corruption_short_circuits_before_loss_when_loss_misses() {
        // Loss 0 + corruption 1: payload must come back, mutated.
        let condition = ChannelCondition::clamped(0.0, 1.0, 0.0, 0.0);
        let out = condition.apply(b"xy", 1).unwrap();
        assert_ne!(out, b"xy");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn clamping_bounds_fields() {
        let condition = ChannelCondition::clamped(1.5, -0.2, 2.0, -3.0);
        assert_eq!(condition.loss_probability, 1.0);
        assert_eq!(condition.corruption_probability, 0.0);
        assert_eq!(condition.delay_probability, 1.0);
        assert_eq!(condition.delay_seconds, 0.0);
    }

    #[test]
    fn config_json_shape_matches_wire_contract() {
        let condition = ChannelCondition::clamped(0.25, 0.5, 0.75, 1.5);
        let json = serde_json::to_value(ChannelConfig::from(condition)).unwrap();
        assert_eq!(json["loss_prob"], 0.25);
        assert_eq!(json["corruption_prob"], 0.5);
        assert_eq!(json["delay_prob"], 0.75);
        assert_eq!(json["delay_time"], 1.5);

        let parsed: ChannelConfig = serde_json::from_str(r#"{"loss_prob": 1.0}"#).unwrap();
        let back = ChannelCondition::from(parsed);
        assert_eq!(back.loss_probability, 1.0);
        assert_eq!(back.corruption_probability, 0.0);
    }
}
