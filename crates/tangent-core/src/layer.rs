//! Layer mode: duplicate primary notes onto a second channel
//!
//! When enabled, every primary-channel strike and release is mirrored onto
//! the layer channel with its own program. The copy carries its own origin
//! and its own polyphony slot; the allocator treats it as an independent
//! note. Pitch is never modified; velocity is dimmed by a fixed offset so
//! the layer sits under the primary sound.

use crate::state::LayerState;
use crate::types::PRIMARY_CHANNEL;

/// How far below the primary velocity the layer copy plays
pub const LAYER_VELOCITY_DIM: u8 = 20;

/// What the fan-in should do with a layered strike or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerCopy {
    pub channel: u8,
    pub velocity: u8,
}

/// Compute the layer duplicate for a primary-channel strike, if layering
/// is on. Returns the channel and dimmed velocity to allocate with
/// `Origin::Layer`.
pub fn duplicate_on(layer: &LayerState, channel: u8, velocity: u8) -> Option<LayerCopy> {
    if !layer.on || channel != PRIMARY_CHANNEL {
        return None;
    }
    Some(LayerCopy {
        channel: layer.channel,
        velocity: velocity.saturating_sub(LAYER_VELOCITY_DIM).max(1),
    })
}

/// Channel to mirror a primary-channel release onto, if layering is on.
pub fn duplicate_off(layer: &LayerState, channel: u8) -> Option<u8> {
    if !layer.on || channel != PRIMARY_CHANNEL {
        return None;
    }
    Some(layer.channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LAYER_CHANNEL;

    fn layer_on() -> LayerState {
        LayerState {
            on: true,
            program: 48,
            channel: LAYER_CHANNEL,
        }
    }

    #[test]
    fn test_duplicate_dims_velocity() {
        let copy = duplicate_on(&layer_on(), PRIMARY_CHANNEL, 100).unwrap();
        assert_eq!(copy.channel, LAYER_CHANNEL);
        assert_eq!(copy.velocity, 80);
    }

    #[test]
    fn test_duplicate_velocity_floors_at_one() {
        let copy = duplicate_on(&layer_on(), PRIMARY_CHANNEL, 5).unwrap();
        assert_eq!(copy.velocity, 1);
    }

    #[test]
    fn test_disabled_layer_produces_nothing() {
        let layer = LayerState::default();
        assert_eq!(duplicate_on(&layer, PRIMARY_CHANNEL, 100), None);
        assert_eq!(duplicate_off(&layer, PRIMARY_CHANNEL), None);
    }

    #[test]
    fn test_only_primary_channel_is_layered() {
        let layer = layer_on();
        assert_eq!(duplicate_on(&layer, LAYER_CHANNEL, 100), None);
        assert_eq!(duplicate_off(&layer, 5), None);
    }

    #[test]
    fn test_off_mirrors_channel() {
        assert_eq!(duplicate_off(&layer_on(), PRIMARY_CHANNEL), Some(LAYER_CHANNEL));
    }
}
