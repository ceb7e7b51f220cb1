//! Input handling.
//!
//! In a real engine this would integrate with windowing, raw mouse/keyboard,
//! action bindings, and per-frame sampling. This scaffold focuses on producing
//! sequenced per-tick `InputState` calls.

use engine_shared::{math::Vec2, protocol::InputState};

/// User input sampled at a moment in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputSample {
    pub forward: f64,
    pub right: f64,
    pub jump: bool,
}

impl InputSample {
    /// Movement intent, clamped to unit length.
    pub fn wish_vector(self) -> Vec2 {
        let wish = Vec2::new(self.right, self.forward);
        if wish.len_sq() > 1.0 {
            wish.normalized()
        } else {
            wish
        }
    }
}

/// Turns sampled input into the `InputState` sent for a tick.
pub fn build_input(sequence: i64, sample: InputSample) -> InputState {
    InputState {
        sequence,
        movement: sample.wish_vector(),
        jump: sample.jump,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_wish_is_clamped() {
        let wish = InputSample {
            forward: 1.0,
            right: 1.0,
            jump: false,
        }
        .wish_vector();
        assert!((wish.len_sq() - 1.0).abs() < 1e-9);

        let slow = InputSample {
            forward: 0.5,
            ..Default::default()
        };
        assert_eq!(slow.wish_vector(), Vec2::new(0.0, 0.5));
    }

    #[test]
    fn build_input_carries_sequence() {
        let input = build_input(7, InputSample { jump: true, ..Default::default() });
        assert_eq!(input.sequence, 7);
        assert!(input.jump);
        assert_eq!(input.movement, Vec2::ZERO);
    }
}
