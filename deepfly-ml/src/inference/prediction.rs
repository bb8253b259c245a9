//! Network output and the score derived from it.

use crate::error::MlError;

/// Raw classifier output for a single image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// Single sigmoid unit: the fake probability itself.
    Score(f32),
    /// Two-unit softmax: `[real, fake]`.
    ScorePair { real: f32, fake: f32 },
}

impl Prediction {
    /// Interpret the final layer's activations.
    pub fn from_outputs(outputs: &[f32]) -> Result<Self, MlError> {
        match *outputs {
            [fake] => Ok(Prediction::Score(fake)),
            [real, fake] => Ok(Prediction::ScorePair { real, fake }),
            _ => Err(MlError::inference(format!(
                "expected 1 or 2 output values, got {}",
                outputs.len()
            ))),
        }
    }

    /// Probability that the image is synthetic or manipulated.
    pub fn fake_probability(&self) -> f32 {
        match *self {
            Prediction::Score(fake) => fake,
            Prediction::ScorePair { fake, .. } => fake,
        }
    }

    /// Fake probability as an integer percentage, truncated toward zero.
    pub fn score(&self) -> Result<u8, MlError> {
        score_from_probability(self.fake_probability())
    }
}

/// `floor(p × 100)`, clamped to `[0, 100]`.
///
/// A non-finite probability means the forward pass broke down and is
/// reported as an inference error.
pub fn score_from_probability(p: f32) -> Result<u8, MlError> {
    if !p.is_finite() {
        return Err(MlError::inference(format!(
            "model produced a non-finite probability ({p})"
        )));
    }
    Ok((p.clamp(0.0, 1.0) * 100.0).floor() as u8)
}
