//! Stroop stimulus value type
//!
//! A stimulus is a color word drawn in an ink color different from the
//! color it names. Congruent stimuli cannot be constructed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Named color (ink or word meaning)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(pub String);

impl Color {
    pub fn new(name: impl Into<String>) -> Self {
        Color(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Color({})", self.0)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Color {
    fn from(value: &str) -> Self {
        Color(value.to_string())
    }
}

impl From<String> for Color {
    fn from(value: String) -> Self {
        Color(value)
    }
}

/// Stroop stimulus
/// INVARIANT: `display_color != matching_color`, checked on every construction path
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawStimulus")]
pub struct Stimulus {
    word: String,
    display_color: Color,
    matching_color: Color,
}

impl Stimulus {
    /// Create a stimulus, rejecting congruent combinations
    pub fn new(
        word: impl Into<String>,
        display_color: Color,
        matching_color: Color,
    ) -> Result<Self, ConfigError> {
        let word = word.into();
        if display_color == matching_color {
            return Err(ConfigError::CongruentStimulus {
                word,
                color: display_color.0,
            });
        }
        Ok(Stimulus {
            word,
            display_color,
            matching_color,
        })
    }

    /// The color word shown
    pub fn word(&self) -> &str {
        &self.word
    }

    /// Ink color the word is rendered in
    pub fn display_color(&self) -> &Color {
        &self.display_color
    }

    /// Color the word names
    pub fn matching_color(&self) -> &Color {
        &self.matching_color
    }
}

#[derive(Deserialize)]
struct RawStimulus {
    word: String,
    display_color: Color,
    matching_color: Color,
}

impl TryFrom<RawStimulus> for Stimulus {
    type Error = ConfigError;

    fn try_from(raw: RawStimulus) -> Result<Self, Self::Error> {
        Stimulus::new(raw.word, raw.display_color, raw.matching_color)
    }
}
