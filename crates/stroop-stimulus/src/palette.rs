//! Color palette and stimulus timing parameters

use std::collections::BTreeSet;
use std::time::Duration;

use stroop_core::{Color, ConfigError, Stimulus};

/// Word → matching color mapping and the set of ink colors
///
/// Every admissible (word, ink) pair is built once at construction, so the
/// generator only ever picks from stimuli that already passed the
/// non-congruence check.
#[derive(Clone, Debug)]
pub struct ColorPalette {
    words: Vec<(String, Color)>,
    colors: Vec<Color>,
    /// Non-congruent stimuli per word, indexed like `words`
    choices: Vec<Vec<Stimulus>>,
}

impl ColorPalette {
    /// Build a palette from the word mapping; ink colors are the distinct
    /// matching colors
    pub fn new<W, C>(mapping: W) -> Result<Self, ConfigError>
    where
        W: IntoIterator<Item = (String, C)>,
        C: Into<Color>,
    {
        Self::with_extra_colors(mapping, std::iter::empty::<Color>())
    }

    /// Build a palette with additional display-only ink colors
    pub fn with_extra_colors<W, C, E>(mapping: W, extra_colors: E) -> Result<Self, ConfigError>
    where
        W: IntoIterator<Item = (String, C)>,
        C: Into<Color>,
        E: IntoIterator<Item = Color>,
    {
        let mut words: Vec<(String, Color)> = Vec::new();
        for (word, color) in mapping {
            if words.iter().any(|(existing, _)| *existing == word) {
                return Err(ConfigError::DuplicateWord(word));
            }
            words.push((word, color.into()));
        }

        let colors: Vec<Color> = words
            .iter()
            .map(|(_, color)| color.clone())
            .chain(extra_colors)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if colors.len() < 2 {
            return Err(ConfigError::TooFewColors(colors.len()));
        }
        if words.is_empty() {
            return Err(ConfigError::Invalid("palette has no color words".into()));
        }

        let mut choices = Vec::with_capacity(words.len());
        for (word, matching) in &words {
            let options = colors
                .iter()
                .filter(|ink| *ink != matching)
                .map(|ink| Stimulus::new(word.clone(), ink.clone(), matching.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            if options.is_empty() {
                return Err(ConfigError::NoAlternativeColor { word: word.clone() });
            }
            choices.push(options);
        }

        Ok(ColorPalette {
            words,
            colors,
            choices,
        })
    }

    /// Standard four-color palette
    pub fn standard() -> Self {
        let mapping = [
            ("RED", "red"),
            ("GREEN", "green"),
            ("BLUE", "blue"),
            ("YELLOW", "yellow"),
        ]
        .map(|(word, color)| (word.to_string(), Color::from(color)));

        // The standard mapping is statically non-degenerate
        match Self::new(mapping) {
            Ok(palette) => palette,
            Err(e) => unreachable!("standard palette rejected: {e}"),
        }
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(|(word, _)| word.as_str())
    }

    /// All ink colors, sorted
    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    /// Matching color of a word
    pub fn matching_color(&self, word: &str) -> Option<&Color> {
        self.words
            .iter()
            .find(|(candidate, _)| candidate == word)
            .map(|(_, color)| color)
    }

    /// Non-congruent stimuli for the word at `index`
    pub(crate) fn choices(&self, index: usize) -> &[Stimulus] {
        &self.choices[index]
    }
}

/// Stimulus timing parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StimulusTiming {
    /// How long a stimulus stays on screen without a verdict
    pub display: Duration,
    /// Lower bound of the blank interval (inclusive)
    pub min_interval: Duration,
    /// Upper bound of the blank interval (inclusive)
    pub max_interval: Duration,
    /// Countdown before the task clock starts
    pub countdown: Duration,
}

impl StimulusTiming {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("display", self.display),
            ("min_interval", self.min_interval),
            ("max_interval", self.max_interval),
            ("countdown", self.countdown),
        ];
        for (name, duration) in named {
            if duration.is_zero() {
                return Err(ConfigError::NonPositiveDuration(name));
            }
            if duration.subsec_nanos() % 1_000_000 != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a whole number of milliseconds"
                )));
            }
        }
        if self.min_interval > self.max_interval {
            return Err(ConfigError::IntervalRange {
                min: self.min_interval,
                max: self.max_interval,
            });
        }
        Ok(())
    }

    /// Mean length of one display + interval cycle
    pub fn mean_cycle(&self) -> Duration {
        self.display + (self.min_interval + self.max_interval) / 2
    }
}

impl Default for StimulusTiming {
    fn default() -> Self {
        StimulusTiming {
            display: Duration::from_millis(2000),
            min_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(3000),
            countdown: Duration::from_secs(3),
        }
    }
}
