//! Stimulus generator
//!
//! Words are drawn uniformly (or from shuffled full cycles in balanced
//! mode), ink colors uniformly from the palette minus the word's own color,
//! and intervals uniformly from `[min_interval, max_interval]`.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use stroop_core::{ConfigError, Stimulus};

use crate::{ColorPalette, StimulusTiming};

/// How words are ordered across a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WordOrder {
    /// Independent uniform draw per stimulus
    #[default]
    Uniform,
    /// Shuffled full cycles through every word
    Balanced,
}

/// One stimulus with its sampled timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedStimulus {
    pub stimulus: Stimulus,
    pub display: Duration,
    /// Blank interval following this stimulus
    pub interval: Duration,
}

/// Randomized non-congruent stimulus source
pub struct StimulusGenerator {
    palette: ColorPalette,
    timing: StimulusTiming,
    order: WordOrder,
    rng: StdRng,
    /// Remaining word indices of the current balanced cycle
    deck: Vec<usize>,
}

impl StimulusGenerator {
    /// Create a generator seeded from OS entropy
    pub fn new(palette: ColorPalette, timing: StimulusTiming) -> Result<Self, ConfigError> {
        Self::with_rng(palette, timing, StdRng::from_entropy())
    }

    /// Create a reproducible generator
    pub fn with_seed(
        palette: ColorPalette,
        timing: StimulusTiming,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        Self::with_rng(palette, timing, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        palette: ColorPalette,
        timing: StimulusTiming,
        rng: StdRng,
    ) -> Result<Self, ConfigError> {
        timing.validate()?;
        Ok(StimulusGenerator {
            palette,
            timing,
            order: WordOrder::Uniform,
            rng,
            deck: Vec::new(),
        })
    }

    /// Switch word ordering
    pub fn with_order(mut self, order: WordOrder) -> Self {
        self.order = order;
        self.deck.clear();
        self
    }

    pub fn palette(&self) -> &ColorPalette {
        &self.palette
    }

    pub fn timing(&self) -> &StimulusTiming {
        &self.timing
    }

    pub fn order(&self) -> WordOrder {
        self.order
    }

    /// Produce the next stimulus with its display time and a fresh interval
    pub fn generate(&mut self) -> GeneratedStimulus {
        let word = match self.order {
            WordOrder::Uniform => self.rng.gen_range(0..self.palette.word_count()),
            WordOrder::Balanced => self.next_balanced_word(),
        };
        GeneratedStimulus {
            stimulus: self.stimulus_for(word),
            display: self.timing.display,
            interval: self.sample_interval(),
        }
    }

    /// Sample an interval uniformly from `[min_interval, max_interval]`
    pub fn sample_interval(&mut self) -> Duration {
        let min = self.timing.min_interval.as_millis() as u64;
        let max = self.timing.max_interval.as_millis() as u64;
        Duration::from_millis(self.rng.gen_range(min..=max))
    }

    /// Build `n` stimuli from `n / words` full shuffled cycles plus one
    /// partial shuffled cycle; ink colors stay independently random
    pub fn balanced_sequence(&mut self, n: usize) -> Vec<Stimulus> {
        let word_count = self.palette.word_count();
        let full_cycles = n / word_count;
        let remainder = n % word_count;

        let mut indices = Vec::with_capacity(n);
        let mut cycle: Vec<usize> = (0..word_count).collect();
        for _ in 0..full_cycles {
            cycle.shuffle(&mut self.rng);
            indices.extend_from_slice(&cycle);
        }
        if remainder > 0 {
            cycle.shuffle(&mut self.rng);
            indices.extend_from_slice(&cycle[..remainder]);
        }

        indices
            .into_iter()
            .map(|word| self.stimulus_for(word))
            .collect()
    }

    fn next_balanced_word(&mut self) -> usize {
        if self.deck.is_empty() {
            self.deck = (0..self.palette.word_count()).collect();
            self.deck.shuffle(&mut self.rng);
            debug!(words = self.deck.len(), "Balanced word cycle refilled");
        }
        // Non-empty: refilled above with word_count >= 1 entries
        self.deck.pop().unwrap_or(0)
    }

    fn stimulus_for(&mut self, word: usize) -> Stimulus {
        let choices = self.palette.choices(word);
        choices[self.rng.gen_range(0..choices.len())].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use proptest::prelude::*;
    use stroop_core::Color;

    fn generator(seed: u64) -> StimulusGenerator {
        StimulusGenerator::with_seed(ColorPalette::standard(), StimulusTiming::default(), seed)
            .unwrap()
    }

    #[test]
    fn test_never_congruent_over_10k() {
        let mut gen = generator(7);
        for _ in 0..10_000 {
            let generated = gen.generate();
            let stimulus = &generated.stimulus;
            let matching = gen.palette().matching_color(stimulus.word()).unwrap();
            assert_eq!(stimulus.matching_color(), matching);
            assert_ne!(stimulus.display_color(), matching);
        }
    }

    #[test]
    fn test_two_color_palette_always_swaps() {
        let palette = ColorPalette::new(vec![
            ("RED".to_string(), Color::from("red")),
            ("BLUE".to_string(), Color::from("blue")),
        ])
        .unwrap();
        let mut gen = StimulusGenerator::with_seed(palette, StimulusTiming::default(), 1).unwrap();
        for _ in 0..1_000 {
            let stimulus = gen.generate().stimulus;
            match stimulus.word() {
                "RED" => assert_eq!(stimulus.display_color(), &Color::from("blue")),
                "BLUE" => assert_eq!(stimulus.display_color(), &Color::from("red")),
                other => panic!("unexpected word {other}"),
            }
        }
    }

    #[test]
    fn test_invalid_timing_refused() {
        let timing = StimulusTiming {
            min_interval: Duration::from_millis(5000),
            ..Default::default()
        };
        let result = StimulusGenerator::new(ColorPalette::standard(), timing);
        assert!(matches!(result, Err(ConfigError::IntervalRange { .. })));
    }

    #[test]
    fn test_intervals_bounded_and_uniform() {
        let mut gen = generator(42);
        let samples = 100_000;
        let mut buckets = [0u32; 10];

        for _ in 0..samples {
            let interval = gen.sample_interval().as_millis() as u64;
            assert!((1000..=3000).contains(&interval));
            let bucket = (((interval - 1000) * 10) / 2001) as usize;
            buckets[bucket] += 1;
        }

        let expected = samples as f64 / 10.0;
        for count in buckets {
            let deviation = (count as f64 - expected).abs() / expected;
            assert!(deviation < 0.05, "bucket deviates by {deviation}");
        }
    }

    #[test]
    fn test_each_generate_samples_new_interval() {
        let mut gen = generator(3);
        let intervals: Vec<_> = (0..50).map(|_| gen.generate().interval).collect();
        let first = intervals[0];
        assert!(intervals.iter().any(|i| *i != first));
    }

    #[test]
    fn test_words_uniform() {
        let mut gen = generator(11);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..40_000 {
            *counts.entry(gen.generate().stimulus.word().to_string()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!((9_000..=11_000).contains(count), "word count {count}");
        }
    }

    #[test]
    fn test_balanced_sequence_frequencies() {
        let mut gen = generator(5);
        let sequence = gen.balanced_sequence(10);
        assert_eq!(sequence.len(), 10);

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for stimulus in &sequence {
            *counts.entry(stimulus.word()).or_default() += 1;
        }
        // 2 full cycles of 4 words plus 2 from a partial cycle
        for count in counts.values() {
            assert!(*count == 2 || *count == 3);
        }
        assert_eq!(counts.values().filter(|c| **c == 3).count(), 2);

        // Each full cycle contains every word exactly once
        for cycle in sequence[..8].chunks(4) {
            let mut words: Vec<_> = cycle.iter().map(|s| s.word()).collect();
            words.sort_unstable();
            words.dedup();
            assert_eq!(words.len(), 4);
        }
    }

    #[test]
    fn test_balanced_order_streams_full_cycles() {
        let mut gen = generator(9).with_order(WordOrder::Balanced);
        for _ in 0..25 {
            let mut words: Vec<String> = (0..4)
                .map(|_| gen.generate().stimulus.word().to_string())
                .collect();
            words.sort_unstable();
            words.dedup();
            assert_eq!(words.len(), 4);
        }
    }

    proptest! {
        #[test]
        fn prop_any_palette_is_non_congruent(
            colors in prop::collection::btree_set("[a-z]{3,8}", 2..6),
            seed in any::<u64>(),
        ) {
            let mapping: Vec<(String, Color)> = colors
                .iter()
                .map(|c| (c.to_uppercase(), Color::from(c.as_str())))
                .collect();
            let palette = ColorPalette::new(mapping).unwrap();
            let mut gen =
                StimulusGenerator::with_seed(palette, StimulusTiming::default(), seed).unwrap();
            for _ in 0..200 {
                let stimulus = gen.generate().stimulus;
                prop_assert_ne!(stimulus.display_color(), stimulus.matching_color());
            }
        }
    }
}
