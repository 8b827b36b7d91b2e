//! Latent watermark primitives: pattern and mask generators, injection and
//! measurement.
//!
//! Frequency-domain watermarks live in the centred (`fftshift`ed) 2-D Fourier
//! transform of each latent channel; seed watermarks live directly in latent
//! space. Every tensor op here is differentiable so the optimizer can train
//! the pattern through injection and extraction.

pub mod dft;
pub mod injection;
pub mod mask;
pub mod measurement;
pub mod pattern;

pub use dft::{fft2_shifted_host, ComplexLatent, Dft2};
pub use injection::inject_watermark;
pub use mask::{circle_mask, WatermarkMask};
pub use measurement::watermark_distance;
pub use pattern::WatermarkPattern;

use std::fmt;
use std::str::FromStr;

use crate::error::WatermarkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    SeedRing,
    SeedZeros,
    SeedRand,
    Rand,
    Zeros,
    Const,
    Ring,
}

impl PatternKind {
    /// Seed patterns are defined in latent space rather than Fourier space.
    pub fn is_spatial(self) -> bool {
        matches!(self, PatternKind::SeedRing | PatternKind::SeedZeros | PatternKind::SeedRand)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::SeedRing => "seed_ring",
            PatternKind::SeedZeros => "seed_zeros",
            PatternKind::SeedRand => "seed_rand",
            PatternKind::Rand => "rand",
            PatternKind::Zeros => "zeros",
            PatternKind::Const => "const",
            PatternKind::Ring => "ring",
        }
    }
}

impl FromStr for PatternKind {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seed_ring" => Ok(PatternKind::SeedRing),
            "seed_zeros" => Ok(PatternKind::SeedZeros),
            "seed_rand" => Ok(PatternKind::SeedRand),
            "rand" => Ok(PatternKind::Rand),
            "zeros" => Ok(PatternKind::Zeros),
            "const" => Ok(PatternKind::Const),
            "ring" => Ok(PatternKind::Ring),
            other => Err(WatermarkError::UnknownPattern(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskShape {
    /// Band between the low and up radius around the centre
    Circle,
    Square,
    No,
}

impl MaskShape {
    pub fn as_str(self) -> &'static str {
        match self {
            MaskShape::Circle => "circle",
            MaskShape::Square => "square",
            MaskShape::No => "no",
        }
    }
}

impl FromStr for MaskShape {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "circle" => Ok(MaskShape::Circle),
            "square" => Ok(MaskShape::Square),
            "no" => Ok(MaskShape::No),
            other => Err(WatermarkError::UnknownMaskShape(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    L1Complex,
    L1Seed,
}

impl Measurement {
    pub fn as_str(self) -> &'static str {
        match self {
            Measurement::L1Complex => "l1_complex",
            Measurement::L1Seed => "l1_seed",
        }
    }
}

impl FromStr for Measurement {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1_complex" => Ok(Measurement::L1Complex),
            "l1_seed" => Ok(Measurement::L1Seed),
            other => Err(WatermarkError::UnknownMeasurement(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    Complex,
    Seed,
}

impl Injection {
    pub fn as_str(self) -> &'static str {
        match self {
            Injection::Complex => "complex",
            Injection::Seed => "seed",
        }
    }
}

impl FromStr for Injection {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complex" => Ok(Injection::Complex),
            "seed" => Ok(Injection::Seed),
            other => Err(WatermarkError::UnknownInjection(other.to_string())),
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(PatternKind, MaskShape, Measurement, Injection);

/// Watermark knobs shared by the generators, injection and measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkOptions {
    pub seed: u64,
    /// Latent channel carrying the watermark, `-1` for all channels
    pub channel: i64,
    pub pattern: PatternKind,
    pub mask_shape: MaskShape,
    pub up_radius: usize,
    pub low_radius: usize,
    pub measurement: Measurement,
    pub injection: Injection,
    pub pattern_const: f64,
}

impl Default for WatermarkOptions {
    fn default() -> Self {
        Self {
            seed: 999_999,
            channel: 0,
            pattern: PatternKind::Rand,
            mask_shape: MaskShape::Circle,
            up_radius: 30,
            low_radius: 5,
            measurement: Measurement::L1Complex,
            injection: Injection::Complex,
            pattern_const: 0.0,
        }
    }
}

impl WatermarkOptions {
    /// Check the options against a `[channels, size, size]` latent.
    pub fn validate(&self, channels: usize, size: usize) -> Result<(), WatermarkError> {
        if self.low_radius >= self.up_radius {
            return Err(WatermarkError::RadiusBand {
                low: self.low_radius,
                up: self.up_radius,
            });
        }
        if self.up_radius > size / 2 {
            return Err(WatermarkError::RadiusTooLarge {
                radius: self.up_radius,
                size,
            });
        }
        if self.channel < -1 || self.channel >= channels as i64 {
            return Err(WatermarkError::ChannelOutOfRange {
                channel: self.channel,
                channels,
            });
        }
        Ok(())
    }

    /// Channels the mask covers.
    pub fn channels(&self, total: usize) -> Vec<usize> {
        if self.channel < 0 {
            (0..total).collect()
        } else {
            vec![self.channel as usize]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for kind in ["seed_ring", "seed_zeros", "seed_rand", "rand", "zeros", "const", "ring"] {
            assert_eq!(kind.parse::<PatternKind>().unwrap().to_string(), kind);
        }
        assert!("tree".parse::<PatternKind>().is_err());
        assert_eq!("no".parse::<MaskShape>().unwrap(), MaskShape::No);
        assert_eq!("l1_complex".parse::<Measurement>().unwrap(), Measurement::L1Complex);
        assert_eq!("seed".parse::<Injection>().unwrap(), Injection::Seed);
        assert!(PatternKind::SeedRing.is_spatial());
        assert!(!PatternKind::Ring.is_spatial());
    }

    #[test]
    fn test_validate() {
        let options = WatermarkOptions::default();
        assert!(options.validate(4, 64).is_ok());
        assert!(options.validate(4, 32).is_err());

        let inverted = WatermarkOptions { low_radius: 30, up_radius: 5, ..Default::default() };
        assert!(matches!(inverted.validate(4, 64), Err(WatermarkError::RadiusBand { .. })));

        let channel = WatermarkOptions { channel: 4, ..Default::default() };
        assert!(channel.validate(4, 64).is_err());

        let all = WatermarkOptions { channel: -1, ..Default::default() };
        assert!(all.validate(4, 64).is_ok());
        assert_eq!(all.channels(4), vec![0, 1, 2, 3]);
        assert_eq!(WatermarkOptions::default().channels(4), vec![0]);
    }
}
