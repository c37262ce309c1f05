/*!
Test patterns for exercising fixtures without a lighting console.
*/

use clap::ValueEnum;
use std::f64::consts::PI;

/// Channel pattern generated once per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Pattern {
    /// Every channel at the amplitude
    Same,
    /// Every channel ramps up by `step` per tick, wrapping at 255
    Rising,
    /// Sine waves 120° apart on each group of three channels (RGB fixtures)
    Rainbow,
    /// Alternate between the amplitude and zero every tick
    Strobe,
}

impl Pattern {
    /// Channel values for `tick`.
    ///
    /// `step` is ticks per cycle for [`Pattern::Rainbow`] and the value
    /// increment per tick for [`Pattern::Rising`]; other patterns ignore it.
    pub fn render(self, tick: u64, amplitude: u8, step: u32, count: usize) -> Vec<u8> {
        match self {
            Pattern::Same => vec![amplitude; count],
            Pattern::Rising => {
                // Steps beyond one full channel range saturate; the ramp itself wraps
                let step = u8::try_from(step).unwrap_or(u8::MAX);
                let value = ((tick % 255) as u8).wrapping_mul(step);
                vec![value; count]
            }
            Pattern::Rainbow => {
                let period = f64::from(step.max(1));
                let phase = 2.0 * PI * (tick as f64) / period;
                (0..count)
                    .map(|channel| {
                        let offset = 2.0 * PI * ((channel % 3) as f64) / 3.0;
                        (((phase + offset).sin() + 1.0) / 2.0 * f64::from(amplitude)) as u8
                    })
                    .collect()
            }
            Pattern::Strobe => {
                let value = if tick % 2 == 1 { amplitude } else { 0 };
                vec![value; count]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_fills_every_channel() {
        assert_eq!(Pattern::Same.render(7, 128, 10, 4), vec![128; 4]);
    }

    #[test]
    fn test_rising_wraps() {
        assert_eq!(Pattern::Rising.render(0, 255, 4, 2), vec![0, 0]);
        assert_eq!(Pattern::Rising.render(3, 255, 4, 2), vec![12, 12]);
        assert_eq!(Pattern::Rising.render(64, 255, 4, 1), vec![0]);
        assert_eq!(Pattern::Rising.render(256, 255, 4, 1), vec![4]);
    }

    #[test]
    fn test_rising_saturates_large_steps() {
        assert_eq!(Pattern::Rising.render(1, 255, 256, 1), vec![255]);
        assert_eq!(Pattern::Rising.render(1, 255, 10_000, 1), vec![255]);
        assert_eq!(Pattern::Rising.render(2, 255, 256, 1), vec![254]);
    }

    #[test]
    fn test_strobe_alternates() {
        assert_eq!(Pattern::Strobe.render(0, 200, 1, 3), vec![0; 3]);
        assert_eq!(Pattern::Strobe.render(1, 200, 1, 3), vec![200; 3]);
        assert_eq!(Pattern::Strobe.render(2, 200, 1, 3), vec![0; 3]);
    }

    #[test]
    fn test_rainbow_phases() {
        let frame = Pattern::Rainbow.render(0, 200, 12, 6);
        assert_eq!(frame.len(), 6);
        // Channel 0 starts at the midpoint, the other two are 120° either side
        assert_eq!(frame[0], 100);
        assert_eq!(frame[1], 186);
        assert_eq!(frame[2], 13);
        assert_eq!(&frame[0..3], &frame[3..6]);

        // A quarter period later channel 0 peaks
        assert_eq!(Pattern::Rainbow.render(3, 200, 12, 1), vec![200]);
    }

    #[test]
    fn test_rainbow_zero_period_does_not_divide_by_zero() {
        let frame = Pattern::Rainbow.render(5, 255, 0, 3);
        assert_eq!(frame.len(), 3);
    }
}
