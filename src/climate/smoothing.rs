use std::collections::VecDeque;

/// Number of samples the zone temperatures are averaged over. At the default poll interval this
/// is about five minutes.
pub const TEMPERATURE_SAMPLES: usize = 300;

/// A moving average over the most recent samples, reported with a resolution of 0.1.
#[derive(Debug)]
pub struct MovingAverage {
    samples: VecDeque<f32>,
    capacity: usize,
    sum: f64,
    reported: Option<f32>,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum: 0.0,
            reported: None,
        }
    }

    /// Add a sample. Returns the rounded average if it differs from the one returned last.
    pub fn push(&mut self, sample: f32) -> Option<f32> {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= f64::from(oldest);
            }
        }
        self.samples.push_back(sample);
        self.sum += f64::from(sample);
        let average = self.sum / self.samples.len() as f64;
        let rounded = ((average * 10.0).round() / 10.0) as f32;
        if self.reported == Some(rounded) {
            return None;
        }
        self.reported = Some(rounded);
        Some(rounded)
    }

    pub fn average(&self) -> Option<f32> {
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_only_changes() {
        let mut average = MovingAverage::new(TEMPERATURE_SAMPLES);
        assert_eq!(average.push(20.5), Some(20.5));
        assert_eq!(average.push(20.5), None);
        assert_eq!(average.push(21.0), Some(20.7));
        assert_eq!(average.push(20.5), Some(20.6));
        assert_eq!(average.average(), Some(20.6));
    }

    #[test]
    fn forgets_old_samples() {
        let mut average = MovingAverage::new(3);
        for sample in [10.0, 10.0, 10.0] {
            average.push(sample);
        }
        assert_eq!(average.push(13.0), Some(11.0));
        assert_eq!(average.push(13.0), Some(12.0));
        assert_eq!(average.push(13.0), Some(13.0));
        assert_eq!(average.push(13.0), None);
    }

    #[test]
    fn small_drifts_are_swallowed() {
        let mut average = MovingAverage::new(TEMPERATURE_SAMPLES);
        for _ in 0..100 {
            average.push(20.0);
        }
        assert_eq!(average.push(20.5), None);
        assert_eq!(average.average(), Some(20.0));
    }
}
