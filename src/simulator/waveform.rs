//! Synthetic ECG/PPG generator.

use std::f64::consts::PI;

use rand::Rng;

use crate::reading::Reading;

/// P, Q, R, S and T waves as (center phase, amplitude mV, width).
const ECG_WAVES: [(f64, f64, f64); 5] = [
    (0.20, 0.12, 0.025),
    (0.37, -0.10, 0.010),
    (0.40, 1.20, 0.012),
    (0.43, -0.25, 0.010),
    (0.65, 0.30, 0.040),
];

/// Produces strictly increasing samples at a fixed rate.
#[derive(Debug, Clone)]
pub struct Waveform {
    step_ms: i64,
    heart_rate_bpm: f64,
    next_timestamp: Option<i64>,
}

impl Waveform {
    pub fn new(sample_rate_hz: f64, heart_rate_bpm: f64) -> Self {
        let step_ms = (1000.0 / sample_rate_hz.max(1.0)).round().max(1.0) as i64;
        Self {
            step_ms,
            heart_rate_bpm: heart_rate_bpm.clamp(20.0, 250.0),
            next_timestamp: None,
        }
    }

    pub fn step_ms(&self) -> i64 {
        self.step_ms
    }

    /// Up to `count` samples ending at `now`, never repeating a timestamp.
    pub fn take(&mut self, count: usize, now: i64) -> Vec<Reading> {
        let window_start = now - self.step_ms * count as i64;
        let start = self.next_timestamp.map_or(window_start, |next| next.max(window_start));

        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(count);
        let mut ts = start;
        while out.len() < count {
            out.push(self.sample(ts, &mut rng));
            ts += self.step_ms;
        }
        self.next_timestamp = Some(ts);
        out
    }

    /// Samples from the last emitted one up to `now`.
    pub fn catch_up(&mut self, now: i64) -> Vec<Reading> {
        let Some(next) = self.next_timestamp else {
            self.next_timestamp = Some(now);
            return Vec::new();
        };
        let due = ((now - next) / self.step_ms).max(0) as usize;
        if due == 0 {
            return Vec::new();
        }
        self.take(due, next + self.step_ms * due as i64)
    }

    fn sample(&self, timestamp: i64, rng: &mut impl Rng) -> Reading {
        let beat_ms = 60_000.0 / self.heart_rate_bpm;
        let phase = (timestamp as f64 % beat_ms) / beat_ms;

        let ecg: f64 = ECG_WAVES
            .iter()
            .map(|&(center, amp, width)| {
                amp * (-((phase - center).powi(2)) / (2.0 * width * width)).exp()
            })
            .sum::<f64>()
            + rng.gen_range(-0.02..0.02);

        // Systolic upstroke lags the R wave; small dicrotic bump after.
        let pulse_phase = (phase - 0.45).rem_euclid(1.0);
        let pulse = (PI * pulse_phase.min(0.5) * 2.0).sin().max(0.0)
            + 0.15 * (-((pulse_phase - 0.6).powi(2)) / 0.004).exp();
        let ppg = (512.0 + 300.0 * pulse + rng.gen_range(-4.0..4.0)).round();

        Reading {
            timestamp,
            ecg: (ecg * 1000.0).round() / 1000.0,
            ppg: Some(ppg),
            heart_rate: Some((self.heart_rate_bpm + rng.gen_range(-1.0..1.0)).round()),
            spo2: Some(rng.gen_range(96..=99) as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_never_repeats_timestamps() {
        let mut wave = Waveform::new(250.0, 72.0);
        let first = wave.take(20, 1_000_000);
        let second = wave.take(20, 1_000_000);
        assert_eq!(first.len(), 20);
        assert_eq!(second.len(), 20);
        assert!(first.last().unwrap().timestamp < second[0].timestamp);
        assert!(second.windows(2).all(|w| w[1].timestamp - w[0].timestamp == 4));
    }

    #[test]
    fn test_samples_are_complete() {
        let mut wave = Waveform::new(100.0, 60.0);
        for r in wave.take(200, 5_000_000) {
            assert!(r.is_finite());
            assert!(r.ecg > -1.0 && r.ecg < 2.0);
            assert!(r.ppg.is_some() && r.heart_rate.is_some() && r.spo2.is_some());
        }
    }

    #[test]
    fn test_catch_up_emits_due_samples() {
        let mut wave = Waveform::new(250.0, 72.0);
        assert!(wave.catch_up(1_000).is_empty());
        let due = wave.catch_up(1_040);
        assert_eq!(due.len(), 10);
        assert_eq!(due[0].timestamp, 1_000);
        assert!(wave.catch_up(1_041).is_empty());
    }
}
