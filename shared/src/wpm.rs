use crate::types::WpmSample;

/// Gross words per minute, unrounded. A word is five characters.
pub fn gross_wpm(chars: usize, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    (chars as f64 / 5.0) / (seconds / 60.0)
}

/// Rounded WPM as shown to players and stored in results.
pub fn wpm(correct_chars: usize, seconds: f64) -> u32 {
    gross_wpm(correct_chars, seconds).round() as u32
}

/// Accuracy percentage rounded to two decimals; 100 when nothing was typed.
pub fn accuracy(correct_chars: usize, total_chars: usize) -> f64 {
    if total_chars == 0 {
        return 100.0;
    }
    ((correct_chars as f64 / total_chars as f64) * 10000.0).round() / 100.0
}

/// 100 minus the population standard deviation of the timeline, floored at 0.
pub fn consistency(timeline: &[WpmSample]) -> u32 {
    if timeline.len() < 2 {
        return 100;
    }
    let n = timeline.len() as f64;
    let mean = timeline.iter().map(|s| s.wpm as f64).sum::<f64>() / n;
    let variance = timeline
        .iter()
        .map(|s| (s.wpm as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (100.0 - variance.sqrt()).max(0.0).round() as u32
}
