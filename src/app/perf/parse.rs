use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::app::models::clamp_score;

fn total_frames_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Total frames rendered:\s*(\d+)").ok())
        .as_ref()
}

fn total_pss_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // Newer builds print `TOTAL PSS:  123456`, older ones `TOTAL  123456  ...`.
    RE.get_or_init(|| Regex::new(r"(?m)^\s*TOTAL(?:\s+PSS:|:)?\s+(\d+)").ok())
        .as_ref()
}

/// `Total frames rendered` from `dumpsys gfxinfo <package>`.
pub fn parse_gfxinfo_total_frames(output: &str) -> Option<u64> {
    total_frames_regex()?
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|value| value.as_str().parse::<u64>().ok())
}

/// Total PSS in kB from `dumpsys meminfo <package>`.
pub fn parse_meminfo_total_pss_kb(output: &str) -> Option<u64> {
    total_pss_regex()?
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|value| value.as_str().parse::<u64>().ok())
}

pub fn frames_per_second(frames: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    frames as f64 / secs
}

/// Ratio of measured fps against the target ceiling, as 0..=100.
pub fn performance_score(fps: f64, target_fps: f64) -> f64 {
    if target_fps <= 0.0 {
        return 0.0;
    }
    clamp_score(fps / target_fps * 100.0)
}

/// 100 at zero usage, falling linearly to 0 at the ceiling.
pub fn memory_score(used_mb: f64, ceiling_mb: f64) -> f64 {
    if ceiling_mb <= 0.0 {
        return 0.0;
    }
    clamp_score(100.0 - used_mb / ceiling_mb * 100.0)
}

pub fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_total_frames() {
        let output = "Applications Graphics Acceleration Info:\n** Graphics info for pid 4321 [com.example.game] **\n\nStats since: 1234ns\nTotal frames rendered: 287\nJanky frames: 12 (4.18%)\n";
        assert_eq!(parse_gfxinfo_total_frames(output), Some(287));
        assert_eq!(parse_gfxinfo_total_frames("No process found for: com.example"), None);
    }

    #[test]
    fn parses_total_pss_in_both_layouts() {
        let modern = "App Summary\n           TOTAL PSS:   143210       TOTAL RSS:   201000      TOTAL SWAP PSS:      12\n";
        assert_eq!(parse_meminfo_total_pss_kb(modern), Some(143210));

        let legacy = "                 Pss  Private  Private  SwapPss     Heap\n        TOTAL    98304    80000     1000        0    40000\n";
        assert_eq!(parse_meminfo_total_pss_kb(legacy), Some(98304));

        assert_eq!(parse_meminfo_total_pss_kb("No process found for: com.example"), None);
    }

    #[test]
    fn fps_over_window() {
        assert_eq!(frames_per_second(300, Duration::from_secs(5)), 60.0);
        assert_eq!(frames_per_second(300, Duration::ZERO), 0.0);
    }

    #[test]
    fn performance_score_is_clamped_ratio() {
        assert_eq!(performance_score(45.0, 60.0), 75.0);
        assert_eq!(performance_score(90.0, 60.0), 100.0);
        assert_eq!(performance_score(10.0, 0.0), 0.0);
    }

    #[test]
    fn memory_score_decreases_toward_ceiling() {
        assert_eq!(memory_score(0.0, 200.0), 100.0);
        assert_eq!(memory_score(50.0, 200.0), 75.0);
        assert_eq!(memory_score(250.0, 200.0), 0.0);
    }
}
