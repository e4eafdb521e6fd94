use std::time::Duration;

/// Renders a duration as its two most significant units,
/// e.g. "1 h, 30 m", "5 m, 20 s", "1 s, 133 ms".
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, u128); 5] =
        [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)];

    let mut remaining = duration.as_millis();
    if remaining == 0 {
        return "0 ms".to_string();
    }

    let mut parts: Vec<String> = Vec::with_capacity(2);
    for (unit, size) in UNITS {
        if parts.len() == 2 {
            break;
        }
        let amount = remaining / size;
        remaining %= size;
        if amount > 0 {
            parts.push(format!("{} {}", amount, unit));
        }
    }
    parts.join(", ")
}

/// Cuts text down to at most max_chars characters, marking the cut with
/// an ellipsis. Counts characters, not bytes, so multibyte text is safe.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_show_two_most_significant_units() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0 ms");
        assert_eq!(format_duration(Duration::from_millis(10)), "10 ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1 s, 500 ms");
        assert_eq!(format_duration(Duration::from_secs(65)), "1 m, 5 s");
        assert_eq!(format_duration(Duration::from_secs(3600 + 120)), "1 h, 2 m");
        assert_eq!(format_duration(Duration::from_secs(86400 + 3600)), "1 d, 1 h");
        assert_eq!(format_duration(Duration::from_secs(90061)), "1 d, 1 h");
        assert_eq!(format_duration(Duration::from_millis(59999)), "59 s, 999 ms");
    }

    #[test]
    fn skipped_units_do_not_count_against_the_limit() {
        assert_eq!(format_duration(Duration::from_secs(86400 + 60)), "1 d, 1 m");
    }

    #[test]
    fn truncate_leaves_short_text_alone() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 5), "hello");
    }

    #[test]
    fn truncate_marks_the_cut() {
        assert_eq!(truncate("hello world", 5), "hello...");
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
    }
}
