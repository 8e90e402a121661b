//! Normalized sequence-alignment ratio used for subject title resolution.
//!
//! Title matching is a selection concern, not a scoring concern, so it lives
//! apart from the comparators. The ratio is the classic diff-style
//! Ratcliff/Obershelp measure: twice the total matched characters over the
//! combined length, in [0, 1].

/// Longest common substring of `a` and `b`, as (start_a, start_b, length).
fn longest_match(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut lengths = vec![0usize; b.len() + 1];

    for i in 0..a.len() {
        let mut prev = 0;
        for j in 0..b.len() {
            let current = lengths[j + 1];
            if a[i] == b[j] {
                let len = prev + 1;
                lengths[j + 1] = len;
                if len > best.2 {
                    best = (i + 1 - len, j + 1 - len, len);
                }
            } else {
                lengths[j + 1] = 0;
            }
            prev = current;
        }
    }

    best
}

fn match_count(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (i, j, size) = longest_match(a, b);
    if size == 0 {
        return 0;
    }
    size + match_count(&a[..i], &b[..j]) + match_count(&a[i + size..], &b[j + size..])
}

/// Similarity ratio between two strings in [0, 1]; 1.0 for identical input.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * match_count(&a, &b) as f64 / total as f64
}

/// Case-insensitive best match of `query` against `candidates`, returning the
/// original-cased candidate. `None` when no candidate reaches `cutoff`.
pub fn best_match<'a>(query: &str, candidates: &'a [String], cutoff: f64) -> Option<&'a str> {
    let query = query.to_lowercase();
    candidates
        .iter()
        .map(|candidate| {
            (
                candidate.as_str(),
                sequence_ratio(&query, &candidate.to_lowercase()),
            )
        })
        .filter(|(_, ratio)| *ratio >= cutoff)
        .max_by(|(_, r1), (_, r2)| r1.total_cmp(r2))
        .map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(sequence_ratio("Linear Algebra", "Linear Algebra"), 1.0);
    }

    #[test]
    fn empty_strings_score_one() {
        assert_eq!(sequence_ratio("", ""), 1.0);
    }

    #[test]
    fn disjoint_strings_score_zero() {
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
    }

    #[test]
    fn near_match_ratio() {
        // 9 of 10 characters align once lower-cased
        let ratio = sequence_ratio("calculus i", "calculus 1");
        assert!((ratio - 0.9).abs() < 1e-9);
    }

    #[test]
    fn resolves_title_variant_above_cutoff() {
        let titles = vec!["CALCULUS 1".to_string(), "Linear Algebra".to_string()];
        assert_eq!(best_match("Calculus I", &titles, 0.3), Some("CALCULUS 1"));
    }

    #[test]
    fn no_match_below_cutoff() {
        let titles = vec!["Organic Chemistry".to_string()];
        assert_eq!(best_match("Macroeconomics", &titles, 0.4), None);
    }

    #[test]
    fn prefers_closest_candidate() {
        let titles = vec![
            "Programming II".to_string(),
            "Programming I".to_string(),
            "Databases".to_string(),
        ];
        assert_eq!(best_match("programming 1", &titles, 0.3), Some("Programming I"));
    }
}
