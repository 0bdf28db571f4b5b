//! String similarity used to compare model descriptions with element names.

/// Case-folded similarity in `[0, 1]`: exact match is 1.0, containment in
/// either direction is 0.8, anything else falls back to [`sequence_ratio`].
/// Empty input on either side scores 0.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 0.8;
    }
    sequence_ratio(&a, &b)
}

/// Ratcliff/Obershelp ratio `2 * M / T`, where `M` counts characters in the
/// recursively found longest common blocks and `T` is the combined length.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, k) = longest_block(a, b);
    if k == 0 {
        return 0;
    }
    k + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + k..], &b[j + k..])
}

/// Longest common substring, earliest in `a` then earliest in `b`.
fn longest_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    // run[j + 1] = length of the common suffix ending at a[i], b[j]
    let mut prev = vec![0usize; b.len() + 1];
    let mut run = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        for (j, cb) in b.iter().enumerate() {
            run[j + 1] = if ca == cb { prev[j] + 1 } else { 0 };
            let k = run[j + 1];
            if k > best.2 {
                best = (i + 1 - k, j + 1 - k, k);
            }
        }
        std::mem::swap(&mut prev, &mut run);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_containment_shortcuts() {
        assert_eq!(text_similarity("  Save ", "save"), 1.0);
        assert_eq!(text_similarity("Save As", "save"), 0.8);
        assert_eq!(text_similarity("", "save"), 0.0);
    }

    #[test]
    fn ratio_matches_known_values() {
        // "abcd" vs "bcde": block "bcd" -> 2*3/8
        assert!((sequence_ratio("abcd", "bcde") - 0.75).abs() < 1e-9);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
        assert_eq!(sequence_ratio("", ""), 1.0);
    }

    #[test]
    fn ratio_recurses_on_both_sides() {
        // blocks "ab" and "cd" around the mismatch
        assert!((sequence_ratio("abXcd", "abYcd") - 0.8).abs() < 1e-9);
    }

    #[test]
    fn handles_non_ascii() {
        assert!((sequence_ratio("保存文件", "保存") - 2.0 * 2.0 / 6.0).abs() < 1e-9);
    }
}
