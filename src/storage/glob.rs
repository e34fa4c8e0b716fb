// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-compatible glob matching.
//!
//! Used by [`InMemoryStore`](super::memory::InMemoryStore) so that pattern
//! invalidation behaves the same against memory and against `SCAN MATCH`:
//!
//! ```text
//! *        any run of characters (including none)
//! ?        exactly one character
//! [abc]    one of the listed characters
//! [a-z]    one character in the range
//! [^a]     any character except the listed ones
//! \x       literal x
//! ```

/// Returns true if `text` matches `pattern`.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // Position of the last `*` seen and the text index it was matched against
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    } else if t[ti] == '[' {
                        // Unterminated class is a literal '['
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        // Mismatch: backtrack to the last star and let it absorb one more char
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match one character against the class starting at `p[start] == '['`.
/// Returns `(matched, index_after_class)` or `None` if the class never closes.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        let lo = if p[i] == '\\' && i + 1 < p.len() {
            i += 1;
            p[i]
        } else {
            p[i]
        };

        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let hi = p[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if c >= lo && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if c == lo {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_any_run() {
        assert!(glob_match("user:*", "user:1"));
        assert!(glob_match("user:*", "user:"));
        assert!(glob_match("user:*", "user:1:profile"));
        assert!(!glob_match("user:*", "course:1"));
        assert!(glob_match("*", ""));
        assert!(glob_match("*:profile", "user:42:profile"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("user:?", "user:1"));
        assert!(!glob_match("user:?", "user:12"));
        assert!(!glob_match("user:?", "user:"));
    }

    #[test]
    fn test_character_classes() {
        assert!(glob_match("user:[12]", "user:1"));
        assert!(!glob_match("user:[12]", "user:3"));
        assert!(glob_match("user:[0-9]", "user:7"));
        assert!(glob_match("user:[^0-9]", "user:x"));
        assert!(!glob_match("user:[^0-9]", "user:5"));
    }

    #[test]
    fn test_escape_and_literal_bracket() {
        assert!(glob_match("user:\\*", "user:*"));
        assert!(!glob_match("user:\\*", "user:1"));
        assert!(glob_match("weird[", "weird["));
    }

    #[test]
    fn test_exact_match_without_wildcards() {
        assert!(glob_match("course:1", "course:1"));
        assert!(!glob_match("course:1", "course:10"));
    }
}
