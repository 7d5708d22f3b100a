//! Glob matching for pattern subscriptions.
//!
//! Follows the Redis `PSUBSCRIBE` dialect so that the in-process broker and
//! the Redis broker agree on which channels a pattern covers:
//!
//! | token | matches |
//! |-------|---------|
//! | `*` | any run of characters, including none |
//! | `?` | exactly one character |
//! | `[abc]`, `[a-z]` | one character from the set or range |
//! | `[^a]` | one character not in the set |
//! | `\x` | the literal `x` |

/// Returns `true` if `channel` is covered by `pattern`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match_bytes(pattern.as_bytes(), channel.as_bytes())
}

/// Wildcard matching with a single backtrack point.
///
/// Every token other than `*` consumes exactly one channel byte, so on a
/// mismatch it is enough to retry from the most recent `*` with one more
/// byte swallowed. Runs in O(pattern × channel).
fn match_bytes(p: &[u8], s: &[u8]) -> bool {
    let (mut pi, mut si) = (0, 0);
    // Pattern index just past the last `*`, and the channel index it resumes at.
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if p.get(pi) == Some(&b'*') {
            while p.get(pi) == Some(&b'*') {
                pi += 1;
            }
            if pi == p.len() {
                return true;
            }
            star = Some((pi, si));
            continue;
        }
        if let Some(width) = match_token(&p[pi..], s[si]) {
            pi += width;
            si += 1;
            continue;
        }
        match star {
            Some((resume, swallowed)) => {
                star = Some((resume, swallowed + 1));
                pi = resume;
                si = swallowed + 1;
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// Matches the non-`*` token at the start of `p` against `ch`, returning the
/// number of pattern bytes the token spans.
fn match_token(p: &[u8], ch: u8) -> Option<usize> {
    match p {
        [] => None,
        [b'?', ..] => Some(1),
        [b'[', body @ ..] => match match_class(body, ch) {
            Some((true, after)) => Some(p.len() - after.len()),
            Some((false, _)) => None,
            // Unterminated class: the bracket is literal.
            None if ch == b'[' => Some(1),
            None => None,
        },
        [b'\\', escaped, ..] => (*escaped == ch).then_some(2),
        [c, ..] => (*c == ch).then_some(1),
    }
}

/// Matches `ch` against a class body starting just after `[`.
///
/// Returns the match result and the pattern following the closing `]`, or
/// `None` if the class is never closed.
fn match_class(mut p: &[u8], ch: u8) -> Option<(bool, &[u8])> {
    let negate = p.first() == Some(&b'^');
    if negate {
        p = &p[1..];
    }
    let mut matched = false;
    loop {
        match p {
            [] => return None,
            [b']', rest @ ..] => return Some((matched != negate, rest)),
            [b'\\', escaped, rest @ ..] => {
                matched |= *escaped == ch;
                p = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                matched |= (lo..=hi).contains(&ch);
                p = rest;
            }
            [other, rest @ ..] => {
                matched |= *other == ch;
                p = rest;
            }
        }
    }
}
