//! Fuzzy name matching
//!
//! Names are compared after trimming, lowercasing and collapsing inner
//! whitespace. The score is the Levenshtein distance between the normalized
//! names; lower is closer and 0 means equal after normalization.

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Edit distance between two strings, counted in chars
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

pub fn score(a: &str, b: &str) -> usize {
    levenshtein(&normalize_name(a), &normalize_name(b))
}

#[derive(Debug, PartialEq, Eq)]
pub struct Match<'a, T> {
    pub candidate: &'a T,
    pub score: usize,
}

/// Closest candidate whose score is at most `threshold`.
///
/// Ties go to the earliest candidate.
pub fn find_best_match<'a, T, F>(
    name: &str,
    candidates: &'a [T],
    name_of: F,
    threshold: usize,
) -> Option<Match<'a, T>>
where
    F: Fn(&T) -> &str,
{
    let wanted = normalize_name(name);
    let mut best: Option<Match<'a, T>> = None;

    for candidate in candidates {
        let score = levenshtein(&wanted, &normalize_name(name_of(candidate)));
        if score > threshold {
            continue;
        }
        if best.as_ref().map_or(true, |b| score < b.score) {
            best = Some(Match { candidate, score });
            if score == 0 {
                break;
            }
        }
    }

    best
}
