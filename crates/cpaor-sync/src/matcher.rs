//! Character-sequence similarity and greedy cross-list pairing of region names.

use std::collections::{BTreeMap, HashMap};

/// Pairs must score strictly above this to be matched.
pub const SIMILARITY_FLOOR: f64 = 0.7;

/// `2 * M / T` where `M` counts characters in the matching blocks found by
/// recursive longest-common-substring search and `T` is the combined length.
/// Two empty strings score `1.0`. Case-sensitive.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_chars(&a, &b) as f64 / total as f64
}

fn matched_chars(a: &[char], b: &[char]) -> usize {
    let mut b_index: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, c) in b.iter().enumerate() {
        b_index.entry(*c).or_default().push(j);
    }

    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_match(a, &b_index, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }
    matched
}

/// Longest block `a[i..i+size] == b[j..j+size]` inside the given window.
/// Ties go to the smallest `i`, then the smallest `j`.
fn longest_match(
    a: &[char],
    b_index: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    // run length of the match ending at b[j], for the previous row of `a`
    let mut run_ending_at: HashMap<usize, usize> = HashMap::new();
    for (i, c) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut next: HashMap<usize, usize> = HashMap::new();
        for &j in b_index.get(c).map(Vec::as_slice).unwrap_or_default() {
            if j < blo {
                continue;
            }
            if j >= bhi {
                break;
            }
            let k = j
                .checked_sub(1)
                .and_then(|prev| run_ending_at.get(&prev))
                .copied()
                .unwrap_or(0)
                + 1;
            next.insert(j, k);
            if k > best_size {
                best_i = i + 1 - k;
                best_j = j + 1 - k;
                best_size = k;
            }
        }
        run_ending_at = next;
    }
    (best_i, best_j, best_size)
}

/// Result of [`find_maximum_matches`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GreedyMatch {
    pub matches: BTreeMap<String, String>,
    pub unmatched_source: Vec<String>,
    pub unmatched_target: Vec<String>,
}

/// Repeatedly pairs the most similar remaining `(source, target)` names whose
/// score is strictly above `floor`, removing both from further consideration.
///
/// Scanning is source-major in input order and only a strictly greater score
/// replaces the current best, so the first pair found wins a tie. The result
/// therefore depends on input order when scores tie.
pub fn find_maximum_matches(source: Vec<String>, target: Vec<String>, floor: f64) -> GreedyMatch {
    let scores: Vec<Vec<f64>> = source
        .iter()
        .map(|s| target.iter().map(|t| string_similarity(s, t)).collect())
        .collect();
    let mut source_alive = vec![true; source.len()];
    let mut target_alive = vec![true; target.len()];
    let mut pairs = Vec::new();

    loop {
        let mut best: Option<(usize, usize)> = None;
        let mut best_score = floor;
        for (si, row) in scores.iter().enumerate() {
            if !source_alive[si] {
                continue;
            }
            for (ti, &score) in row.iter().enumerate() {
                if target_alive[ti] && score > best_score {
                    best_score = score;
                    best = Some((si, ti));
                }
            }
        }
        let Some((si, ti)) = best else {
            break;
        };
        source_alive[si] = false;
        target_alive[ti] = false;
        pairs.push((si, ti));
    }

    let mut out = GreedyMatch::default();
    for (si, ti) in pairs {
        out.matches.insert(source[si].clone(), target[ti].clone());
    }
    out.unmatched_source = source
        .into_iter()
        .zip(source_alive)
        .filter_map(|(name, alive)| alive.then_some(name))
        .collect();
    out.unmatched_target = target
        .into_iter()
        .zip(target_alive)
        .filter_map(|(name, alive)| alive.then_some(name))
        .collect();
    out
}
