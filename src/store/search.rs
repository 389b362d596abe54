//! Case-similarity scoring over archived history.

use crate::models::CaseHistoryRecord;
use std::collections::HashSet;

/// Character bigrams of `text`, lowercased, whitespace ignored.
///
/// A single remaining character counts as its own gram so that very
/// short queries can still match.
fn bigrams(text: &str) -> HashSet<String> {
    let chars: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if chars.len() == 1 {
        return chars.iter().map(|c| c.to_string()).collect();
    }

    chars
        .windows(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect()
}

/// Number of query bigrams found in the record's title, summary and report.
pub fn score(query: &str, record: &CaseHistoryRecord) -> usize {
    let query_grams = bigrams(query);
    if query_grams.is_empty() {
        return 0;
    }

    let haystack = format!("{} {} {}", record.title, record.case_summary, record.report);
    let record_grams = bigrams(&haystack);

    query_grams.intersection(&record_grams).count()
}

/// Rank `records` against `query`, dropping non-matches.
pub fn rank<'a, I>(query: &str, records: I, limit: usize) -> Vec<CaseHistoryRecord>
where
    I: IntoIterator<Item = &'a CaseHistoryRecord>,
{
    let mut scored: Vec<(usize, &CaseHistoryRecord)> = records
        .into_iter()
        .map(|r| (score(query, r), r))
        .filter(|(s, _)| *s > 0)
        .collect();

    // Best score first, newer cases break ties.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));

    scored
        .into_iter()
        .take(limit)
        .map(|(_, r)| r.clone())
        .collect()
}
