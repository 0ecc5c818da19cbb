use std::collections::BTreeMap;

use cpaor_core::{EventCount, EventRecord, NaturalKey};

/// Concatenates `existing` then `fresh`, keeps the last row per natural key
/// and returns the rows sorted by key.
pub fn merge_dedup<T: NaturalKey>(existing: Vec<T>, fresh: Vec<T>) -> Vec<T> {
    let mut by_key = BTreeMap::new();
    for row in existing.into_iter().chain(fresh) {
        by_key.insert(row.natural_key(), row);
    }
    by_key.into_values().collect()
}

/// Collapses events sharing a key into one row whose fatalities are the sum.
pub fn sum_fatalities(events: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut by_key: BTreeMap<_, EventRecord> = BTreeMap::new();
    for event in events {
        let fatalities = event.fatalities;
        by_key
            .entry(event.natural_key())
            .and_modify(|kept| kept.fatalities += fatalities)
            .or_insert(event);
    }
    by_key.into_values().collect()
}

/// Adds one to the persisted `(country, year)` count for every fresh event.
pub fn accumulate_counts(
    existing: Vec<EventCount>,
    fresh: impl IntoIterator<Item = (String, i32)>,
) -> Vec<EventCount> {
    let mut counts: BTreeMap<(String, i32), u64> = BTreeMap::new();
    for row in existing {
        *counts.entry(row.natural_key()).or_default() += row.number_of_events;
    }
    for key in fresh {
        *counts.entry(key).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|((country, year), number_of_events)| EventCount {
            country,
            year,
            number_of_events,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        country: &'static str,
        year: i32,
        value: i32,
    }

    impl NaturalKey for Row {
        type Key = (&'static str, i32);

        fn natural_key(&self) -> Self::Key {
            (self.country, self.year)
        }
    }

    fn row(country: &'static str, year: i32, value: i32) -> Row {
        Row { country, year, value }
    }

    #[test]
    fn newer_row_wins_on_key_conflict() {
        let merged = merge_dedup(vec![row("X", 2023, 1)], vec![row("X", 2023, 2)]);
        assert_eq!(merged, vec![row("X", 2023, 2)]);
    }

    #[test]
    fn merging_with_nothing_new_is_idempotent() {
        let table = merge_dedup(
            vec![row("Sudan", 2024, 3), row("Chad", 2022, 1), row("Chad", 2021, 9)],
            Vec::new(),
        );
        assert_eq!(
            table,
            vec![row("Chad", 2021, 9), row("Chad", 2022, 1), row("Sudan", 2024, 3)]
        );
        assert_eq!(merge_dedup(table.clone(), Vec::new()), table);
    }

    #[test]
    fn duplicates_within_one_side_keep_the_last() {
        let merged = merge_dedup(
            vec![row("Mali", 2020, 1), row("Mali", 2020, 4)],
            vec![row("Niger", 2020, 5), row("Niger", 2020, 6)],
        );
        assert_eq!(merged, vec![row("Mali", 2020, 4), row("Niger", 2020, 6)]);
    }

    fn event(admin1: &str, fatalities: i64) -> EventRecord {
        EventRecord {
            country: "Sudan".into(),
            admin1: admin1.into(),
            event_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            latitude: 13.63,
            longitude: 25.35,
            event_type: "Violence against civilians".into(),
            fatalities,
        }
    }

    #[test]
    fn fatalities_are_summed_per_event_key() {
        let summed = sum_fatalities(vec![
            event("North Darfur", 2),
            event("North Darfur", 3),
            event("South Darfur", 1),
        ]);
        assert_eq!(summed.len(), 2);
        assert_eq!(summed[0].fatalities, 5);
        assert_eq!(summed[1].fatalities, 1);
    }

    #[test]
    fn event_counts_add_to_persisted_totals() {
        let existing = vec![EventCount {
            country: "Mali".into(),
            year: 2024,
            number_of_events: 10,
        }];
        let counts = accumulate_counts(
            existing,
            vec![
                ("Mali".to_string(), 2024),
                ("Mali".to_string(), 2024),
                ("Chad".to_string(), 2023),
            ],
        );
        assert_eq!(
            counts,
            vec![
                EventCount {
                    country: "Chad".into(),
                    year: 2023,
                    number_of_events: 1
                },
                EventCount {
                    country: "Mali".into(),
                    year: 2024,
                    number_of_events: 12
                },
            ]
        );
    }
}
