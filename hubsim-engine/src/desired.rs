//! Merge of remote desired properties into the device state

use serde_json::Value;
use tracing::{debug, warn};

use hubsim_transport::PropertyMap;

use crate::state::{ConfigState, Field, StateHandle};

/// Options controlling how desired properties are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePolicy {
    /// Reject sleep bound changes that would leave `sleep_min > sleep_max`
    pub strict_bounds: bool,
}

/// How a single desired property entry is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Known(Field, u64),
    Unparseable(Field),
    Ignored(String),
}

/// Classify a desired property. Accepted values are unsigned JSON integers
/// or strings holding one.
pub fn classify(key: &str, value: &Value) -> Entry {
    let Ok(field) = key.parse::<Field>() else {
        return Entry::Ignored(key.to_owned());
    };

    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(value) => Entry::Known(field, value),
        None => Entry::Unparseable(field),
    }
}

/// Outcome of a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: Vec<(Field, u64)>,
    pub unparseable: Vec<Field>,
    pub ignored: Vec<String>,
    /// Sleep bounds left out because of [`MergePolicy::strict_bounds`]
    pub rejected: Vec<(Field, u64)>,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Apply a desired property bag (full or delta) to the device state.
///
/// Known keys are matched case-insensitively and all of them are written in
/// a single atomic update. Unknown keys and `$` metadata are ignored, and
/// values that do not parse leave the previous value in place.
pub fn merge_desired(
    state: &StateHandle,
    properties: &PropertyMap,
    policy: MergePolicy,
) -> MergeReport {
    let mut report = MergeReport::default();
    let mut known = Vec::new();

    for (key, value) in properties {
        if key.starts_with('$') {
            continue;
        }
        match classify(key, value) {
            Entry::Known(field, value) => known.push((field, value)),
            Entry::Unparseable(field) => {
                debug!(%field, %value, "ignoring unparseable desired property");
                report.unparseable.push(field);
            }
            Entry::Ignored(key) => {
                debug!(%key, "ignoring unknown desired property");
                report.ignored.push(key);
            }
        }
    }

    if known.is_empty() {
        return report;
    }

    state.update(|current| {
        let mut candidate = *current;
        for (field, value) in &known {
            candidate.set(*field, *value);
        }

        if policy.strict_bounds && candidate.sleep_min_ms > candidate.sleep_max_ms {
            warn!(
                sleep_min = candidate.sleep_min_ms,
                sleep_max = candidate.sleep_max_ms,
                "rejecting inverted sleep bounds"
            );
            let (bounds, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut known)
                .into_iter()
                .partition(|(field, _)| matches!(field, Field::SleepMin | Field::SleepMax));
            report.rejected = bounds;
            known = rest;
            candidate = ConfigState {
                sleep_min_ms: current.sleep_min_ms,
                sleep_max_ms: current.sleep_max_ms,
                ..candidate
            };
        }

        *current = candidate;
    });

    for (field, value) in &known {
        debug!(%field, value, "applied desired property");
    }
    report.applied = known;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    fn state() -> StateHandle {
        StateHandle::new(ConfigState {
            sleep_min_ms: 100,
            sleep_max_ms: 300,
            reported_counter: 7,
        })
    }

    #[test]
    fn it_classifies_entries() {
        assert_eq!(
            classify("SleepMin", &json!("500")),
            Entry::Known(Field::SleepMin, 500)
        );
        assert_eq!(
            classify("sleepmax", &json!(900)),
            Entry::Known(Field::SleepMax, 900)
        );
        assert_eq!(
            classify("sleepmax", &json!(-1)),
            Entry::Unparseable(Field::SleepMax)
        );
        assert_eq!(
            classify("reportedcounter", &json!("ten")),
            Entry::Unparseable(Field::ReportedCounter)
        );
        assert_eq!(
            classify("color", &json!("red")),
            Entry::Ignored("color".into())
        );
    }

    #[test]
    fn it_updates_only_the_fields_in_the_delta() {
        let state = state();
        let report = merge_desired(&state, &props(json!({"sleepmin": "500"})), MergePolicy::default());

        assert_eq!(report.applied, vec![(Field::SleepMin, 500)]);
        assert_eq!(
            state.get(),
            ConfigState {
                sleep_min_ms: 500,
                sleep_max_ms: 300,
                reported_counter: 7,
            }
        );
    }

    #[test]
    fn it_leaves_the_state_alone_for_unknown_keys() {
        let state = state();
        let before = state.get();
        let report = merge_desired(
            &state,
            &props(json!({"color": "red", "$version": 4, "nested": {"sleepmin": 1}})),
            MergePolicy::default(),
        );

        assert!(report.is_noop());
        assert_eq!(report.ignored.len(), 2);
        assert_eq!(state.get(), before);
    }

    #[test]
    fn it_keeps_the_previous_value_for_unparseable_entries() {
        let state = state();
        let report = merge_desired(
            &state,
            &props(json!({"sleepmin": "soon", "sleepmax": "450"})),
            MergePolicy::default(),
        );

        assert_eq!(report.unparseable, vec![Field::SleepMin]);
        assert_eq!(state.get().sleep_min_ms, 100);
        assert_eq!(state.get().sleep_max_ms, 450);
    }

    #[test]
    fn it_accepts_inverted_bounds_by_default() {
        let state = state();
        merge_desired(&state, &props(json!({"sleepmin": 1000})), MergePolicy::default());

        assert_eq!(state.get().sleep_min_ms, 1000);
        assert_eq!(state.get().sleep_max_ms, 300);
    }

    #[test]
    fn it_rejects_inverted_bounds_when_strict() {
        let state = state();
        let policy = MergePolicy {
            strict_bounds: true,
        };
        let report = merge_desired(
            &state,
            &props(json!({"sleepmin": 1000, "reportedcounter": "42"})),
            policy,
        );

        assert_eq!(report.rejected, vec![(Field::SleepMin, 1000)]);
        assert_eq!(report.applied, vec![(Field::ReportedCounter, 42)]);
        assert_eq!(state.get().sleep_min_ms, 100);
        assert_eq!(state.get().reported_counter, 42);
    }

    #[test]
    fn it_applies_random_subsets_of_known_fields() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let state = state();
            let before = state.get();
            let mut delta = PropertyMap::new();
            let mut expected = before;
            for field in [Field::SleepMin, Field::SleepMax, Field::ReportedCounter] {
                if rng.random_bool(0.5) {
                    let value = rng.random_range(0..100_000u64);
                    delta.insert(field.as_str().to_owned(), json!(value.to_string()));
                    expected.set(field, value);
                }
            }

            merge_desired(&state, &delta, MergePolicy::default());
            assert_eq!(state.get(), expected);
        }
    }
}
