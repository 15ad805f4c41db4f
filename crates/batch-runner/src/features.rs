use crate::job::{FeatureItem, FeatureSpec};

/// A resolved feature filter for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureFilter {
    All,
    Only(Vec<String>),
}

impl FeatureFilter {
    /// Value for `--profile-features` / `--env-features`; `None` when the
    /// flag must be omitted.
    pub fn flag_value(&self) -> Option<String> {
        match self {
            FeatureFilter::All => None,
            FeatureFilter::Only(names) => Some(names.join(",")),
        }
    }
}

/// Maps 1-based indices to names from `table`. Out-of-range indices are
/// dropped, names pass through, and an empty result means no filter.
pub fn resolve_features(spec: Option<&FeatureSpec>, table: &[String]) -> FeatureFilter {
    let entries = match spec.and_then(FeatureSpec::entries) {
        Some(entries) => entries,
        None => return FeatureFilter::All,
    };

    let mut names = Vec::with_capacity(entries.len());
    for entry in entries {
        let index = match &entry {
            FeatureItem::Index(i) => Some(*i),
            FeatureItem::Name(s) => s.trim().parse::<i64>().ok(),
        };
        match (index, entry) {
            (Some(i), _) => {
                if let Some(name) = lookup(table, i) {
                    names.push(name.to_string());
                }
            }
            (None, FeatureItem::Name(s)) => {
                let trimmed = s.trim();
                if trimmed.eq_ignore_ascii_case("all") {
                    return FeatureFilter::All;
                }
                if !trimmed.is_empty() {
                    names.push(trimmed.to_string());
                }
            }
            (None, FeatureItem::Index(_)) => {}
        }
    }

    if names.is_empty() {
        FeatureFilter::All
    } else {
        FeatureFilter::Only(names)
    }
}

fn lookup(table: &[String], index: i64) -> Option<&str> {
    if index < 1 {
        return None;
    }
    usize::try_from(index - 1)
        .ok()
        .and_then(|i| table.get(i))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_table() -> Vec<String> {
        [
            "age",
            "gender",
            "education",
            "marital_status",
            "state_residence",
            "housing_status",
            "own_other_home",
            "health_status",
            "employment_status",
            "income",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn indices(values: &[i64]) -> FeatureSpec {
        FeatureSpec::List(values.iter().map(|i| FeatureItem::Index(*i)).collect())
    }

    #[test]
    fn indices_resolve_to_one_based_names() {
        let filter = resolve_features(Some(&indices(&[2, 5])), &profile_table());
        assert_eq!(
            filter,
            FeatureFilter::Only(vec!["gender".to_string(), "state_residence".to_string()])
        );
        assert_eq!(filter.flag_value().as_deref(), Some("gender,state_residence"));
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let filter = resolve_features(Some(&indices(&[0, 1, 11, -3, 10])), &profile_table());
        assert_eq!(
            filter,
            FeatureFilter::Only(vec!["age".to_string(), "income".to_string()])
        );
    }

    #[test]
    fn huge_indices_never_wrap_into_the_table() {
        let filter = resolve_features(Some(&indices(&[(1_i64 << 32) + 1, i64::MAX])), &profile_table());
        assert_eq!(filter, FeatureFilter::All);
    }

    #[test]
    fn all_dropped_means_no_filter() {
        let filter = resolve_features(Some(&indices(&[11, 12])), &profile_table());
        assert_eq!(filter, FeatureFilter::All);
        assert_eq!(filter.flag_value(), None);
    }

    #[test]
    fn names_and_numeric_strings_mix() {
        let spec = FeatureSpec::List(vec![
            FeatureItem::Name("income".to_string()),
            FeatureItem::Name("3".to_string()),
            FeatureItem::Index(1),
        ]);
        let filter = resolve_features(Some(&spec), &profile_table());
        assert_eq!(
            filter,
            FeatureFilter::Only(vec![
                "income".to_string(),
                "education".to_string(),
                "age".to_string()
            ])
        );
    }

    #[test]
    fn keyword_all_and_missing_spec_mean_no_filter() {
        let table = profile_table();
        assert_eq!(resolve_features(None, &table), FeatureFilter::All);
        assert_eq!(
            resolve_features(Some(&FeatureSpec::Keyword("all".into())), &table),
            FeatureFilter::All
        );
        assert_eq!(
            resolve_features(Some(&FeatureSpec::Keyword("age,income".into())), &table),
            FeatureFilter::Only(vec!["age".to_string(), "income".to_string()])
        );
    }
}
