use proptest::prelude::*;
use sluice_common::config::ClassifierSettings;
use sluice_common::models::TargetStore;
use sluice_runtime::classifier::QueryClassifier;

fn classifier() -> QueryClassifier {
    let mut settings = ClassifierSettings::default();
    settings.table_rows.insert("events".into(), 2_000_000);
    settings.table_rows.insert("users".into(), 40_000);
    QueryClassifier::new(&settings)
}

fn table() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["events", "users", "accounts"])
}

fn column() -> impl Strategy<Value = String> {
    "c_[a-z]{1,8}"
}

fn read_query() -> impl Strategy<Value = String> {
    prop_oneof![
        (table(), column(), any::<u32>())
            .prop_map(|(t, c, v)| format!("SELECT * FROM {} WHERE {} = {}", t, c, v)),
        (table(), column())
            .prop_map(|(t, c)| format!("SELECT {}, COUNT(*) FROM {} GROUP BY {}", c, t, c)),
        (table(), column(), 1..100_000u32)
            .prop_map(|(t, c, n)| format!("SELECT {} FROM {} ORDER BY {} LIMIT {}", c, t, c, n)),
        (table(), column()).prop_map(|(t, c)| {
            format!("SELECT {c}, ROW_NUMBER() OVER (ORDER BY {c}) FROM {t}", c = c, t = t)
        }),
    ]
}

fn write_query() -> impl Strategy<Value = String> {
    prop_oneof![
        (table(), column(), any::<i32>())
            .prop_map(|(t, c, v)| format!("INSERT INTO {} ({}) VALUES ({})", t, c, v)),
        (table(), column(), any::<i32>())
            .prop_map(|(t, c, v)| format!("UPDATE {} SET {} = {} WHERE id = 1", t, c, v)),
        (table(), column()).prop_map(|(t, c)| format!("DELETE FROM {} WHERE {} IS NULL", t, c)),
    ]
}

fn whitespace_variant(sql: &str, upper: bool) -> String {
    let spaced = sql.split(' ').collect::<Vec<_>>().join("   ");
    if upper {
        spaced.to_uppercase()
    } else {
        spaced
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_classification_is_deterministic(sql in read_query()) {
        let fresh = classifier();
        let first = fresh.classify(&sql, None);
        let cached = fresh.classify(&sql, None);
        let other = classifier().classify(&sql, None);
        prop_assert_eq!(&first, &cached);
        prop_assert_eq!(&first, &other);
        prop_assert!(first.confidence > 0.0 && first.confidence <= 1.0);
    }

    #[test]
    fn test_formatting_does_not_change_the_shape(sql in read_query(), upper in any::<bool>()) {
        let c = classifier();
        let plain = c.classify(&sql, None);
        let variant = c.classify(&whitespace_variant(&sql, upper), None);
        prop_assert_eq!(plain.category, variant.category);
        prop_assert_eq!(plain.target, variant.target);
        prop_assert_eq!(plain.estimated_rows, variant.estimated_rows);
    }

    #[test]
    fn test_writes_always_go_to_oltp(sql in write_query(), hint in prop::option::of(prop::sample::select(vec!["olap", "analytical", "reporting", "garbage"]))) {
        let m = classifier().classify(&sql, hint);
        prop_assert!(m.is_write());
        prop_assert_eq!(m.target, TargetStore::Oltp);
    }

    #[test]
    fn test_arbitrary_text_never_panics(text in ".{0,200}") {
        let m = classifier().classify(&text, None);
        prop_assert!(m.confidence >= 0.0 && m.confidence <= 1.0);
    }
}
