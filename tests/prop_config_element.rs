// Property: a ConfigElement built from any values reports exactly those
// values back, and its type code is always one of 0-3.

use fragment_cache::{ConfigElement, ElementType};
use proptest::prelude::*;

fn element_type() -> impl Strategy<Value = ElementType> {
    prop_oneof![
        Just(ElementType::RequestParameter),
        Just(ElementType::RequestAttribute),
        Just(ElementType::SessionParameter),
        Just(ElementType::Cookie),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_accessors_return_constructed_values(
        ty in element_type(),
        id in "[a-zA-Z_][a-zA-Z0-9_]{0,15}",
        method in proptest::option::of("[a-z]{1,10}"),
        data_id in proptest::option::of("[a-z]{1,10}"),
        invalidate in proptest::option::of("[a-z]{1,10}"),
        exclude in prop::collection::btree_set("[a-z0-9]{1,6}", 0..5),
        required in any::<bool>(),
        exclude_all in any::<bool>(),
        ignore_value in any::<bool>(),
    ) {
        let mut element = ConfigElement::new(ty, id.clone())
            .with_exclude(exclude.iter().cloned())
            .required(required)
            .exclude_all(exclude_all)
            .ignore_value(ignore_value);
        if let Some(m) = &method {
            element = element.with_method(m.clone());
        }
        if let Some(d) = &data_id {
            element = element.with_data_id(d.clone());
        }
        if let Some(i) = &invalidate {
            element = element.with_invalidate(i.clone());
        }

        prop_assert_eq!(element.element_type(), ty);
        prop_assert!(element.element_type().code() <= 3);
        prop_assert_eq!(element.id(), id.as_str());
        prop_assert_eq!(element.method(), method.as_deref());
        prop_assert_eq!(element.data_id(), data_id.as_deref());
        prop_assert_eq!(element.invalidate(), invalidate.as_deref());
        prop_assert_eq!(element.exclude(), &exclude);
        prop_assert_eq!(element.is_required(), required);
        prop_assert_eq!(element.is_exclude_all(), exclude_all);
        prop_assert_eq!(element.is_ignore_value(), ignore_value);
        for value in &exclude {
            prop_assert!(element.excludes(value));
        }
    }

    #[test]
    fn prop_type_codes_map_back(code in 0u8..=3) {
        let ty = ElementType::from_code(code).unwrap();
        prop_assert_eq!(ty.code(), code);
    }

    #[test]
    fn prop_codes_above_three_are_rejected(code in 4u8..) {
        prop_assert!(ElementType::from_code(code).is_none());

        let yaml = format!("type: {}\nid: x\n", code);
        prop_assert!(serde_yaml::from_str::<ConfigElement>(&yaml).is_err());
    }

    #[test]
    fn prop_yaml_type_code_round_trip(ty in element_type(), id in "[a-z]{1,10}") {
        let yaml = format!("type: {}\nid: \"{}\"\n", ty.code(), id);
        let element: ConfigElement = serde_yaml::from_str(&yaml).unwrap();
        prop_assert_eq!(element.element_type(), ty);
        prop_assert_eq!(element.id(), id.as_str());
        prop_assert!(!element.is_required());
    }
}
