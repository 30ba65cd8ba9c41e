//! Integration tests for types

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use strata_types::*;

    #[test]
    fn test_resource_index_matches_all_order() {
        for (i, resource) in Resource::ALL.into_iter().enumerate() {
            assert_eq!(resource.index(), i);
        }
    }

    #[test]
    fn test_resource_serialization() {
        let json = serde_json::to_string(&Resource::ChunkCache).unwrap();
        assert_eq!(json, r#""chunk_cache""#);
        let parsed: Resource = serde_json::from_str(r#""file_system""#).unwrap();
        assert_eq!(parsed, Resource::FileSystem);
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new(Resource::Index, PriorityClass::continuation(Priority::High));
        assert_eq!(key.to_string(), "index/high+cont");
    }

    #[test]
    fn test_priority_class_defaults_to_new_work() {
        let class: PriorityClass = serde_json::from_str(r#"{"priority":"medium"}"#).unwrap();
        assert_eq!(class, PriorityClass::from(Priority::Medium));
        assert!(!class.continuation);
    }

    #[test]
    fn test_unknown_resource_is_config_error() {
        let err = "tape".parse::<Resource>().unwrap_err();
        assert!(matches!(
            err,
            strata_errors::ConfigError::InvalidValue { .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_band_is_monotonic(a in 0usize..4, b in 0usize..4) {
            let (pa, pb) = (Priority::ALL[a], Priority::ALL[b]);
            if pa <= pb {
                prop_assert!(pa.band() <= pb.band());
            }
        }

        #[test]
        fn prop_resource_name_round_trip(i in 0usize..Resource::COUNT) {
            let resource = Resource::ALL[i];
            prop_assert_eq!(resource.as_str().parse::<Resource>().unwrap(), resource);
        }
    }
}
