//! Integration tests for promotion sites

mod common;
use common::*;
use metajit::jit::SiteKey;
use metajit::prelude::*;
use pretty_assertions::assert_eq;

#[test]
fn test_tenth_observation_compiles() {
    let program = promotion_loop(1000, 5);
    let mut dispatcher = Dispatcher::new(program, JitConfig::default()).unwrap();
    let mut effects = Effects::new();

    for call in 1..=10u64 {
        let exit = dispatcher
            .arrive_at_promotion(PROMOTION_SITE, 4, at_promotion_site(1000, 5, 0, 7), &mut effects)
            .unwrap();
        assert_eq!(exit.kind, ExitKind::MergePoint);
        assert_eq!(exit.location, PROMOTION_HEAD);
        assert_eq!(exit.bindings.get(0), &Value::Int(1));

        let stats = dispatcher.stats();
        if call < 10 {
            assert_eq!(stats.fallback_segments, call);
            assert_eq!(stats.units_compiled, 0);
        } else {
            assert_eq!(stats.fallback_segments, 9);
            assert_eq!(stats.units_compiled, 1);
            assert_eq!(stats.compiled_runs, 1);
        }
    }
    let cache = dispatcher.cache().clone();
    assert!(cache.lookup_promotion(PROMOTION_SITE, &Value::Int(7), 0).is_some());
    assert_eq!(effects.output(), vec![Value::Int(49); 10].as_slice());

    // another value counts from scratch
    dispatcher
        .arrive_at_promotion(PROMOTION_SITE, 4, at_promotion_site(1000, 5, 0, 3), &mut effects)
        .unwrap();
    assert_eq!(dispatcher.stats().fallback_segments, 10);
    assert!(cache.lookup_promotion(PROMOTION_SITE, &Value::Int(3), 0).is_none());
    let three = SiteKey::Promotion {
        site: PROMOTION_SITE,
        value: Value::Int(3),
    };
    assert_eq!(dispatcher.counters().count(&three), 1);

    // and the cached unit is reused
    dispatcher
        .arrive_at_promotion(PROMOTION_SITE, 4, at_promotion_site(1000, 5, 0, 7), &mut effects)
        .unwrap();
    assert_eq!(dispatcher.stats().units_compiled, 1);
    assert_eq!(dispatcher.stats().compiled_runs, 2);
}

#[test]
fn test_few_values_stay_specialized() {
    let dispatcher = assert_equivalent(&promotion_loop(200, 3), JitConfig::default(), &[]);
    let cache = dispatcher.cache();
    assert!(!cache.is_generic(PROMOTION_SITE));
    assert_eq!(cache.promotion_entries(PROMOTION_SITE), 3);
    for x in 0..3 {
        assert!(cache.lookup_promotion(PROMOTION_SITE, &Value::Int(x), 0).is_some());
    }
}

#[test]
fn test_megamorphic_site_turns_generic() {
    let config = JitConfig::default().with_megamorphic_threshold(4);
    let dispatcher = assert_equivalent(&promotion_loop(300, 6), config, &[]);
    let cache = dispatcher.cache();

    // the fifth distinct value flips the site while the loop is still
    // interpreted, so the loop unit keeps x variable
    assert!(cache.is_generic(PROMOTION_SITE));
    assert_eq!(cache.promotion_entries(PROMOTION_SITE), 0);
    assert_eq!(dispatcher.stats().units_compiled, 1);
    assert_eq!(dispatcher.stats().promotion_exits, 0);
}

#[test]
fn test_cache_stops_growing_past_threshold() {
    let config = JitConfig::default().with_megamorphic_threshold(2);
    let mut dispatcher = Dispatcher::new(promotion_loop(1000, 5), config).unwrap();
    let mut effects = Effects::new();
    let mut arrive = |dispatcher: &mut Dispatcher, x: i64| {
        dispatcher
            .arrive_at_promotion(PROMOTION_SITE, 4, at_promotion_site(1000, 5, 0, x), &mut effects)
            .unwrap()
    };

    for x in 0..2 {
        for _ in 0..10 {
            arrive(&mut dispatcher, x);
        }
    }
    assert_eq!(dispatcher.cache().promotion_entries(PROMOTION_SITE), 2);
    assert_eq!(dispatcher.stats().units_compiled, 2);

    arrive(&mut dispatcher, 2);
    let cache = dispatcher.cache().clone();
    assert!(cache.is_generic(PROMOTION_SITE));
    assert_eq!(cache.promotion_entries(PROMOTION_SITE), 0);

    for _ in 0..9 {
        arrive(&mut dispatcher, 2);
    }
    assert!(cache.generic_unit(PROMOTION_SITE).is_some());
    assert_eq!(dispatcher.stats().units_compiled, 3);

    // every further value runs the generic unit
    let exit = arrive(&mut dispatcher, 4);
    assert_eq!(exit.kind, ExitKind::MergePoint);
    assert_eq!(dispatcher.stats().units_compiled, 3);
    assert_eq!(cache.promotion_entries(PROMOTION_SITE), 0);
}

#[test]
fn test_cold_distinct_values_stay_bounded() {
    let dispatcher = assert_equivalent(&promotion_loop(2000, 2000), JitConfig::default(), &[]);
    assert!(dispatcher.cache().is_generic(PROMOTION_SITE));
    assert_eq!(dispatcher.cache().promotion_entries(PROMOTION_SITE), 0);

    // merge point, four values, the generic site and the loop branch
    assert!(dispatcher.counters().len() <= 8);
    let generic = SiteKey::GenericPromotion(PROMOTION_SITE);
    assert!(dispatcher.counters().count(&generic) >= 1);
}

#[test]
fn test_units_are_kept_per_provenance() {
    let mut dispatcher = Dispatcher::new(promotion_loop(1000, 5), JitConfig::default()).unwrap();
    let mut effects = Effects::new();
    let bindings = |tainted: bool| {
        let mut bindings = at_promotion_site(1000, 5, 0, 7);
        bindings.set(1, Value::Int(1000), tainted);
        bindings
    };

    for _ in 0..10 {
        dispatcher
            .arrive_at_promotion(PROMOTION_SITE, 4, bindings(false), &mut effects)
            .unwrap();
    }
    assert_eq!(dispatcher.stats().units_compiled, 1);

    for round in 0..6 {
        dispatcher
            .arrive_at_promotion(PROMOTION_SITE, 4, bindings(round % 2 == 0), &mut effects)
            .unwrap();
    }
    assert_eq!(dispatcher.stats().units_compiled, 2);
    assert_eq!(dispatcher.cache().promotion_entries(PROMOTION_SITE), 2);
    assert_eq!(effects.output(), vec![Value::Int(49); 16].as_slice());
}

#[test]
fn test_input_values_are_never_promoted() {
    let mut input = vec![30];
    input.extend(std::iter::repeat(1).take(30));
    let dispatcher = assert_equivalent(&input_promotion_loop(), JitConfig::default(), &input);
    assert_eq!(dispatcher.stats().promotion_exits, 0);
    assert_eq!(dispatcher.stats().units_compiled, 1);
    assert_eq!(dispatcher.cache().promotion_entries(Location::new(0, 7)), 0);
}

#[test]
fn test_effectful_call_results_are_never_promoted() {
    let dispatcher = assert_equivalent(&calling_loop(40), JitConfig::default(), &[]);
    assert_eq!(dispatcher.stats().promotion_exits, 0);
    assert_eq!(dispatcher.cache().merge_point_units(), 1);
}
