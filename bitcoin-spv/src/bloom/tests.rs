//! Behavioural tests for bloom filter construction

use bitcoin::p2p::message_bloom::BloomFlags;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::bloom::{BloomFilter, BloomFilterBuilder, BloomFilterParameters, MAX_FILTER_SIZE};

fn random_elements(rng: &mut StdRng, count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|_| rng.r#gen::<[u8; 20]>().to_vec()).collect()
}

#[test]
fn test_builder_default_is_empty() {
    let filter = BloomFilterBuilder::new().build().unwrap();
    assert!(filter.is_empty());
    assert_eq!(filter.elements(), 0);
    assert!(!filter.contains(b"nothing inserted"));
}

#[test]
fn test_builder_rejects_bad_rate() {
    assert!(BloomFilterBuilder::new().false_positive_rate(0.0).build().is_err());
    assert!(BloomFilterBuilder::new().false_positive_rate(1.5).build().is_err());
}

#[test]
fn test_builder_uses_parameters() {
    let parameters = BloomFilterParameters::new(0.01, 42, BloomFlags::PubkeyOnly).unwrap();
    let filter = BloomFilterBuilder::with_parameters(parameters).add_data(vec![1, 2, 3]).build().unwrap();

    assert_eq!(filter.tweak(), 42);
    assert_eq!(filter.flags(), BloomFlags::PubkeyOnly);
    let load = filter.to_filter_load();
    assert_eq!(load.tweak, 42);
    assert_eq!(load.hash_funcs, filter.hash_funcs());
    assert_eq!(load.filter, filter.data());
}

#[test]
fn test_same_inputs_same_filter() {
    let build = || {
        BloomFilterBuilder::new().tweak(99).false_positive_rate(0.001).add_data(vec![7; 32]).add_data(vec![8; 20]).build()
    };
    assert_eq!(build().unwrap(), build().unwrap());
}

#[test]
fn test_tweak_changes_bits() {
    let a = BloomFilterBuilder::new().tweak(1).add_data(vec![7; 32]).build().unwrap();
    let b = BloomFilterBuilder::new().tweak(2).add_data(vec![7; 32]).build().unwrap();
    assert_ne!(a.data(), b.data());
}

#[test]
fn test_no_false_negatives() {
    let mut rng = StdRng::seed_from_u64(1);
    let elements = random_elements(&mut rng, 1000);
    let filter = BloomFilterBuilder::new()
        .tweak(rng.r#gen())
        .false_positive_rate(0.001)
        .add_all(elements.clone())
        .build()
        .unwrap();

    assert_eq!(filter.elements(), 1000);
    for element in &elements {
        assert!(filter.contains(element));
    }
}

#[test]
fn test_false_positive_rate_matches_configuration() {
    let mut rng = StdRng::seed_from_u64(2);
    let rate = 0.01;
    let inserted = random_elements(&mut rng, 2000);
    let filter =
        BloomFilterBuilder::new().tweak(rng.r#gen()).false_positive_rate(rate).add_all(inserted).build().unwrap();

    let trials = 50_000;
    let hits = random_elements(&mut rng, trials).iter().filter(|element| filter.contains(element)).count();
    let observed = hits as f64 / trials as f64;

    // Expected ~500 hits; the standard deviation is ~22.
    assert!(observed < rate * 1.5, "observed false positive rate {}", observed);
    assert!(observed > rate * 0.5, "observed false positive rate {}", observed);

    let estimated = filter.estimated_false_positive_rate();
    assert!((estimated - rate).abs() < rate * 0.25, "estimated {}", estimated);
}

#[test]
fn test_oversized_filter_is_capped() {
    let mut rng = StdRng::seed_from_u64(3);
    let filter = BloomFilterBuilder::new()
        .false_positive_rate(0.0001)
        .elements(1_000_000)
        .add_all(random_elements(&mut rng, 10))
        .build()
        .unwrap();
    assert_eq!(filter.size(), MAX_FILTER_SIZE);
    assert_eq!(filter.hash_funcs(), 1);
    assert!(filter.estimated_false_positive_rate() < 1e-4);
}

#[test]
fn test_saturated_filter_estimates_one() {
    let full = BloomFilter::full_match();
    assert_eq!(full.estimated_false_positive_rate(), 1.0);
    assert!(full.contains(&[0u8; 36]));
}
