//! Deterministic bucketing: hashing users into `[0, 1)` and mapping buckets to variations.
//!
//! The hashing functions must produce identical results to every other implementation of the same
//! algorithm, so users land in the same variation regardless of the platform evaluating the flag.
use crate::{
    attributes::hash_value,
    models::{BucketRange, Filter, Namespace},
    Attributes,
};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the characters of `input`.
fn fnv1a32(input: &str) -> u32 {
    input.chars().fold(FNV_OFFSET_BASIS, |hash, c| {
        (hash ^ u32::from(c)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash `value` with `seed` into `[0, 1)`.
///
/// Returns `None` for unsupported hash versions.
pub fn hash(seed: &str, value: &str, version: u32) -> Option<f64> {
    match version {
        1 => {
            let n = fnv1a32(&format!("{value}{seed}"));
            Some(f64::from(n % 1000) / 1000.0)
        }
        2 => {
            let n = fnv1a32(&fnv1a32(&format!("{seed}{value}")).to_string());
            Some(f64::from(n % 10_000) / 10_000.0)
        }
        _ => None,
    }
}

/// Return `n` equal weights summing to 1.
pub(crate) fn equal_weights(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

/// Build cumulative bucket ranges for `num_variations` variations.
///
/// Each variation receives `[cumulative, cumulative + coverage * weight)`. Coverage is clamped to
/// `[0, 1]`. Weights that don't match the number of variations or don't sum to 1 are replaced with
/// an even split.
pub fn bucket_ranges(
    num_variations: usize,
    coverage: f64,
    weights: Option<&[f64]>,
) -> Vec<BucketRange> {
    let coverage = coverage.clamp(0.0, 1.0);

    let weights = match weights {
        Some(weights) if weights.len() == num_variations => {
            let total: f64 = weights.iter().sum();
            if (0.99..=1.01).contains(&total) {
                weights.to_vec()
            } else {
                log::warn!(target: "splitkit",
                           total;
                           "experiment weights must sum to 1, using even split");
                equal_weights(num_variations)
            }
        }
        Some(weights) => {
            log::warn!(target: "splitkit",
                       weights = weights.len(),
                       variations = num_variations;
                       "weights don't match variations, using even split");
            equal_weights(num_variations)
        }
        None => equal_weights(num_variations),
    };

    let mut cumulative = 0.0;
    weights
        .into_iter()
        .map(|weight| {
            let start = cumulative;
            cumulative += weight;
            BucketRange(start, start + coverage * weight)
        })
        .collect()
}

/// Return the index of the range containing `n`, or `None` if `n` falls outside all ranges.
pub fn choose_variation(n: f64, ranges: &[BucketRange]) -> Option<usize> {
    ranges.iter().position(|range| range.contains(n))
}

/// Return `true` if `hash_value` falls into the namespace range.
pub fn in_namespace(hash_value: &str, namespace: &Namespace) -> bool {
    let Namespace(name, start, end) = namespace;
    match hash(&format!("__{name}"), hash_value, 1) {
        Some(n) => *start <= n && n < *end,
        None => false,
    }
}

/// Return `true` if any of `filters` excludes the user.
pub(crate) fn is_filtered_out(filters: &[Filter], attributes: &Attributes) -> bool {
    filters.iter().any(|filter| {
        let attribute = filter.attribute.as_deref().unwrap_or("id");
        let Some(value) = hash_value(attributes, attribute) else {
            return true;
        };
        let Some(n) = hash(&filter.seed, &value, filter.hash_version.unwrap_or(2)) else {
            return true;
        };
        !filter.ranges.iter().any(|range| range.contains(n))
    })
}

/// Return `true` if the user falls into the rollout of a force rule.
///
/// A rule without `range` and `coverage` includes everyone. Otherwise the user is hashed with
/// `seed` and must land in `range` (or below `coverage` when no range is given). Users without a
/// hash value are excluded.
pub(crate) fn is_included_in_rollout(
    hash_value: Option<&str>,
    seed: &str,
    range: Option<BucketRange>,
    coverage: Option<f64>,
    hash_version: u32,
) -> bool {
    if range.is_none() && coverage.is_none() {
        return true;
    }
    if range.is_none() && coverage == Some(0.0) {
        return false;
    }

    let Some(value) = hash_value else {
        return false;
    };
    let Some(n) = hash(seed, value, hash_version) else {
        return false;
    };

    match (range, coverage) {
        (Some(range), _) => range.contains(n),
        (None, Some(coverage)) => n <= coverage,
        (None, None) => true,
    }
}
