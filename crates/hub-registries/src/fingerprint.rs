//! Weighted fingerprint scoring
//!
//! Scores one declared [`Fingerprint`] against the attributes a joining
//! device announced. The special-case scores and the acceptance threshold
//! are a fixed compatibility contract:
//!
//! | condition                                                   | score |
//! |-------------------------------------------------------------|-------|
//! | exactly `{mfr, model, prod, intg}` present, all matched     | 100   |
//! | exactly `{mfr, model, prod}` present, all matched           | 99    |
//! | every present field matched, weight > 4                     | 98    |
//! | every present field matched, weight > 3                     | 97    |
//! | otherwise                                                   | `round(matched / present * 100) + weight` |

use std::collections::HashMap;

use hub_core::{canonical_clusters, Fingerprint};

/// A winning score must exceed this to be accepted
pub const ACCEPT_THRESHOLD: i64 = 90;

/// Resolver output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintMatch {
    pub definition_id: String,
    pub join_name: String,
    /// Winning score, `None` for the fallback driver
    pub score: Option<i64>,
}

/// Fingerprint with its cluster lists canonicalized once
#[derive(Debug, Clone)]
pub(crate) struct IndexedFingerprint {
    pub definition_id: String,
    pub definition_name: String,
    pub fingerprint: Fingerprint,
    pub sorted_in_clusters: Option<String>,
    pub sorted_out_clusters: Option<String>,
}

impl IndexedFingerprint {
    pub fn new(definition_id: &str, definition_name: &str, fingerprint: &Fingerprint) -> Self {
        Self {
            definition_id: definition_id.to_string(),
            definition_name: definition_name.to_string(),
            sorted_in_clusters: fingerprint.in_clusters.as_deref().map(canonical_clusters),
            sorted_out_clusters: fingerprint.out_clusters.as_deref().map(canonical_clusters),
            fingerprint: fingerprint.clone(),
        }
    }

    pub fn join_name(&self) -> String {
        self.fingerprint
            .device_join_name
            .clone()
            .unwrap_or_else(|| self.definition_name.clone())
    }
}

#[derive(Default)]
struct Tally {
    present: Vec<&'static str>,
    matched: Vec<&'static str>,
    weight: i64,
}

impl Tally {
    fn simple(&mut self, name: &'static str, declared: Option<&str>, announced: Option<&str>, weight: i64) {
        let Some(declared) = declared else {
            return;
        };
        self.present.push(name);
        if announced.is_some_and(|a| a.trim().eq_ignore_ascii_case(declared.trim())) {
            self.matched.push(name);
            self.weight += weight;
        }
    }

    fn clusters(
        &mut self,
        name: &'static str,
        declared: Option<&str>,
        declared_sorted: Option<&str>,
        announced: Option<&str>,
    ) {
        let Some(declared) = declared else {
            return;
        };
        self.present.push(name);
        let Some(announced) = announced else {
            return;
        };
        if announced.trim().eq_ignore_ascii_case(declared.trim()) {
            self.matched.push(name);
            self.weight += 2;
        } else if declared_sorted == Some(canonical_clusters(announced).as_str()) {
            self.matched.push(name);
            self.weight += 1;
        }
    }

    fn only(&self, names: &[&str]) -> bool {
        self.present.len() == names.len() && names.iter().all(|n| self.matched.contains(n))
    }
}

/// Score one fingerprint against announced device attributes
///
/// Returns `None` when the fingerprint has no comparable field.
pub(crate) fn score(indexed: &IndexedFingerprint, info: &HashMap<String, String>) -> Option<i64> {
    let fp = &indexed.fingerprint;
    let get = |key: &str| info.get(key).map(String::as_str);

    let mut tally = Tally::default();
    tally.simple("profileId", fp.profile_id.as_deref(), get("profileId"), 1);
    tally.simple("endpointId", fp.endpoint_id.as_deref(), get("endpointId"), 1);
    tally.clusters(
        "inClusters",
        fp.in_clusters.as_deref(),
        indexed.sorted_in_clusters.as_deref(),
        get("inClusters"),
    );
    tally.clusters(
        "outClusters",
        fp.out_clusters.as_deref(),
        indexed.sorted_out_clusters.as_deref(),
        get("outClusters"),
    );
    tally.simple("manufacturer", fp.manufacturer.as_deref(), get("manufacturer"), 2);
    tally.simple("model", fp.model.as_deref(), get("model"), 3);
    tally.simple("mfr", fp.mfr.as_deref(), get("mfr"), 3);
    tally.simple("prod", fp.prod.as_deref(), get("prod"), 3);
    tally.simple("intg", fp.intg.as_deref(), get("intg"), 3);

    if tally.present.is_empty() {
        return None;
    }

    let all_matched = tally.matched.len() == tally.present.len();
    let score = if tally.only(&["mfr", "model", "prod", "intg"]) {
        100
    } else if tally.only(&["mfr", "model", "prod"]) {
        99
    } else if all_matched && tally.weight > 4 {
        98
    } else if all_matched && tally.weight > 3 {
        97
    } else {
        let ratio = tally.matched.len() as f64 / tally.present.len() as f64;
        (ratio * 100.0).round() as i64 + tally.weight
    };
    Some(score)
}

/// Score a bare fingerprint (convenience for diagnostics and tests)
pub fn score_fingerprint(fingerprint: &Fingerprint, info: &HashMap<String, String>) -> Option<i64> {
    score(&IndexedFingerprint::new("", "", fingerprint), info)
}

/// Pick the strictly highest score; ties keep the first candidate
pub(crate) fn best_match<'a>(
    index: &'a [IndexedFingerprint],
    info: &HashMap<String, String>,
) -> Option<(&'a IndexedFingerprint, i64)> {
    let mut best: Option<(&IndexedFingerprint, i64)> = None;
    for candidate in index {
        let Some(s) = score(candidate, info) else {
            continue;
        };
        if best.map_or(true, |(_, top)| s > top) {
            best = Some((candidate, s));
        }
    }
    best.filter(|(_, s)| *s > ACCEPT_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fp(pairs: &[(&str, &str)]) -> Fingerprint {
        Fingerprint::from_map(pairs.iter().copied())
    }

    #[test]
    fn test_zwave_ids_score_100() {
        let declared = fp(&[("mfr", "0086"), ("model", "0064"), ("prod", "0003"), ("intg", "1")]);
        let announced = info(&[("mfr", "0086"), ("model", "0064"), ("prod", "0003"), ("intg", "1")]);
        assert_eq!(score_fingerprint(&declared, &announced), Some(100));
    }

    #[test]
    fn test_mfr_model_prod_scores_99() {
        let declared = fp(&[("mfr", "0086"), ("model", "0064"), ("prod", "0003")]);
        let announced = info(&[("mfr", "0086"), ("model", "0064"), ("prod", "0003")]);
        assert_eq!(score_fingerprint(&declared, &announced), Some(99));
    }

    #[test]
    fn test_full_zigbee_match_scores_98() {
        let declared = fp(&[
            ("profileId", "0104"),
            ("inClusters", "0000,0006"),
            ("manufacturer", "IKEA"),
            ("model", "TRADFRI"),
        ]);
        let announced = info(&[
            ("profileId", "0104"),
            ("inClusters", "0000,0006"),
            ("manufacturer", "IKEA"),
            ("model", "TRADFRI"),
        ]);
        assert_eq!(score_fingerprint(&declared, &announced), Some(98));
    }

    #[test]
    fn test_full_match_weight_four_scores_97() {
        // profileId (1) + model (3) = 4
        let declared = fp(&[("profileId", "0104"), ("model", "X")]);
        let announced = info(&[("profileId", "0104"), ("model", "X")]);
        assert_eq!(score_fingerprint(&declared, &announced), Some(97));
    }

    #[test]
    fn test_partial_match_uses_ratio_plus_weight() {
        // 1 of 2 matched: 50 + manufacturer weight 2
        let declared = fp(&[("manufacturer", "IKEA"), ("model", "TRADFRI")]);
        let announced = info(&[("manufacturer", "IKEA"), ("model", "OTHER")]);
        assert_eq!(score_fingerprint(&declared, &announced), Some(52));
    }

    #[test]
    fn test_sorted_clusters_are_lower_confidence() {
        let declared = fp(&[("inClusters", "0000,0006")]);
        let exact = info(&[("inClusters", "0000,0006")]);
        let reordered = info(&[("inClusters", "0006, 0000")]);
        // weight 2 / weight 1, all matched, no bonus tiers
        assert_eq!(score_fingerprint(&declared, &exact), Some(102));
        assert_eq!(score_fingerprint(&declared, &reordered), Some(101));
    }

    #[test]
    fn test_cluster_hex_case_is_ignored() {
        let declared = fp(&[("inClusters", "0000,0B04")]);
        let lower = info(&[("inClusters", "0000,0b04")]);
        let reordered = info(&[("inClusters", "0b04,0000")]);
        assert_eq!(score_fingerprint(&declared, &lower), Some(102));
        assert_eq!(score_fingerprint(&declared, &reordered), Some(101));
    }

    #[test]
    fn test_empty_fingerprint_is_not_comparable() {
        let declared = fp(&[("deviceJoinName", "Lamp"), ("application", "01")]);
        assert_eq!(score_fingerprint(&declared, &info(&[])), None);
    }

    #[test]
    fn test_best_match_threshold_and_ties() {
        let weak = IndexedFingerprint::new("weak", "Weak", &fp(&[("manufacturer", "IKEA"), ("model", "A")]));
        let first = IndexedFingerprint::new("first", "First", &fp(&[("mfr", "1"), ("model", "2"), ("prod", "3")]));
        let second = IndexedFingerprint::new("second", "Second", &fp(&[("mfr", "1"), ("model", "2"), ("prod", "3")]));

        let announced = info(&[("manufacturer", "IKEA"), ("model", "2"), ("mfr", "1"), ("prod", "3")]);

        let index = vec![weak.clone(), first, second];
        let (winner, score) = best_match(&index, &announced).unwrap();
        assert_eq!(winner.definition_id, "first");
        assert_eq!(score, 99);

        // Only the weak candidate: 50 + 2 is below the threshold
        assert!(best_match(&[weak], &announced).is_none());
    }

    #[test]
    fn test_score_of_exactly_threshold_is_rejected() {
        // 4 of 5 matched: 80 + model, mfr, prod (9) + profileId (1)
        let at = IndexedFingerprint::new(
            "at",
            "At",
            &fp(&[("profileId", "0104"), ("manufacturer", "Acme"), ("model", "2"), ("mfr", "1"), ("prod", "3")]),
        );
        // 4 of 5 matched: 80 + model, mfr, prod (9) + manufacturer (2)
        let above = IndexedFingerprint::new(
            "above",
            "Above",
            &fp(&[("profileId", "0109"), ("manufacturer", "IKEA"), ("model", "2"), ("mfr", "1"), ("prod", "3")]),
        );
        let announced = info(&[
            ("profileId", "0104"),
            ("manufacturer", "IKEA"),
            ("model", "2"),
            ("mfr", "1"),
            ("prod", "3"),
        ]);

        assert_eq!(score(&at, &announced), Some(ACCEPT_THRESHOLD));
        assert!(best_match(&[at.clone()], &announced).is_none());

        let candidates = [at, above];
        let (winner, score) = best_match(&candidates, &announced).unwrap();
        assert_eq!(winner.definition_id, "above");
        assert_eq!(score, ACCEPT_THRESHOLD + 1);
    }
}
