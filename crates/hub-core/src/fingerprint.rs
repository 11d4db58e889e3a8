//! Device fingerprints used to classify joining devices

use serde::{Deserialize, Serialize};

/// A partial attribute pattern declared by a driver
///
/// Every field is optional; only present fields take part in matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_clusters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_clusters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_join_name: Option<String>,
}

impl Fingerprint {
    /// Build a fingerprint from a flat attribute map (as announced or declared)
    pub fn from_map<'a, I>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut fp = Fingerprint::default();
        for (key, value) in attrs {
            let value = Some(value.to_string());
            match key {
                "profileId" => fp.profile_id = value,
                "endpointId" => fp.endpoint_id = value,
                "inClusters" => fp.in_clusters = value,
                "outClusters" => fp.out_clusters = value,
                "manufacturer" => fp.manufacturer = value,
                "model" => fp.model = value,
                "application" => fp.application = value,
                "mfr" => fp.mfr = value,
                "prod" => fp.prod = value,
                "intg" => fp.intg = value,
                "deviceJoinName" => fp.device_join_name = value,
                _ => {}
            }
        }
        fp
    }
}

/// Canonical form of a cluster list: trimmed, upper-cased, sorted, comma-joined
///
/// `"0006, 0000,0B04"` and `"0000,0006,0b04"` share the canonical form
/// `"0000,0006,0B04"`.
pub fn canonical_clusters(clusters: &str) -> String {
    let mut parts: Vec<String> = clusters
        .split(',')
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .collect();
    parts.sort();
    parts.join(",")
}
