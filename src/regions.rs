//! Fixed regional weight table and national-to-regional apportionment.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::{Deserialize, Deserializer};

/// Weights used to derive regional estimates from the national score.
/// They are not normalized and do not sum to 1.
const FRENCH_REGION_WEIGHTS: [(&str, f64); 7] = [
    ("Île-de-France", 0.30),
    ("Provence-Alpes-Côte d'Azur", 0.20),
    ("Occitanie", 0.15),
    ("Auvergne-Rhône-Alpes", 0.12),
    ("Nouvelle-Aquitaine", 0.08),
    ("Bretagne", 0.08),
    ("Hauts-de-France", 0.07),
];

/// Ordered, read-only region weight table.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionWeights {
    entries: Vec<(String, f64)>,
}

impl RegionWeights {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(region, weight)| (region.into(), weight))
                .collect(),
        }
    }

    /// The static table for metropolitan French regions.
    pub fn french_regions() -> Self {
        Self::new(FRENCH_REGION_WEIGHTS)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries
            .iter()
            .map(|(region, weight)| (region.as_str(), *weight))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-region popularity estimates, in weight-table order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionalPopularity {
    entries: Vec<(String, f64)>,
}

impl RegionalPopularity {
    pub fn get(&self, region: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == region)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries
            .iter()
            .map(|(region, value)| (region.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Serialize for RegionalPopularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (region, value) in &self.entries {
            map.serialize_entry(region, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RegionalPopularity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let entries = map
            .into_iter()
            .map(|(region, value)| {
                value
                    .as_f64()
                    .map(|number| (region.clone(), number))
                    .ok_or_else(|| {
                        serde::de::Error::custom(format!("non-numeric popularity for {region}"))
                    })
            })
            .collect::<Result<Vec<_>, D::Error>>()?;
        Ok(Self { entries })
    }
}

/// Rounds to two decimals; `f64::round` rounds half away from zero.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Splits a national score across regions.
///
/// `None` stays `None`: a failed lookup never turns into zeros.
pub fn apportion(national: Option<f64>, weights: &RegionWeights) -> Option<RegionalPopularity> {
    let national = national?;
    Some(RegionalPopularity {
        entries: weights
            .iter()
            .map(|(region, weight)| (region.to_string(), round2(national * weight)))
            .collect(),
    })
}
