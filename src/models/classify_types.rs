use serde::{Deserialize, Serialize};
use std::fmt;

/// Waste categories the service can report, in the order they are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WasteType {
    Plastic,
    Paper,
    Organic,
    Glass,
    Metal,
    Hazardous,
    NonRecyclable,
}

impl WasteType {
    pub const ALL: [WasteType; 7] = [
        WasteType::Plastic,
        WasteType::Paper,
        WasteType::Organic,
        WasteType::Glass,
        WasteType::Metal,
        WasteType::Hazardous,
        WasteType::NonRecyclable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WasteType::Plastic => "plastic",
            WasteType::Paper => "paper",
            WasteType::Organic => "organic",
            WasteType::Glass => "glass",
            WasteType::Metal => "metal",
            WasteType::Hazardous => "hazardous",
            WasteType::NonRecyclable => "non-recyclable",
        }
    }

    /// Label strings in scoring order, as fed to the text encoder.
    pub fn labels() -> [&'static str; 7] {
        Self::ALL.map(|w| w.as_str())
    }
}

impl fmt::Display for WasteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClassifyResponse {
    pub waste_type: WasteType,
    pub confidence: f32,
}

#[derive(Debug, Serialize, Clone)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
}

/// Outcome of scoring one image against a label set.
#[derive(Debug, Clone)]
pub struct Classification {
    pub index: usize,
    pub confidence: f32,
    pub distribution: Vec<Prediction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_order_is_fixed() {
        assert_eq!(
            WasteType::labels(),
            ["plastic", "paper", "organic", "glass", "metal", "hazardous", "non-recyclable"]
        );
    }

    #[test]
    fn serializes_as_label_string() {
        let response = ClassifyResponse {
            waste_type: WasteType::NonRecyclable,
            confidence: 0.5,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["waste_type"], "non-recyclable");
        assert_eq!(value["confidence"], 0.5);

        for waste in WasteType::ALL {
            assert_eq!(serde_json::to_value(waste).unwrap(), waste.as_str());
        }
    }
}
