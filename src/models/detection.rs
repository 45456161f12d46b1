use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const BBOX_FIELD: &str = "bbox_coord";

/// Detections for one category, kept exactly as the engine reported them
/// (field order included). Only `bbox_coord` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Detection {
    fields: Map<String, Value>,
}

impl Detection {
    /// Bounding boxes, empty when the engine sent none.
    pub fn bbox_coord(&self) -> &[Value] {
        match self.fields.get(BBOX_FIELD) {
            Some(Value::Array(boxes)) => boxes,
            _ => &[],
        }
    }

    /// True when `bbox_coord` holds at least one entry.
    pub fn has_boxes(&self) -> bool {
        !self.bbox_coord().is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl TryFrom<Value> for Detection {
    type Error = serde_json::Error;

    /// Accepts any object whose `bbox_coord`, if present, is a list of numeric lists.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(serde_json::Error::custom("detection must be a JSON object"));
        };

        if let Some(boxes) = fields.get(BBOX_FIELD) {
            let well_formed = boxes.as_array().is_some_and(|boxes| {
                boxes.iter().all(|bbox| {
                    bbox.as_array()
                        .is_some_and(|coords| coords.iter().all(Value::is_number))
                })
            });
            if !well_formed {
                return Err(serde_json::Error::custom(
                    "bbox_coord must be a list of numeric lists",
                ));
            }
        }
        Ok(Self { fields })
    }
}

/// Classification output keyed by category label, in the order the engine
/// produced it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Classification {
    categories: Vec<(String, Detection)>,
}

impl Classification {
    /// Drop categories whose `bbox_coord` is empty or missing.
    pub fn retain_detected(mut self) -> Self {
        self.categories.retain(|(_, detection)| detection.has_boxes());
        self
    }

    /// The first category in engine order.
    ///
    /// The stored result is this entry alone, not a named category.
    /// Downstream consumers rely on that shape.
    pub fn primary(&self) -> Option<(&str, &Detection)> {
        self.categories
            .first()
            .map(|(label, detection)| (label.as_str(), detection))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(label, _)| label.as_str())
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Bytes stored as the result artifact: the primary detection, or `{}`
    /// when nothing was detected.
    pub fn primary_result_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self.primary() {
            Some((_, detection)) => serde_json::to_vec(detection),
            None => serde_json::to_vec(&Map::new()),
        }
    }
}

impl TryFrom<Map<String, Value>> for Classification {
    type Error = serde_json::Error;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let categories = map
            .into_iter()
            .map(|(label, value)| Ok((label, Detection::try_from(value)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        Ok(Self { categories })
    }
}
