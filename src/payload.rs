//! Bounding what gets sent over the wire: payload reduction before diffing
//! and compressed encoding of component batches.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::render::Component;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLimits {
    /// Arrays longer than this are down-sampled. Zero disables sampling.
    pub max_points: usize,
    /// Floats are rounded to this many decimal places.
    pub float_precision: Option<u32>,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            float_precision: Some(6),
        }
    }
}

impl PayloadLimits {
    pub fn unlimited() -> Self {
        Self {
            max_points: 0,
            float_precision: None,
        }
    }
}

/// Applies the limits recursively.
pub fn reduce(value: &Value, limits: &PayloadLimits) -> Value {
    match value {
        Value::Array(items) => {
            let sampled = sample(items, limits.max_points);
            Value::Array(sampled.into_iter().map(|item| reduce(item, limits)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), reduce(item, limits)))
                .collect(),
        ),
        Value::Number(n) if n.is_f64() => match (n.as_f64(), limits.float_precision) {
            (Some(f), Some(precision)) => Value::from(round_to(f, precision)),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Evenly spaced sample keeping the first and last element.
fn sample(items: &[Value], max_points: usize) -> Vec<&Value> {
    if max_points == 0 || items.len() <= max_points {
        return items.iter().collect();
    }
    if max_points == 1 {
        return items.first().into_iter().collect();
    }
    let last = items.len() - 1;
    (0..max_points)
        .map(|i| &items[i * last / (max_points - 1)])
        .collect()
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() { rounded } else { value }
}

/// A batch of components ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum ComponentBatch {
    Plain { components: Vec<Component> },
    /// Deflate-compressed JSON array, base64 encoded.
    Deflate { data: String, count: usize },
}

impl ComponentBatch {
    pub fn encode(components: Vec<Component>, compression_threshold: usize) -> Result<Self> {
        let json = serde_json::to_vec(&components)
            .map_err(|e| FlowError::Serialization(e.to_string()))?;
        if json.len() <= compression_threshold {
            return Ok(ComponentBatch::Plain { components });
        }

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        tracing::debug!(
            "Compressed component batch from {} to {} bytes",
            json.len(),
            compressed.len()
        );
        Ok(ComponentBatch::Deflate {
            data: STANDARD.encode(compressed),
            count: components.len(),
        })
    }

    pub fn decode(self) -> Result<Vec<Component>> {
        match self {
            ComponentBatch::Plain { components } => Ok(components),
            ComponentBatch::Deflate { data, .. } => {
                let compressed = STANDARD
                    .decode(data)
                    .map_err(|e| FlowError::Serialization(e.to_string()))?;
                let mut json = Vec::new();
                DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
                serde_json::from_slice(&json).map_err(|e| FlowError::Serialization(e.to_string()))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ComponentBatch::Plain { components } => components.len(),
            ComponentBatch::Deflate { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, ComponentBatch::Deflate { .. })
    }
}
