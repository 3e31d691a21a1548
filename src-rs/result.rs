use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::PipelineError;

pub const UNKNOWN_PRODUCT: &str = "未知產品";
pub const NO_SUMMARY: &str = "暫無摘要";
pub const NO_REASON: &str = "資料不足，請自行判斷";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuitabilityStatus {
    Safe,
    Moderate,
    Avoid,
}

impl SuitabilityStatus {
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Some(Self::Safe),
            "MODERATE" => Some(Self::Moderate),
            "AVOID" => Some(Self::Avoid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Moderate => "MODERATE",
            Self::Avoid => "AVOID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngredientCategory {
    Healthy,
    Neutral,
    Caution,
    Unhealthy,
}

impl IngredientCategory {
    pub const ALL: [Self; 4] = [Self::Healthy, Self::Neutral, Self::Caution, Self::Unhealthy];

    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HEALTHY" => Some(Self::Healthy),
            "NEUTRAL" => Some(Self::Neutral),
            "CAUTION" => Some(Self::Caution),
            "UNHEALTHY" => Some(Self::Unhealthy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Neutral => "NEUTRAL",
            Self::Caution => "CAUTION",
            Self::Unhealthy => "UNHEALTHY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSuitability {
    pub status: SuitabilityStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    pub description: String,
    pub category: IngredientCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub product_name: String,
    pub summary: String,
    pub child_suitability: ChildSuitability,
    pub ingredients: Vec<Ingredient>,
    pub warnings: Vec<String>,
    pub pros: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_score: Option<u8>,
}

impl AnalysisResult {
    pub fn ingredients_in(&self, category: IngredientCategory) -> impl Iterator<Item = &Ingredient> {
        self.ingredients
            .iter()
            .filter(move |ingredient| ingredient.category == category)
    }
}

/// Parse backend text into a fully populated [`AnalysisResult`].
pub fn normalize_response(raw: &str) -> Result<AnalysisResult, PipelineError> {
    let text = strip_code_fence(raw.trim());
    if text.is_empty() {
        return Err(PipelineError::EmptyResponse);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|err| PipelineError::MalformedResponse(err.to_string()))?;
    let empty = Map::new();
    let root = match value.as_object() {
        Some(root) => root,
        None => {
            debug!(kind = json_kind(&value), "response root is not an object, using defaults");
            &empty
        }
    };

    let suitability = root.get("childSuitability").and_then(Value::as_object);
    let child_suitability = ChildSuitability {
        status: suitability
            .and_then(|obj| obj.get("status"))
            .and_then(Value::as_str)
            .and_then(SuitabilityStatus::parse_lenient)
            .unwrap_or(SuitabilityStatus::Moderate),
        reason: value_to_string(suitability.and_then(|obj| obj.get("reason")))
            .unwrap_or_else(|| NO_REASON.to_string()),
    };

    Ok(AnalysisResult {
        product_name: value_to_string(root.get("productName"))
            .unwrap_or_else(|| UNKNOWN_PRODUCT.to_string()),
        summary: value_to_string(root.get("summary")).unwrap_or_else(|| NO_SUMMARY.to_string()),
        child_suitability,
        ingredients: ingredient_list(root.get("ingredients")),
        warnings: dedup_keep_first(string_list(root.get("warnings"))),
        pros: string_list(root.get("pros")),
        health_score: health_score(root.get("healthScore")),
    })
}

/// Unwraps a Markdown code fence (```json ... ```) if the model added one.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.trim_end().strip_suffix("```") else {
        return text;
    };
    let body = match body.find('\n') {
        Some(newline) if !body[..newline].trim_start().starts_with(|c: char| c == '{' || c == '[') => {
            &body[newline + 1..]
        }
        _ => body,
    };
    body.trim()
}

fn ingredient_list(value: Option<&Value>) -> Vec<Ingredient> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .map(|item| Ingredient {
            name: value_to_string(item.get("name")).unwrap_or_default(),
            description: value_to_string(item.get("description")).unwrap_or_default(),
            category: item
                .get("category")
                .and_then(Value::as_str)
                .and_then(IngredientCategory::parse_lenient)
                .unwrap_or(IngredientCategory::Neutral),
        })
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedup_keep_first(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn health_score(value: Option<&Value>) -> Option<u8> {
    let score = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !score.is_finite() {
        return None;
    }
    Some(score.round().clamp(0.0, 100.0) as u8)
}

fn value_to_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let v = s.trim();
            if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
