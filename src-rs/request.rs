use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::PipelineError;
use crate::normalize::NormalizedImage;

/// Fixed directive sent with every analysis. Never derived from user input.
pub const INSTRUCTION: &str = "\
You are a pediatric nutrition assistant. The attached photos all show the same packaged food product \
(front label, ingredient list, nutrition panel); read them together as one product.

1. Identify the product name and the complete ingredient list.
2. Explain every ingredient in plain, non-technical language a parent can understand.
3. Classify every ingredient as exactly one of HEALTHY, NEUTRAL, CAUTION or UNHEALTHY.
4. Judge whether the product suits children aged 1 to 6 and give one verdict: \
SAFE, MODERATE or AVOID, with a short reason.
5. List warnings (allergens, additives, high sugar or sodium, choking hazards) and pros.
6. Give an overall health score from 0 to 100.

Write every human-readable field in Traditional Chinese (zh-TW). Keep enum values in English. \
If a label is unreadable, say so in the summary instead of guessing.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagePart {
    pub media_type: String,
    pub data: String,
}

/// One analysis attempt. Image order is capture order.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    images: Vec<ImagePart>,
    instruction: &'static str,
    schema: Value,
}

impl AnalysisRequest {
    pub fn images(&self) -> &[ImagePart] {
        &self.images
    }

    pub fn instruction(&self) -> &str {
        self.instruction
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn payload_len(&self) -> usize {
        self.images.iter().map(|part| part.data.len()).sum()
    }

    /// `generateContent` request body: instruction first, then images in capture order,
    /// with the response constrained to JSON matching [`output_schema`].
    pub fn to_body(&self) -> Value {
        let mut parts = Vec::with_capacity(self.images.len() + 1);
        parts.push(json!({ "text": self.instruction }));
        for image in &self.images {
            parts.push(json!({
                "inline_data": {
                    "mime_type": image.media_type,
                    "data": image.data,
                }
            }));
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": self.schema,
            },
        })
    }
}

pub fn build_request<'a, I>(images: I) -> Result<AnalysisRequest, PipelineError>
where
    I: IntoIterator<Item = &'a NormalizedImage>,
{
    let images: Vec<ImagePart> = images
        .into_iter()
        .map(|image| ImagePart {
            media_type: image.media_type.clone(),
            data: image.encoded.clone(),
        })
        .collect();
    if images.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let request = AnalysisRequest {
        images,
        instruction: INSTRUCTION,
        schema: output_schema(),
    };
    debug!(
        images = request.images.len(),
        payload_len = request.payload_len(),
        "built analysis request"
    );
    Ok(request)
}

/// Declared response shape, in the backend's OpenAPI-subset schema dialect.
pub fn output_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "productName": { "type": "STRING", "description": "Product name as printed on the package." },
            "summary": { "type": "STRING", "description": "Two or three sentence overview for a parent." },
            "healthScore": { "type": "INTEGER", "description": "Overall health score from 0 (worst) to 100 (best)." },
            "childSuitability": {
                "type": "OBJECT",
                "properties": {
                    "status": { "type": "STRING", "enum": ["SAFE", "MODERATE", "AVOID"] },
                    "reason": { "type": "STRING" }
                },
                "required": ["status", "reason"]
            },
            "ingredients": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING" },
                        "description": { "type": "STRING" },
                        "category": { "type": "STRING", "enum": ["HEALTHY", "NEUTRAL", "CAUTION", "UNHEALTHY"] }
                    },
                    "required": ["name", "description", "category"]
                }
            },
            "warnings": { "type": "ARRAY", "items": { "type": "STRING" } },
            "pros": { "type": "ARRAY", "items": { "type": "STRING" } }
        },
        "required": ["productName", "summary", "childSuitability", "ingredients", "warnings", "pros"]
    })
}
