//! Per-family wire body codecs.
//!
//! Field names are bit-exact to the provider contract for each family.
//! Encoding is table-driven off [`ModelFamily`], which the catalog infers
//! from the model id prefix; decoding tolerates absent usage fields (the
//! invoker falls back to length-based estimates).

use serde_json::{Value, json};

use crate::config::ModelFamily;
use crate::{MimirError, Result};

/// Anthropic version tag required by Claude-style bodies.
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Decoded generation output plus any provider-reported usage.
#[derive(Debug, Clone)]
pub struct DecodedGeneration {
    pub content: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// Encode a generation request body for a text-producing family.
///
/// `TitanEmbed` is not a generation family and yields `Client`.
pub fn encode_generation(
    family: ModelFamily,
    prompt: &str,
    temperature: f32,
    max_tokens: u32,
) -> Result<Value> {
    let body = match family {
        ModelFamily::ClaudeChat => json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{"role": "user", "content": prompt}],
        }),
        ModelFamily::TitanText => json!({
            "inputText": prompt,
            "textGenerationConfig": {
                "maxTokenCount": max_tokens,
                "temperature": temperature,
            },
        }),
        ModelFamily::Llama => json!({
            "prompt": prompt,
            "max_gen_len": max_tokens,
            "temperature": temperature,
        }),
        ModelFamily::Mistral | ModelFamily::Mixtral => json!({
            "prompt": prompt,
            "max_tokens": max_tokens,
            "temperature": temperature,
        }),
        ModelFamily::TitanEmbed => {
            return Err(MimirError::Client(
                "embedding model cannot serve generation".into(),
            ));
        }
    };
    Ok(body)
}

/// Decode a generation response body.
pub fn decode_generation(family: ModelFamily, body: &[u8]) -> Result<DecodedGeneration> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| MimirError::Protocol(format!("invalid response JSON: {e}")))?;

    match family {
        ModelFamily::ClaudeChat => {
            let content = value["content"][0]["text"]
                .as_str()
                .ok_or_else(|| MimirError::Protocol("missing content[0].text".into()))?
                .to_string();
            Ok(DecodedGeneration {
                content,
                input_tokens: value["usage"]["input_tokens"].as_u64().map(|v| v as u32),
                output_tokens: value["usage"]["output_tokens"].as_u64().map(|v| v as u32),
            })
        }
        ModelFamily::TitanText => {
            let content = value["results"][0]["outputText"]
                .as_str()
                .ok_or_else(|| MimirError::Protocol("missing results[0].outputText".into()))?
                .to_string();
            Ok(DecodedGeneration {
                content,
                input_tokens: value["inputTextTokenCount"].as_u64().map(|v| v as u32),
                output_tokens: value["results"][0]["tokenCount"].as_u64().map(|v| v as u32),
            })
        }
        ModelFamily::Llama => {
            let content = value["generation"]
                .as_str()
                .ok_or_else(|| MimirError::Protocol("missing generation".into()))?
                .to_string();
            Ok(DecodedGeneration {
                content,
                input_tokens: value["prompt_token_count"].as_u64().map(|v| v as u32),
                output_tokens: value["generation_token_count"].as_u64().map(|v| v as u32),
            })
        }
        ModelFamily::Mistral | ModelFamily::Mixtral => {
            let content = value["outputs"][0]["text"]
                .as_str()
                .ok_or_else(|| MimirError::Protocol("missing outputs[0].text".into()))?
                .to_string();
            Ok(DecodedGeneration {
                content,
                input_tokens: None,
                output_tokens: None,
            })
        }
        ModelFamily::TitanEmbed => Err(MimirError::Client(
            "embedding model cannot serve generation".into(),
        )),
    }
}

/// Encode an embedding request body.
pub fn encode_embedding(family: ModelFamily, text: &str) -> Result<Value> {
    match family {
        ModelFamily::TitanEmbed => Ok(json!({"inputText": text})),
        _ => Err(MimirError::Client(format!(
            "{} is not an embedding family",
            family.as_str()
        ))),
    }
}

/// Decode an embedding response body.
pub fn decode_embedding(family: ModelFamily, body: &[u8]) -> Result<Vec<f32>> {
    if family != ModelFamily::TitanEmbed {
        return Err(MimirError::Client(format!(
            "{} is not an embedding family",
            family.as_str()
        )));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| MimirError::Protocol(format!("invalid response JSON: {e}")))?;
    let embedding = value["embedding"]
        .as_array()
        .ok_or_else(|| MimirError::Protocol("missing embedding array".into()))?;
    embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| MimirError::Protocol("non-numeric embedding element".into()))
        })
        .collect()
}
