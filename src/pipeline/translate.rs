//! Chat-completion backed translation collaborator.
//!
//! Segments are translated in batches through an OpenAI-compatible
//! chat-completions endpoint. Each batch joins the source lines with a
//! separator token the model is instructed to preserve; a short response is
//! padded with the source text so timing never drifts out of alignment.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;

use crate::config::AppConfig;
use crate::error::StageError;
use crate::store::schema::Segment;

use super::collab::Translator;

const SEPARATOR: &str = "\n|||SEPARATOR|||\n";
const SEPARATOR_TOKEN: &str = "|||SEPARATOR|||";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ChatTranslator {
    client: reqwest::blocking::Client,
    config: Arc<AppConfig>,
}

impl ChatTranslator {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    fn translate_batch(&self, texts: &[&str], target_language: &str) -> Result<Vec<String>, StageError> {
        let api_key = self
            .config
            .openai_api_key
            .as_deref()
            .ok_or_else(|| StageError::Translate("OPENAI_API_KEY is not set".to_string()))?;

        let system_prompt = format!(
            "You are a professional subtitle translator. Translate the following \
             subtitle lines into {target_language}. Rules:\n\
             1. Keep the line correspondence, separated by {SEPARATOR_TOKEN}\n\
             2. Translate naturally and idiomatically\n\
             3. Keep proper nouns and brand names\n\
             4. Output only the translations, no explanations"
        );
        let body = json!({
            "model": self.config.translate_model,
            "temperature": 0.3,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": texts.join(SEPARATOR) },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.openai_api_base))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .map_err(|err| StageError::Translate(format!("request failed: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StageError::Translate("rate limited by upstream API".to_string()));
        }
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(StageError::Translate(format!(
                "upstream API returned {status}: {}",
                detail.chars().take(300).collect::<String>()
            )));
        }

        let value: serde_json::Value = response
            .json()
            .map_err(|err| StageError::Translate(format!("invalid response body: {err}")))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| StageError::Translate("response carried no content".to_string()))?;

        Ok(split_translations(content, texts))
    }
}

impl Translator for ChatTranslator {
    fn translate(
        &self,
        task_id: &str,
        mut segments: Vec<Segment>,
        target_language: &str,
    ) -> Result<Vec<Segment>, StageError> {
        if segments.is_empty() {
            return Ok(segments);
        }
        info!(
            "[{task_id}] translating {} segments to {target_language}",
            segments.len()
        );

        let chunk_size = self.config.translate_chunk_size.max(1);
        let mut index = 0;
        while index < segments.len() {
            let upper = (index + chunk_size).min(segments.len());
            let chunk = &segments[index..upper];

            // Nothing to do when the source already speaks the target
            // language.
            if chunk
                .first()
                .is_some_and(|seg| seg.language.eq_ignore_ascii_case(target_language))
            {
                index = upper;
                continue;
            }

            let texts: Vec<&str> = chunk.iter().map(|seg| seg.text.as_str()).collect();
            let translations = self.translate_batch(&texts, target_language)?;
            for (segment, translation) in segments[index..upper].iter_mut().zip(translations) {
                segment.translation = Some(translation);
            }
            index = upper;
        }

        info!("[{task_id}] translation finished");
        Ok(segments)
    }
}

/// Splits the model response back into per-segment translations. A count
/// mismatch is padded with the source text rather than shifting lines.
fn split_translations(content: &str, sources: &[&str]) -> Vec<String> {
    let mut translations: Vec<String> = content
        .split(SEPARATOR_TOKEN)
        .map(|part| part.trim().to_string())
        .collect();
    if translations.len() != sources.len() {
        warn!(
            "translation count mismatch: expected {}, got {}",
            sources.len(),
            translations.len()
        );
    }
    while translations.len() < sources.len() {
        translations.push(sources[translations.len()].to_string());
    }
    translations.truncate(sources.len());
    for (translation, source) in translations.iter_mut().zip(sources) {
        if translation.is_empty() {
            *translation = source.to_string();
        }
    }
    translations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_splits_per_segment() {
        let content = "你好\n|||SEPARATOR|||\n世界";
        let out = split_translations(content, &["hello", "world"]);
        assert_eq!(out, vec!["你好".to_string(), "世界".to_string()]);
    }

    #[test]
    fn short_response_is_padded_with_source_text() {
        let out = split_translations("你好", &["hello", "world", "again"]);
        assert_eq!(
            out,
            vec!["你好".to_string(), "world".to_string(), "again".to_string()]
        );
    }

    #[test]
    fn long_response_is_truncated() {
        let content = "一\n|||SEPARATOR|||\n二\n|||SEPARATOR|||\n三";
        let out = split_translations(content, &["one", "two"]);
        assert_eq!(out, vec!["一".to_string(), "二".to_string()]);
    }

    #[test]
    fn empty_lines_fall_back_to_source() {
        let content = "你好\n|||SEPARATOR|||\n";
        let out = split_translations(content, &["hello", "world"]);
        assert_eq!(out, vec!["你好".to_string(), "world".to_string()]);
    }

    #[test]
    fn missing_api_key_is_a_translate_error() {
        let translator = ChatTranslator::new(Arc::new(AppConfig::default())).unwrap();
        let err = translator.translate_batch(&["hi"], "zh").unwrap_err();
        assert_eq!(err.kind(), "TranslateError");
    }
}
