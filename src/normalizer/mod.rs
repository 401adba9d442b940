//! Input normalizer
//!
//! Turns text, URLs, data URIs, uploads and raw buffers into text plus an
//! optional structured payload. Images go through the vision model.

use crate::error::OrchestrationError;
use crate::extract::{extract_as, extract_json_object};
use crate::gateway::{purpose, GenerateOptions, ImagePayload, LanguageModel};
use crate::models::{
    CallContext, ContentType, DocumentData, InputFormat, NormalizedInput, ReceiptData, RequestInput,
    StructuredPayload, TableData,
};
use crate::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest blob accepted from a URL
pub const MAX_FETCH_BYTES: usize = 10 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp"];

/// Keyword cues per content type; two hits make a heuristic match
const CLASSIFICATION_CUES: &[(ContentType, &[&str])] = &[
    (
        ContentType::Receipt,
        &["receipt", "subtotal", "total", "tax", "cashier", "change due", "visa", "mastercard", "qty", "thank you for shopping"],
    ),
    (
        ContentType::Document,
        &["invoice", "statement", "account number", "dear", "agreement", "page ", "policy", "signature", "reference no"],
    ),
    (
        ContentType::Chart,
        &["chart", "graph", "axis", "legend", "trend", "plot"],
    ),
    (
        ContentType::Table,
        &["column", "row", "| ", "\t"],
    ),
];

const MIN_CUE_HITS: usize = 2;

const UNCERTAINTY_MARKERS: &[&str] = &["unclear", "unreadable", "illegible", "error", "cannot read", "can't read"];

lazy_static! {
    static ref DATA_URI: Option<Regex> =
        Regex::new(r"^data:([a-zA-Z0-9.+-]+/[a-zA-Z0-9.+-]+)?(?:;[a-zA-Z0-9=.-]+)*;base64,([A-Za-z0-9+/=\s]+)$").ok();
    static ref CURRENCY: Option<Regex> =
        Regex::new(r"(?i)[\$€£¥]\s?\d|\d+[.,]\d{2}\b|\b(usd|eur|gbp|total)\b").ok();
    static ref DATE: Option<Regex> =
        Regex::new(r"\b\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4}\b|(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}").ok();
}

/// Raw bytes plus the mime type the source reported
#[derive(Debug, Clone)]
pub struct FetchedBlob {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedBlob>;
}

/// reqwest-backed fetcher with a size cap
pub struct HttpBlobFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpBlobFetcher {
    pub fn new(max_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl BlobFetcher for HttpBlobFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBlob> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        if let Some(length) = response.content_length() {
            if length as usize > self.max_bytes {
                return Err(OrchestrationError::ParseError(format!(
                    "remote file is {} bytes, limit is {}",
                    length, self.max_bytes
                )));
            }
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

        let bytes = response.bytes().await?;
        if bytes.len() > self.max_bytes {
            return Err(OrchestrationError::ParseError(format!(
                "remote file exceeds {} bytes",
                self.max_bytes
            )));
        }

        Ok(FetchedBlob {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}

/// Mime type from magic bytes
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"%PDF") {
        Some("application/pdf")
    } else {
        None
    }
}

fn is_visual_mime(mime: &str) -> bool {
    mime.starts_with("image/") || mime == "application/pdf"
}

fn looks_like_image_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Transport shape of a request input; text that is really a URL or data URI is reclassified
pub fn detect_format(input: &RequestInput) -> InputFormat {
    match input {
        RequestInput::Text(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with("data:") && trimmed.contains(";base64,") {
                InputFormat::DataUri
            } else if (trimmed.starts_with("http://") || trimmed.starts_with("https://"))
                && !trimmed.contains(char::is_whitespace)
            {
                InputFormat::Url
            } else {
                InputFormat::Text
            }
        }
        RequestInput::Url(_) => InputFormat::Url,
        RequestInput::DataUri(_) => InputFormat::DataUri,
        RequestInput::File { .. } => InputFormat::File,
        RequestInput::Buffer(_) => InputFormat::Buffer,
    }
}

/// Decode `data:<mime>;base64,<payload>` into mime and bytes
pub fn parse_data_uri(uri: &str) -> Result<(Option<String>, Vec<u8>)> {
    let pattern = DATA_URI
        .as_ref()
        .ok_or_else(|| OrchestrationError::Unexpected("data URI pattern unavailable".to_string()))?;
    let captures = pattern
        .captures(uri.trim())
        .ok_or_else(|| OrchestrationError::ParseError("malformed data URI".to_string()))?;

    let mime = captures.get(1).map(|m| m.as_str().to_string());
    let payload: String = captures
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| OrchestrationError::ParseError(format!("invalid base64 payload: {}", e)))?;
    Ok((mime, bytes))
}

/// Heuristic classification; `None` when inconclusive
pub fn classify_heuristic(text: &str) -> Option<ContentType> {
    let lowered = text.to_lowercase();

    let mut scores: Vec<(ContentType, usize)> = CLASSIFICATION_CUES
        .iter()
        .map(|(content_type, cues)| {
            let hits = cues.iter().filter(|cue| lowered.contains(*cue)).count();
            (*content_type, hits)
        })
        .collect();

    // pipe- or tab-separated lines are a strong table signal
    let tabular_lines = text
        .lines()
        .filter(|line| line.matches('|').count() >= 2 || line.matches('\t').count() >= 2)
        .count();
    if tabular_lines >= 3 {
        if let Some(entry) = scores.iter_mut().find(|(t, _)| *t == ContentType::Table) {
            entry.1 += MIN_CUE_HITS;
        }
    }

    scores.sort_by(|a, b| b.1.cmp(&a.1));
    match scores.as_slice() {
        [(best, hits), rest @ ..] if *hits >= MIN_CUE_HITS && rest.first().map(|r| r.1 < *hits).unwrap_or(true) => {
            Some(*best)
        }
        _ => None,
    }
}

fn parse_content_type(text: &str) -> ContentType {
    let lowered = text.to_lowercase();
    [
        ("receipt", ContentType::Receipt),
        ("document", ContentType::Document),
        ("chart", ContentType::Chart),
        ("table", ContentType::Table),
        ("handwriting", ContentType::Handwriting),
    ]
    .iter()
    .find(|(label, _)| lowered.contains(label))
    .map(|(_, content_type)| *content_type)
    .unwrap_or(ContentType::Unknown)
}

/// Extraction confidence from output length, currency and date cues, and uncertainty markers
pub fn estimate_confidence(text: &str) -> f32 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let mut confidence: f32 = 0.5;
    let length = trimmed.chars().count();
    if length > 50 {
        confidence += 0.1;
    }
    if length > 200 {
        confidence += 0.1;
    }
    if CURRENCY.as_ref().map(|p| p.is_match(trimmed)).unwrap_or(false) {
        confidence += 0.15;
    }
    if DATE.as_ref().map(|p| p.is_match(trimmed)).unwrap_or(false) {
        confidence += 0.1;
    }

    let lowered = trimmed.to_lowercase();
    if UNCERTAINTY_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        confidence -= 0.3;
    }

    confidence.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub extract_structured: bool,
    pub call_context: CallContext,
}

pub struct InputNormalizer {
    model: Arc<dyn LanguageModel>,
    fetcher: Arc<dyn BlobFetcher>,
}

impl InputNormalizer {
    pub fn new(model: Arc<dyn LanguageModel>, fetcher: Arc<dyn BlobFetcher>) -> Self {
        Self { model, fetcher }
    }

    pub async fn normalize(&self, input: &RequestInput, options: &NormalizeOptions) -> Result<NormalizedInput> {
        let format = detect_format(input);
        debug!(format = ?format, "Normalizing input");

        let (mime, bytes) = match input {
            RequestInput::Text(text) if format == InputFormat::Text => {
                return Ok(passthrough(text, InputFormat::Text));
            }
            RequestInput::Text(uri) if format == InputFormat::DataUri => parse_data_uri(uri)?,
            RequestInput::DataUri(uri) => parse_data_uri(uri)?,
            RequestInput::Text(url) | RequestInput::Url(url) => {
                if !looks_like_image_url(url) {
                    return Ok(passthrough(url, InputFormat::Url));
                }
                let blob = self.fetcher.fetch(url.trim()).await?;
                (blob.mime_type, blob.bytes)
            }
            RequestInput::File { mime_type, bytes, .. } => (mime_type.clone(), bytes.clone()),
            RequestInput::Buffer(bytes) => (None, bytes.clone()),
        };

        let mime = mime
            .filter(|m| is_visual_mime(m) || m.starts_with("text/"))
            .or_else(|| sniff_mime(&bytes).map(str::to_string));

        match mime {
            Some(mime) if mime.starts_with("text/") => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Ok(passthrough(&text, format))
            }
            Some(mime) if is_visual_mime(&mime) => self.normalize_visual(mime, &bytes, format, options).await,
            _ => match String::from_utf8(bytes) {
                Ok(text) if !text.trim().is_empty() => Ok(passthrough(&text, format)),
                _ => Err(OrchestrationError::ParseError(
                    "unsupported or unrecognized file type".to_string(),
                )),
            },
        }
    }

    async fn normalize_visual(
        &self,
        mime_type: String,
        bytes: &[u8],
        format: InputFormat,
        options: &NormalizeOptions,
    ) -> Result<NormalizedInput> {
        let image = ImagePayload {
            mime_type,
            data_base64: STANDARD.encode(bytes),
        };

        let text = self.transcribe(&image, &options.call_context).await?;
        let content_type = match classify_heuristic(&text) {
            Some(content_type) => content_type,
            None => self.classify_with_model(&text, &options.call_context).await,
        };

        let structured = if options.extract_structured {
            self.extract_structured(&text, content_type, &options.call_context).await
        } else {
            None
        };

        let confidence = estimate_confidence(&text);
        info!(content_type = %content_type, confidence, "Visual input normalized");

        Ok(NormalizedInput {
            text,
            content_type,
            confidence,
            structured,
            original_format: format,
        })
    }

    async fn transcribe(&self, image: &ImagePayload, context: &CallContext) -> Result<String> {
        let prompt = "Transcribe all text visible in this image exactly as written, preserving line breaks. \
If it is a receipt, include every line item, amount and total. If a chart or table, describe its values. \
If parts are unreadable, write UNCLEAR for those parts. Return only the transcription.";

        let options = GenerateOptions::for_purpose(purpose::TRANSCRIPTION)
            .with_context(context)
            .with_image(image.clone())
            .with_temperature(0.1)
            .with_max_output_tokens(2048);

        let response = self.model.try_generate(prompt, &options).await?;
        Ok(response.text.trim().to_string())
    }

    async fn classify_with_model(&self, text: &str, context: &CallContext) -> ContentType {
        let prompt = format!(
            "Classify the following transcribed content as exactly one word: receipt, document, chart, table, handwriting or unknown.\n\nCONTENT:\n{}",
            text
        );
        let options = GenerateOptions::for_purpose(purpose::CONTENT_CLASSIFICATION)
            .with_context(context)
            .with_temperature(0.0)
            .with_max_output_tokens(16);

        match self.model.try_generate(&prompt, &options).await {
            Ok(response) => parse_content_type(&response.text),
            Err(e) => {
                warn!(error = %e, "Content classification failed");
                ContentType::Unknown
            }
        }
    }

    async fn extract_structured(
        &self,
        text: &str,
        content_type: ContentType,
        context: &CallContext,
    ) -> Option<StructuredPayload> {
        let schema = match content_type {
            ContentType::Receipt => {
                r#"{"merchant": string|null, "date": string|null, "total": number|null, "currency": string|null, "items": [{"description": string, "amount": number|null, "quantity": number|null}]}"#
            }
            ContentType::Document => {
                r#"{"title": string|null, "summary": string|null, "key_values": {"<field>": "<value>"}}"#
            }
            ContentType::Table => r#"{"headers": [string], "rows": [[value]]}"#,
            ContentType::Chart => r#"{"title": string|null, "series": [{"label": string, "value": number}]}"#,
            ContentType::Handwriting | ContentType::Unknown => return None,
        };

        let prompt = format!(
            "Extract the data from this {} transcription as JSON matching this schema:\n{}\n\nTRANSCRIPTION:\n{}\n\nReturn ONLY the JSON object.",
            content_type, schema, text
        );
        let options = GenerateOptions::for_purpose(purpose::STRUCTURED_EXTRACTION)
            .with_context(context)
            .with_temperature(0.0)
            .with_max_output_tokens(1536);

        let response = match self.model.try_generate(&prompt, &options).await {
            Ok(response) => response,
            Err(e) => {
                return Some(StructuredPayload::ExtractionFailed {
                    error: e.to_string(),
                })
            }
        };

        let parsed = match content_type {
            ContentType::Receipt => extract_as::<ReceiptData>(&response.text).map(StructuredPayload::Receipt),
            ContentType::Document => extract_as::<DocumentData>(&response.text).map(StructuredPayload::Document),
            ContentType::Table => extract_as::<TableData>(&response.text).map(StructuredPayload::Table),
            _ => extract_json_object(&response.text).map(|data| StructuredPayload::Raw { data }),
        };

        Some(parsed.unwrap_or_else(|e| {
            warn!(content_type = %content_type, error = %e, "Structured extraction failed");
            StructuredPayload::ExtractionFailed { error: e.to_string() }
        }))
    }
}

fn passthrough(text: &str, format: InputFormat) -> NormalizedInput {
    NormalizedInput {
        text: text.to_string(),
        content_type: ContentType::Unknown,
        confidence: 1.0,
        structured: None,
        original_format: format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedModel;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    const RECEIPT_TEXT: &str = "CORNER MARKET\n2024-03-14\nMilk 2.49\nBread 3.10\nSUBTOTAL 5.59\nTAX 0.45\nTOTAL 6.04\nVISA ****1234";

    struct StaticFetcher {
        blob: FetchedBlob,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlobFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedBlob> {
            self.fetched
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(url.to_string());
            Ok(self.blob.clone())
        }
    }

    fn fetcher() -> Arc<StaticFetcher> {
        Arc::new(StaticFetcher {
            blob: FetchedBlob {
                bytes: PNG_BYTES.to_vec(),
                mime_type: Some("image/png".into()),
            },
            fetched: Mutex::new(Vec::new()),
        })
    }

    fn receipt_model(extraction: &str) -> Arc<ScriptedModel> {
        let mut replies = HashMap::new();
        replies.insert(purpose::TRANSCRIPTION, RECEIPT_TEXT.to_string());
        replies.insert(purpose::STRUCTURED_EXTRACTION, extraction.to_string());
        Arc::new(ScriptedModel::by_purpose(replies))
    }

    fn options() -> NormalizeOptions {
        NormalizeOptions {
            extract_structured: true,
            call_context: CallContext::default(),
        }
    }

    #[tokio::test]
    async fn test_text_passes_through() {
        let model = Arc::new(ScriptedModel::failing());
        let normalizer = InputNormalizer::new(model.clone(), fetcher());

        let normalized = normalizer
            .normalize(&RequestInput::Text("show my budgets".into()), &options())
            .await
            .unwrap();

        assert_eq!(normalized.text, "show my budgets");
        assert_eq!(normalized.confidence, 1.0);
        assert_eq!(normalized.original_format, InputFormat::Text);
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_buffer_is_transcribed_and_extracted() {
        let model = receipt_model(
            r#"{"merchant": "Corner Market", "date": "2024-03-14", "total": 6.04, "currency": "USD", "items": [{"description": "Milk", "amount": 2.49}]}"#,
        );
        let normalizer = InputNormalizer::new(model.clone(), fetcher());

        let normalized = normalizer
            .normalize(&RequestInput::Buffer(PNG_BYTES.to_vec()), &options())
            .await
            .unwrap();

        assert_eq!(normalized.content_type, ContentType::Receipt);
        assert_eq!(normalized.original_format, InputFormat::Buffer);
        match normalized.structured {
            Some(StructuredPayload::Receipt(receipt)) => {
                assert_eq!(receipt.total, Some(6.04));
                assert_eq!(receipt.items.len(), 1);
            }
            other => panic!("expected receipt payload, got {:?}", other),
        }
        assert!(normalized.confidence > 0.7);

        // heuristics were conclusive, so no classification call
        assert_eq!(model.calls_for(purpose::CONTENT_CLASSIFICATION), 0);
        assert!(model.calls()[0].had_image);
    }

    #[tokio::test]
    async fn test_unparseable_extraction_yields_error_payload() {
        let model = receipt_model("Sorry, I could not extract that.");
        let normalizer = InputNormalizer::new(model, fetcher());

        let data_uri = format!("data:image/png;base64,{}", STANDARD.encode(PNG_BYTES));
        let normalized = normalizer
            .normalize(&RequestInput::DataUri(data_uri), &options())
            .await
            .unwrap();

        assert!(matches!(
            normalized.structured,
            Some(StructuredPayload::ExtractionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_inconclusive_heuristics_ask_the_model() {
        let mut replies = HashMap::new();
        replies.insert(purpose::TRANSCRIPTION, "Buy milk, call mom".to_string());
        replies.insert(purpose::CONTENT_CLASSIFICATION, "Handwriting".to_string());
        let model = Arc::new(ScriptedModel::by_purpose(replies));
        let normalizer = InputNormalizer::new(model.clone(), fetcher());

        let normalized = normalizer
            .normalize(&RequestInput::Buffer(PNG_BYTES.to_vec()), &options())
            .await
            .unwrap();

        assert_eq!(normalized.content_type, ContentType::Handwriting);
        assert!(normalized.structured.is_none());
        assert_eq!(model.calls_for(purpose::CONTENT_CLASSIFICATION), 1);
    }

    #[tokio::test]
    async fn test_only_image_urls_are_fetched() {
        let model = receipt_model("{}");
        let fetcher = fetcher();
        let normalizer = InputNormalizer::new(model, fetcher.clone());

        let page = normalizer
            .normalize(&RequestInput::Text("https://example.com/pricing".into()), &options())
            .await
            .unwrap();
        assert_eq!(page.original_format, InputFormat::Url);
        assert_eq!(page.text, "https://example.com/pricing");

        normalizer
            .normalize(&RequestInput::Url("https://example.com/r.JPG?size=l".into()), &options())
            .await
            .unwrap();
        assert_eq!(fetcher.fetched.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sniff_and_detect() {
        assert_eq!(sniff_mime(PNG_BYTES), Some("image/png"));
        assert_eq!(sniff_mime(b"%PDF-1.7"), Some("application/pdf"));
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"hello"), None);

        assert_eq!(
            detect_format(&RequestInput::Text("data:image/png;base64,AAAA".into())),
            InputFormat::DataUri
        );
        assert_eq!(
            detect_format(&RequestInput::Text("see https://x.io".into())),
            InputFormat::Text
        );
    }

    #[test]
    fn test_confidence_heuristic() {
        assert_eq!(estimate_confidence(""), 0.0);
        let clean = estimate_confidence(RECEIPT_TEXT);
        let unclear = estimate_confidence("TOTAL UNCLEAR");
        assert!(clean > unclear);
        assert!((0.0..=1.0).contains(&unclear));
    }

    #[test]
    fn test_heuristic_classification() {
        assert_eq!(classify_heuristic(RECEIPT_TEXT), Some(ContentType::Receipt));
        let table = "Month | Income | Spend\nJan | 3000 | 2100\nFeb | 3100 | 2500\nMar | 2900 | 2000";
        assert_eq!(classify_heuristic(table), Some(ContentType::Table));
        assert_eq!(classify_heuristic("hello world"), None);
    }
}
