use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capture::{Region, ScreenshotArtifact};
use crate::cli::config::{ExtractionSettings, OcrSettings, RetrySettings};
use crate::extraction::markup::ARTICLE_LABEL;
use crate::extraction::price;
use crate::extraction::{ExtractionResult, Scored, Source};
use crate::utils::retry::Backoff;

/// Confidence factor for text that did not match the field's expected shape
const UNMATCHED_FACTOR: f32 = 0.5;

/// Placeholder reference for an image taken from a screenshot
pub const ARTIFACT_IMAGE_REF: &str = "artifact:image";

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("recognition engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recognition engine exited with {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),

    #[error("unreadable recognition output: {0}")]
    Output(String),
}

impl RecognitionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecognitionError::Timeout(_) | RecognitionError::Failed { .. })
    }
}

/// One recognised line with the engine's confidence in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f32,
}

impl OcrLine {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Text recognition over a captured region
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, artifact: &ScreenshotArtifact) -> Result<Vec<OcrLine>, RecognitionError>;
}

/// Runs the `tesseract` binary, reading TSV output from stdout
pub struct TesseractRecognizer {
    settings: OcrSettings,
}

impl TesseractRecognizer {
    pub fn new(settings: OcrSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, artifact: &ScreenshotArtifact) -> Result<Vec<OcrLine>, RecognitionError> {
        let mut child = Command::new(&self.settings.binary)
            .args(["stdin", "stdout", "-l", &self.settings.language, "--psm"])
            .arg(self.settings.page_segmentation_mode.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(artifact.png()).await?;
            // Closing stdin lets the engine start
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RecognitionError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let tsv = String::from_utf8(output.stdout).map_err(|e| RecognitionError::Output(e.to_string()))?;
        Ok(parse_tsv(&tsv, self.settings.min_word_confidence))
    }
}

/// Group word rows of tesseract TSV into lines.
///
/// Words below `min_word_confidence` (engine scale 0-100) are dropped; a
/// line's confidence is the mean of its remaining words.
pub fn parse_tsv(tsv: &str, min_word_confidence: f32) -> Vec<OcrLine> {
    let mut lines: BTreeMap<(u32, u32, u32, u32), (Vec<String>, Vec<f32>)> = BTreeMap::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let key = |i: usize| cols[i].parse::<u32>().unwrap_or(0);
        let Ok(confidence) = cols[10].parse::<f32>() else { continue };
        let text = cols[11].trim();
        if text.is_empty() || confidence < min_word_confidence {
            continue;
        }

        let entry = lines.entry((key(1), key(2), key(3), key(4))).or_default();
        entry.0.push(text.to_string());
        entry.1.push(confidence);
    }

    lines
        .into_values()
        .map(|(words, confidences)| {
            let mean = confidences.iter().sum::<f32>() / confidences.len() as f32;
            OcrLine::new(words.join(" "), (mean / 100.0).clamp(0.0, 1.0))
        })
        .collect()
}

/// Reads product fields from region screenshots
pub struct OcrExtractor {
    recognizer: Arc<dyn TextRecognizer>,
    timeout: Duration,
    backoff: Backoff,
    denylist: Option<Regex>,
    on_request_markers: Vec<String>,
}

impl OcrExtractor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, settings: &ExtractionSettings, retry: &RetrySettings) -> Self {
        Self {
            recognizer,
            timeout: Duration::from_secs(settings.ocr.timeout_secs),
            backoff: Backoff::from_settings(retry.ocr_attempts, retry),
            denylist: build_denylist(&settings.ui_denylist),
            on_request_markers: settings.price_on_request_markers.clone(),
        }
    }

    /// Recognise `artifacts` and map their text onto fields by region.
    ///
    /// Returns `None` when there is nothing to read.
    pub async fn extract(&self, artifacts: &[ScreenshotArtifact]) -> Option<ExtractionResult> {
        if artifacts.is_empty() {
            return None;
        }

        let mut result = ExtractionResult::empty(Source::Ocr);
        let mut full_text = None;

        for artifact in artifacts {
            // Product photos carry no text worth reading; the artifact itself is the reference
            if artifact.region() == Region::Image {
                result.image_ref = Some(Scored::new(ARTIFACT_IMAGE_REF.to_string(), UNMATCHED_FACTOR));
                continue;
            }

            let lines = match self.recognize_with_retry(artifact).await {
                Ok(lines) => self.clean(lines),
                Err(e) => {
                    warn!("Recognition of region {} failed: {}", artifact.region(), e);
                    result.errors.push(format!("region {}: {}", artifact.region(), e));
                    continue;
                }
            };
            debug!("Recognised {} line(s) in region {}", lines.len(), artifact.region());

            match artifact.region() {
                Region::Price => self.read_price(&lines, &mut result),
                Region::Description => read_description(&lines, &mut result),
                Region::Full => full_text = Some(lines),
                Region::Image => {}
            }
        }

        // The viewport only fills gaps left by the targeted regions
        if let Some(lines) = full_text {
            if result.article_number.is_none() {
                result.article_number = find_article(&lines);
            }
            if result.price.is_none() && result.tiered_prices.is_none() {
                self.read_price(&lines, &mut result);
            }
        }

        Some(result)
    }

    async fn recognize_with_retry(&self, artifact: &ScreenshotArtifact) -> Result<Vec<OcrLine>, RecognitionError> {
        let attempts = self.backoff.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, self.recognizer.recognize(artifact)).await {
                Ok(result) => result,
                Err(_) => Err(RecognitionError::Timeout(self.timeout)),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!("Recognition attempt {}/{} failed: {}", attempt, attempts, e);
                    self.backoff.wait(attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Strip UI chrome tokens and drop lines left empty
    fn clean(&self, lines: Vec<OcrLine>) -> Vec<OcrLine> {
        lines
            .into_iter()
            .filter_map(|line| {
                let text = match &self.denylist {
                    Some(denylist) => denylist.replace_all(&line.text, " ").into_owned(),
                    None => line.text,
                };
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                let meaningful = text.chars().filter(|c| c.is_alphanumeric()).count() >= 2;
                meaningful.then(|| OcrLine::new(text, line.confidence))
            })
            .collect()
    }

    fn read_price(&self, lines: &[OcrLine], result: &mut ExtractionResult) {
        for line in lines {
            if let Some(note) = price::price_note(&line.text, &self.on_request_markers) {
                result.price_note = Some(note.to_string());
            }
        }

        let tier_lines: Vec<&OcrLine> = lines
            .iter()
            .filter(|l| !price::parse_tier_line(&l.text).is_empty())
            .collect();
        let tiers = price::normalize_tiers(price::parse_tier_lines(tier_lines.iter().map(|l| l.text.as_str())));
        if !tiers.is_empty() {
            let confidence = mean_confidence(&tier_lines);
            result.set_tiers(tiers, confidence);
        }

        if result.price.is_none() {
            result.price = lines
                .iter()
                .find_map(|l| price::find_price(&l.text).map(|v| Scored::new(v, l.confidence)));
        }
    }
}

fn read_description(lines: &[OcrLine], result: &mut ExtractionResult) {
    if result.article_number.is_none() {
        result.article_number = find_article(lines);
    }

    let mut rest = lines
        .iter()
        .filter(|l| !ARTICLE_LABEL.is_match(&l.text) && l.text.chars().any(char::is_alphabetic));

    // Product names have no fixed shape, so they never outrank a matched field
    if let Some(first) = rest.next() {
        result.product_name = Some(Scored::new(first.text.clone(), first.confidence * UNMATCHED_FACTOR));
    }

    let body: Vec<&OcrLine> = rest.collect();
    if !body.is_empty() {
        let text = body.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join(" ");
        result.description = Some(Scored::new(text, mean_confidence(&body) * UNMATCHED_FACTOR));
    }
}

fn find_article(lines: &[OcrLine]) -> Option<Scored<String>> {
    lines.iter().find_map(|l| {
        ARTICLE_LABEL
            .captures(&l.text)
            .map(|c| Scored::new(c[1].to_string(), l.confidence))
    })
}

fn mean_confidence(lines: &[&OcrLine]) -> f32 {
    if lines.is_empty() {
        return 0.0;
    }
    lines.iter().map(|l| l.confidence).sum::<f32>() / lines.len() as f32
}

fn build_denylist(tokens: &[String]) -> Option<Regex> {
    let mut tokens: Vec<&String> = tokens.iter().filter(|t| !t.trim().is_empty()).collect();
    if tokens.is_empty() {
        return None;
    }
    // Longest first so "In den Warenkorb" wins over "Warenkorb"
    tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));

    let pattern = format!(
        r"\b(?:{})\b",
        tokens
            .iter()
            .map(|t| regex::escape(t.trim()))
            .collect::<Vec<_>>()
            .join("|")
    );
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Could not build UI denylist: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::TieredPrice;
    use crate::testing::{png, StaticRecognizer};
    use crate::variants::PageState;

    fn artifact(region: Region) -> ScreenshotArtifact {
        ScreenshotArtifact::from_png(region, png(40, 20), PageState::base(), None).unwrap()
    }

    fn extractor(recognizer: StaticRecognizer) -> OcrExtractor {
        let retry = RetrySettings {
            ocr_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..RetrySettings::default()
        };
        OcrExtractor::new(Arc::new(recognizer), &ExtractionSettings::default(), &retry)
    }

    #[test]
    fn test_parse_tsv_groups_words_into_lines() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t96\tArt.-Nr.:\n\
                   5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t90\t10-4711\n\
                   5\t1\t1\t1\t2\t1\t0\t0\t10\t10\t12\t~~\n\
                   5\t1\t1\t1\t2\t2\t0\t0\t10\t10\t80\t49,99\n";

        let lines = parse_tsv(tsv, 30.0);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Art.-Nr.: 10-4711");
        assert!((lines[0].confidence - 0.93).abs() < 1e-6);
        assert_eq!(lines[1].text, "49,99");
    }

    #[tokio::test]
    async fn test_no_artifacts_yields_nothing() {
        assert!(extractor(StaticRecognizer::new()).extract(&[]).await.is_none());
    }

    #[tokio::test]
    async fn test_fields_by_region() {
        let recognizer = StaticRecognizer::new()
            .region(Region::Price, vec![
                OcrLine::new("In den Warenkorb", 0.9),
                OcrLine::new("45,99 € inkl. MwSt", 0.8),
                OcrLine::new("ab 10 Stück 44,00 € ab 50 Stück 42,50 €", 0.7),
            ])
            .region(Region::Description, vec![
                OcrLine::new("Startseite Einmalspritze 5 ml", 0.9),
                OcrLine::new("Art.-Nr.: 10-4711", 0.8),
                OcrLine::new("Luer-Ansatz, steril", 0.6),
            ]);

        let result = extractor(recognizer)
            .extract(&[artifact(Region::Price), artifact(Region::Description), artifact(Region::Image)])
            .await
            .unwrap();

        assert_eq!(result.source, Source::Ocr);
        assert_eq!(result.price, Some(Scored::new(45.99, 0.8)));
        assert_eq!(
            result.tiered_prices.unwrap().value,
            vec![
                TieredPrice { quantity: Some(10), price: 44.0 },
                TieredPrice { quantity: Some(50), price: 42.5 },
            ]
        );
        assert_eq!(result.article_number, Some(Scored::new("10-4711".to_string(), 0.8)));

        let name = result.product_name.unwrap();
        assert_eq!(name.value, "Einmalspritze 5 ml");
        assert!((name.confidence - 0.45).abs() < 1e-6);
        assert_eq!(result.description.unwrap().value, "Luer-Ansatz, steril");
        assert_eq!(result.image_ref.unwrap().value, ARTIFACT_IMAGE_REF);
    }

    #[tokio::test]
    async fn test_price_on_request_in_screenshot() {
        let recognizer = StaticRecognizer::new().region(Region::Price, vec![OcrLine::new("Preis auf Anfrage", 0.9)]);

        let result = extractor(recognizer).extract(&[artifact(Region::Price)]).await.unwrap();

        assert_eq!(result.price, None);
        assert_eq!(result.price_note.as_deref(), Some("Auf Anfrage"));
    }

    #[tokio::test]
    async fn test_failing_region_is_recorded() {
        let recognizer = StaticRecognizer::new()
            .failing(Region::Price)
            .region(Region::Description, vec![OcrLine::new("Tupfer", 0.9)]);

        let result = extractor(recognizer)
            .extract(&[artifact(Region::Price), artifact(Region::Description)])
            .await
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("region price"));
        assert_eq!(result.product_name.unwrap().value, "Tupfer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognition_timeout_is_retried_then_reported() {
        let recognizer = StaticRecognizer::new().hanging(Region::Price);
        let ocr = extractor(recognizer);

        let result = ocr.extract(&[artifact(Region::Price)]).await.unwrap();

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("timed out"));
    }
}
