use std::sync::Arc;
use tracing::debug;

use crate::capture::ScreenshotArtifact;
use crate::cli::config::{ExtractionSettings, RetrySettings};
use crate::extraction::merge::{self, MergeContext};
use crate::extraction::{ExtractionResult, MarkupExtractor, MergedProduct, OcrExtractor, Scored, TextRecognizer};
use crate::variants::PageState;

/// Runs both extractors for a page state and merges their results
pub struct ExtractionMergeEngine {
    markup: MarkupExtractor,
    ocr: OcrExtractor,
    currency: String,
}

impl ExtractionMergeEngine {
    pub fn new(settings: &ExtractionSettings, retry: &RetrySettings, recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self {
            markup: MarkupExtractor::new(settings),
            ocr: OcrExtractor::new(recognizer, settings, retry),
            currency: settings.currency.clone(),
        }
    }

    /// Markup extraction; the variant control's article hint fills a missing article number
    pub fn extract_markup(&self, html: &str, page_url: &str, state: &PageState) -> Option<ExtractionResult> {
        let mut result = self.markup.extract(html, page_url)?;
        if result.article_number.is_none() {
            if let Some(hint) = state.article_hint() {
                debug!("Using variant article hint {} for {}", hint, state);
                result.article_number = Some(Scored::new(hint.to_string(), 1.0));
            }
        }
        Some(result)
    }

    pub async fn extract_ocr(&self, artifacts: &[ScreenshotArtifact]) -> Option<ExtractionResult> {
        self.ocr.extract(artifacts).await
    }

    pub fn merge(
        &self,
        markup: Option<&ExtractionResult>,
        ocr: Option<&ExtractionResult>,
        page_url: &str,
        state: &PageState,
    ) -> Option<MergedProduct> {
        let state_key = state.key_string();
        merge::merge(
            markup,
            ocr,
            MergeContext {
                source_url: page_url,
                state_key: &state_key,
                currency: &self.currency,
            },
        )
    }

    /// Extract from both sources and merge
    pub async fn process(
        &self,
        html: &str,
        artifacts: &[ScreenshotArtifact],
        page_url: &str,
        state: &PageState,
    ) -> Option<MergedProduct> {
        let markup = self.extract_markup(html, page_url, state);
        let ocr = self.extract_ocr(artifacts).await;
        self.merge(markup.as_ref(), ocr.as_ref(), page_url, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Region;
    use crate::extraction::{OcrLine, Source};
    use crate::testing::{png, StaticRecognizer};
    use crate::variants::{Activation, OptionHandle, SelectorKind};

    const URL: &str = "https://shop.example/p/spritze";

    fn engine(recognizer: StaticRecognizer) -> ExtractionMergeEngine {
        ExtractionMergeEngine::new(&ExtractionSettings::default(), &RetrySettings::default(), Arc::new(recognizer))
    }

    #[tokio::test]
    async fn test_markup_beats_weaker_ocr_price() {
        let html = r#"
            <h1 itemprop="name">Einmalspritze</h1>
            <span itemprop="sku">10-4711</span>
            <meta itemprop="price" content="49.99">"#;
        let recognizer = StaticRecognizer::new().region(Region::Price, vec![OcrLine::new("45,99 €", 0.6)]);
        let artifacts = vec![ScreenshotArtifact::from_png(Region::Price, png(60, 20), PageState::base(), None).unwrap()];

        let merged = engine(recognizer).process(html, &artifacts, URL, &PageState::base()).await.unwrap();

        assert_eq!(merged.price(), Some(49.99));
        assert_eq!(merged.price_source(), Some(Source::Markup));
        assert!(merged.has_critical_fields());
        assert_eq!(merged.state_key(), "base");
    }

    #[tokio::test]
    async fn test_article_hint_fills_gap() {
        let state = PageState::with_activations(vec![Activation {
            group: "size".into(),
            label: "20 ml".into(),
            handle: OptionHandle {
                kind: SelectorKind::Radio,
                selector: "#s2".into(),
                value: None,
            },
            article_hint: Some("A-20".into()),
        }]);

        let result = engine(StaticRecognizer::new())
            .extract_markup("<h1>Spritze</h1>", URL, &state)
            .unwrap();
        assert_eq!(result.article_number.unwrap().value, "A-20");
    }

    #[tokio::test]
    async fn test_nothing_to_extract() {
        let merged = engine(StaticRecognizer::new()).process("", &[], URL, &PageState::base()).await;
        assert!(merged.is_none());
    }
}
