//! Field extraction from page markup and screenshots, and the merge of both.

pub mod engine;
pub mod markup;
pub mod merge;
pub mod ocr;
pub mod price;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export common types
pub use engine::ExtractionMergeEngine;
pub use markup::MarkupExtractor;
pub use merge::merge;
pub use ocr::{OcrExtractor, OcrLine, RecognitionError, TesseractRecognizer, TextRecognizer};

/// Where a field value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Markup,
    Ocr,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Markup => f.write_str("markup"),
            Source::Ocr => f.write_str("ocr"),
        }
    }
}

/// A value with the extractor's confidence in it, within [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored<T> {
    pub value: T,
    pub confidence: f32,
}

impl<T> Scored<T> {
    pub fn new(value: T, confidence: f32) -> Self {
        Self {
            value,
            confidence: if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) },
        }
    }
}

/// One row of a quantity price table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TieredPrice {
    /// Minimum order quantity; unknown when only the price column was readable
    pub quantity: Option<u32>,
    pub price: f64,
}

/// Fields found by one extraction method for one page state
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub source: Source,
    pub article_number: Option<Scored<String>>,
    pub product_name: Option<Scored<String>>,
    pub description: Option<Scored<String>>,
    /// Zero is a value here; it only stops counting as a price in the merged record
    pub price: Option<Scored<f64>>,
    /// Never holds an empty list
    pub tiered_prices: Option<Scored<Vec<TieredPrice>>>,
    pub image_ref: Option<Scored<String>>,
    /// Text shown instead of a price, e.g. "Auf Anfrage"
    pub price_note: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ExtractionResult {
    pub fn empty(source: Source) -> Self {
        Self {
            source,
            article_number: None,
            product_name: None,
            description: None,
            price: None,
            tiered_prices: None,
            image_ref: None,
            price_note: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Set the tier list, keeping the "no empty list" rule
    pub fn set_tiers(&mut self, tiers: Vec<TieredPrice>, confidence: f32) {
        self.tiered_prices = if tiers.is_empty() {
            None
        } else {
            Some(Scored::new(tiers, confidence))
        };
    }

    /// Number of fields that carry a value
    pub fn field_count(&self) -> usize {
        [
            self.article_number.is_some(),
            self.product_name.is_some(),
            self.description.is_some(),
            self.price.is_some(),
            self.tiered_prices.is_some(),
            self.image_ref.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

/// Arbitrated value with the source that won
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chosen<T> {
    pub value: T,
    pub source: Source,
    pub confidence: f32,
}

/// How a merged record is priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    Tiered,
    Single,
    OnRequest,
    Missing,
}

/// The record of one page state, built once by [`merge`] and never changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedProduct {
    pub(crate) article_number: Option<Chosen<String>>,
    pub(crate) product_name: Option<Chosen<String>>,
    pub(crate) description: Option<Chosen<String>>,
    pub(crate) price: Option<Chosen<f64>>,
    pub(crate) tiered_prices: Option<Chosen<Vec<TieredPrice>>>,
    pub(crate) image_ref: Option<Chosen<String>>,
    pub(crate) price_note: Option<String>,
    pub(crate) currency: String,
    pub(crate) source_url: String,
    pub(crate) state_key: String,
    pub(crate) overall_confidence: f32,
    pub(crate) has_critical_fields: bool,
    pub(crate) warnings: Vec<String>,
    pub(crate) extracted_at: DateTime<Utc>,
}

impl MergedProduct {
    pub fn article_number(&self) -> Option<&str> {
        self.article_number.as_ref().map(|c| c.value.as_str())
    }

    pub fn product_name(&self) -> Option<&str> {
        self.product_name.as_ref().map(|c| c.value.as_str())
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_ref().map(|c| c.value.as_str())
    }

    pub fn price(&self) -> Option<f64> {
        self.price.as_ref().map(|c| c.value)
    }

    pub fn tiered_prices(&self) -> &[TieredPrice] {
        self.tiered_prices.as_ref().map(|c| c.value.as_slice()).unwrap_or(&[])
    }

    pub fn image_ref(&self) -> Option<&str> {
        self.image_ref.as_ref().map(|c| c.value.as_str())
    }

    pub fn price_note(&self) -> Option<&str> {
        self.price_note.as_deref()
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Key of the page state this record was taken from
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    pub fn overall_confidence(&self) -> f32 {
        self.overall_confidence
    }

    pub fn has_critical_fields(&self) -> bool {
        self.has_critical_fields
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    /// Winning source of the price, or of the tiers when there is no price
    pub fn price_source(&self) -> Option<Source> {
        self.price
            .as_ref()
            .map(|c| c.source)
            .or_else(|| self.tiered_prices.as_ref().map(|c| c.source))
    }

    pub fn article_number_source(&self) -> Option<Source> {
        self.article_number.as_ref().map(|c| c.source)
    }

    pub fn pricing(&self) -> PricingMode {
        if !self.tiered_prices().is_empty() {
            PricingMode::Tiered
        } else if self.price().map_or(false, |p| p > 0.0) {
            PricingMode::Single
        } else if self.price_note.is_some() {
            PricingMode::OnRequest
        } else {
            PricingMode::Missing
        }
    }

    /// Every tier carries a quantity
    pub fn tier_quantities_complete(&self) -> bool {
        self.tiered_prices().iter().all(|t| t.quantity.is_some())
    }

    /// No product field was found by either source
    pub fn is_empty(&self) -> bool {
        self.article_number.is_none()
            && self.product_name.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.tiered_prices().is_empty()
            && self.price_note.is_none()
    }
}
