use chrono::Utc;

use crate::extraction::{Chosen, ExtractionResult, MergedProduct, Scored, Source, TieredPrice};

const CRITICAL_WEIGHT: f32 = 2.0;
const OPTIONAL_WEIGHT: f32 = 1.0;

/// Record-level data that does not come from either extractor
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub source_url: &'a str,
    pub state_key: &'a str,
    pub currency: &'a str,
}

/// Values compared across sources to flag disagreement
trait FieldValue {
    fn same(&self, other: &Self) -> bool;
    fn describe(&self) -> String;
}

impl FieldValue for String {
    fn same(&self, other: &Self) -> bool {
        let norm = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        norm(self) == norm(other)
    }

    fn describe(&self) -> String {
        format!("'{}'", self)
    }
}

impl FieldValue for f64 {
    fn same(&self, other: &Self) -> bool {
        (self - other).abs() < 0.005
    }

    fn describe(&self) -> String {
        format!("{:.2}", self)
    }
}

impl FieldValue for Vec<TieredPrice> {
    fn same(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other)
                .all(|(a, b)| a.quantity == b.quantity && a.price.same(&b.price))
    }

    fn describe(&self) -> String {
        format!("{} tier(s)", self.len())
    }
}

/// Pick the value for one field.
///
/// A value from a single source wins outright; with two, the higher confidence
/// wins and markup takes ties.
pub fn arbitrate<T: Clone>(markup: Option<&Scored<T>>, ocr: Option<&Scored<T>>) -> Option<Chosen<T>> {
    let chosen = |scored: &Scored<T>, source| Chosen {
        value: scored.value.clone(),
        source,
        confidence: scored.confidence,
    };

    match (markup, ocr) {
        (Some(m), Some(o)) if o.confidence > m.confidence => Some(chosen(o, Source::Ocr)),
        (Some(m), _) => Some(chosen(m, Source::Markup)),
        (None, Some(o)) => Some(chosen(o, Source::Ocr)),
        (None, None) => None,
    }
}

fn arbitrate_checked<T: Clone + FieldValue>(
    field: &str,
    markup: Option<&Scored<T>>,
    ocr: Option<&Scored<T>>,
    warnings: &mut Vec<String>,
) -> Option<Chosen<T>> {
    if let (Some(m), Some(o)) = (markup, ocr) {
        if !m.value.same(&o.value) {
            warnings.push(format!(
                "{}: markup {} ({:.2}) disagrees with ocr {} ({:.2})",
                field,
                m.value.describe(),
                m.confidence,
                o.value.describe(),
                o.confidence
            ));
        }
    }
    arbitrate(markup, ocr)
}

/// True when the record names an article and a product and carries a usable price.
///
/// Presence only; confidence plays no part. A zero price is not a usable price.
pub fn has_critical_fields(
    article_number: Option<&str>,
    product_name: Option<&str>,
    price: Option<f64>,
    tiers: &[TieredPrice],
) -> bool {
    let non_empty = |v: Option<&str>| v.map_or(false, |s| !s.trim().is_empty());
    non_empty(article_number) && non_empty(product_name) && (price.map_or(false, |p| p > 0.0) || !tiers.is_empty())
}

/// Merge the two extraction results of one page state into its record.
///
/// Returns `None` when neither source produced a result.
pub fn merge(
    markup: Option<&ExtractionResult>,
    ocr: Option<&ExtractionResult>,
    context: MergeContext<'_>,
) -> Option<MergedProduct> {
    if markup.is_none() && ocr.is_none() {
        return None;
    }

    let mut warnings = Vec::new();
    for result in [markup, ocr].into_iter().flatten() {
        let source = result.source;
        warnings.extend(result.warnings.iter().map(|w| format!("{}: {}", source, w)));
        warnings.extend(result.errors.iter().map(|e| format!("{} error: {}", source, e)));
    }

    let article_number = arbitrate_checked(
        "articleNumber",
        markup.and_then(|r| r.article_number.as_ref()),
        ocr.and_then(|r| r.article_number.as_ref()),
        &mut warnings,
    );
    let product_name = arbitrate(
        markup.and_then(|r| r.product_name.as_ref()),
        ocr.and_then(|r| r.product_name.as_ref()),
    );
    let description = arbitrate(
        markup.and_then(|r| r.description.as_ref()),
        ocr.and_then(|r| r.description.as_ref()),
    );
    let price = arbitrate_checked(
        "price",
        markup.and_then(|r| r.price.as_ref()),
        ocr.and_then(|r| r.price.as_ref()),
        &mut warnings,
    );
    let tiered_prices = arbitrate_checked(
        "tieredPrices",
        markup.and_then(|r| r.tiered_prices.as_ref()).filter(|t| !t.value.is_empty()),
        ocr.and_then(|r| r.tiered_prices.as_ref()).filter(|t| !t.value.is_empty()),
        &mut warnings,
    );
    let image_ref = arbitrate(
        markup.and_then(|r| r.image_ref.as_ref()),
        ocr.and_then(|r| r.image_ref.as_ref()),
    );
    let price_note = markup
        .and_then(|r| r.price_note.clone())
        .or_else(|| ocr.and_then(|r| r.price_note.clone()));

    let tiers: &[TieredPrice] = tiered_prices.as_ref().map(|c| c.value.as_slice()).unwrap_or(&[]);
    let critical = has_critical_fields(
        article_number.as_ref().map(|c| c.value.as_str()),
        product_name.as_ref().map(|c| c.value.as_str()),
        price.as_ref().map(|c| c.value),
        tiers,
    );

    // Price and tiers form one slot; the better of the two counts
    let price_slot = [price.as_ref().map(|c| c.confidence), tiered_prices.as_ref().map(|c| c.confidence)]
        .into_iter()
        .flatten()
        .fold(None, |best: Option<f32>, c| Some(best.map_or(c, |b| b.max(c))));

    let mut weighted = vec![
        (CRITICAL_WEIGHT, article_number.as_ref().map_or(0.0, |c| c.confidence)),
        (CRITICAL_WEIGHT, product_name.as_ref().map_or(0.0, |c| c.confidence)),
        (CRITICAL_WEIGHT, price_slot.unwrap_or(0.0)),
    ];
    weighted.extend(description.as_ref().map(|c| (OPTIONAL_WEIGHT, c.confidence)));
    weighted.extend(image_ref.as_ref().map(|c| (OPTIONAL_WEIGHT, c.confidence)));

    let total_weight: f32 = weighted.iter().map(|(w, _)| w).sum();
    let overall_confidence = weighted.iter().map(|(w, c)| w * c).sum::<f32>() / total_weight;

    Some(MergedProduct {
        article_number,
        product_name,
        description,
        price,
        tiered_prices,
        image_ref,
        price_note,
        currency: context.currency.to_string(),
        source_url: context.source_url.to_string(),
        state_key: context.state_key.to_string(),
        overall_confidence,
        has_critical_fields: critical,
        warnings,
        extracted_at: Utc::now(),
    })
}
