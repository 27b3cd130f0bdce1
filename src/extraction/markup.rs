use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::ExtractionSettings;
use crate::extraction::price::{self, find_price, parse_price};
use crate::extraction::{ExtractionResult, Scored, Source};

/// Article numbers announced in running text, e.g. `Art.-Nr.: 10-4711`
pub(crate) static ARTICLE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:art(?:ikel)?\.?\s*-?\s*nr\.?|artikelnummer|bestell-?nr\.?|bestellnummer|sku)\s*[:#]?\s*([A-Z0-9][A-Z0-9./-]{2,30})",
    )
    .expect("ARTICLE_LABEL: hardcoded regex is valid")
});

struct FieldSelectorSet {
    article_number: Vec<Selector>,
    product_name: Vec<Selector>,
    description: Vec<Selector>,
    price: Vec<Selector>,
    tiered_price_rows: Vec<Selector>,
    image: Vec<Selector>,
}

/// Reads product fields from rendered markup
pub struct MarkupExtractor {
    selectors: FieldSelectorSet,
    json_ld: Selector,
    title: Selector,
    body: Selector,
    cells: Selector,
    on_request_markers: Vec<String>,
    fuzzy_confidence: f32,
}

impl MarkupExtractor {
    pub fn new(settings: &ExtractionSettings) -> Self {
        let fields = &settings.selectors;
        Self {
            selectors: FieldSelectorSet {
                article_number: compile_all(&fields.article_number),
                product_name: compile_all(&fields.product_name),
                description: compile_all(&fields.description),
                price: compile_all(&fields.price),
                tiered_price_rows: compile_all(&fields.tiered_price_rows),
                image: compile_all(&fields.image),
            },
            json_ld: fixed("script[type='application/ld+json']"),
            title: fixed("title"),
            body: fixed("body"),
            cells: fixed("td, th"),
            on_request_markers: settings.price_on_request_markers.clone(),
            fuzzy_confidence: settings.fuzzy_confidence,
        }
    }

    /// Extract fields from `html`, resolving relative image URLs against `page_url`.
    ///
    /// Returns `None` for empty markup. Structural selectors score 1.0, free-text
    /// matches score the configured fuzzy confidence.
    pub fn extract(&self, html: &str, page_url: &str) -> Option<ExtractionResult> {
        if html.trim().is_empty() {
            return None;
        }

        let document = Html::parse_document(html);
        let product_ld = self.json_ld_product(&document);
        let mut result = ExtractionResult::empty(Source::Markup);

        // Selectors reflect the active variant; JSON-LD often only describes the base product
        result.article_number = self
            .first_text(&document, &self.selectors.article_number)
            .or_else(|| product_ld.as_ref().and_then(|p| ld_string(p, &["sku", "mpn", "productID"])))
            .map(|v| Scored::new(v, 1.0))
            .or_else(|| {
                self.body_text(&document)
                    .and_then(|text| ARTICLE_LABEL.captures(&text).map(|c| c[1].to_string()))
                    .map(|v| Scored::new(v, self.fuzzy_confidence))
            });

        result.product_name = self
            .first_text(&document, &self.selectors.product_name)
            .or_else(|| product_ld.as_ref().and_then(|p| ld_string(p, &["name"])))
            .map(|v| Scored::new(v, 1.0))
            .or_else(|| {
                self.title_text(&document)
                    .map(|v| Scored::new(v, self.fuzzy_confidence))
            });

        result.description = self
            .first_text(&document, &self.selectors.description)
            .or_else(|| product_ld.as_ref().and_then(|p| ld_string(p, &["description"])))
            .map(|v| Scored::new(v, 1.0));

        self.extract_price(&document, product_ld.as_ref(), &mut result);
        self.extract_tiers(&document, &mut result);

        result.image_ref = self
            .first_image(&document)
            .or_else(|| product_ld.as_ref().and_then(ld_image))
            .and_then(|src| resolve(page_url, &src))
            .map(|v| Scored::new(v, 1.0));

        if result.field_count() == 0 && result.price_note.is_none() {
            result.warnings.push("no product fields found in markup".to_string());
        }

        debug!("Markup extraction found {} field(s) on {}", result.field_count(), page_url);
        Some(result)
    }

    fn extract_price(&self, document: &Html, product_ld: Option<&Value>, result: &mut ExtractionResult) {
        for selector in &self.selectors.price {
            for element in document.select(selector) {
                let raw = element_value(element);
                if raw.is_empty() {
                    continue;
                }
                if let Some(note) = price::price_note(&raw, &self.on_request_markers) {
                    result.price_note = Some(note.to_string());
                    continue;
                }
                // Labels like "ab 1 Stück" carry numbers that are not the price
                if let Some(value) = find_price(&raw).or_else(|| parse_price(&raw)) {
                    result.price = Some(Scored::new(value, 1.0));
                    return;
                }
            }
        }

        if let Some(value) = product_ld.and_then(ld_price) {
            result.price = Some(Scored::new(value, 1.0));
            return;
        }

        let Some(text) = self.body_text(document) else { return };
        if result.price_note.is_none() {
            if let Some(note) = price::price_note(&text, &self.on_request_markers) {
                result.price_note = Some(note.to_string());
                return;
            }
        }
        if result.price_note.is_none() {
            if let Some(value) = find_price(&text) {
                result.price = Some(Scored::new(value, self.fuzzy_confidence));
            }
        }
    }

    fn extract_tiers(&self, document: &Html, result: &mut ExtractionResult) {
        for selector in &self.selectors.tiered_price_rows {
            let rows: Vec<String> = document
                .select(selector)
                .map(|row| {
                    let cells: Vec<String> = row.select(&self.cells).map(element_value).collect();
                    if cells.is_empty() {
                        element_value(row)
                    } else {
                        cells.join(" ")
                    }
                })
                .collect();
            if rows.is_empty() {
                continue;
            }

            let tiers = price::normalize_tiers(price::parse_tier_lines(rows.iter().map(String::as_str)));
            if !tiers.is_empty() {
                result.set_tiers(tiers, 1.0);
                return;
            }
        }
    }

    fn first_text(&self, document: &Html, selectors: &[Selector]) -> Option<String> {
        selectors
            .iter()
            .flat_map(|sel| document.select(sel))
            .map(element_value)
            .find(|v| !v.is_empty())
    }

    fn first_image(&self, document: &Html) -> Option<String> {
        self.selectors
            .image
            .iter()
            .flat_map(|sel| document.select(sel))
            .find_map(|el| {
                let el = el.value();
                ["src", "data-src", "content", "href"]
                    .iter()
                    .find_map(|attr| el.attr(attr))
                    .map(str::trim)
                    .filter(|v| !v.is_empty() && !v.starts_with("data:"))
                    .map(str::to_string)
            })
    }

    fn title_text(&self, document: &Html) -> Option<String> {
        let title = document.select(&self.title).next().map(element_value)?;
        // "Spritze 5 ml | Shopname"
        let name = title.split(" | ").next().unwrap_or(&title).trim().to_string();
        (!name.is_empty()).then_some(name)
    }

    fn body_text(&self, document: &Html) -> Option<String> {
        document.select(&self.body).next().map(element_value)
    }

    fn json_ld_product(&self, document: &Html) -> Option<Value> {
        document
            .select(&self.json_ld)
            .filter_map(|script| {
                let raw = script.text().collect::<String>();
                match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!("Skipping unparsable JSON-LD block: {}", e);
                        None
                    }
                }
            })
            .find_map(find_product)
    }
}

/// Text content, or the `content` attribute for `<meta>`-like elements
fn element_value(element: ElementRef) -> String {
    if let Some(content) = element.value().attr("content") {
        return normalize_space(content);
    }
    normalize_space(&element.text().collect::<Vec<_>>().join(" "))
}

fn normalize_space(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_product(value: Value) -> Option<Value> {
    match value {
        Value::Array(items) => items.into_iter().find_map(find_product),
        Value::Object(ref map) => {
            let is_product = match map.get("@type") {
                Some(Value::String(t)) => t == "Product",
                Some(Value::Array(types)) => types.iter().any(|t| t == "Product"),
                _ => false,
            };
            if is_product {
                return Some(value);
            }
            map.get("@graph").cloned().and_then(find_product)
        }
        _ => None,
    }
}

fn ld_string(product: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| product.get(*key))
        .find_map(|v| match v {
            Value::String(s) => Some(normalize_space(s)),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
}

fn ld_price(product: &Value) -> Option<f64> {
    let offers = product.get("offers")?;
    let offer = match offers {
        Value::Array(items) => items.first()?,
        other => other,
    };

    ["price", "lowPrice"]
        .iter()
        .filter_map(|key| offer.get(*key))
        .find_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_price(s),
            _ => None,
        })
}

fn ld_image(product: &Value) -> Option<String> {
    match product.get("image")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|i| match i {
            Value::String(s) => Some(s.clone()),
            other => other.get("url").and_then(Value::as_str).map(str::to_string),
        }),
        other => other.get("url").and_then(Value::as_str).map(str::to_string),
    }
}

fn resolve(page_url: &str, src: &str) -> Option<String> {
    match Url::parse(page_url).and_then(|base| base.join(src)) {
        Ok(url) => Some(url.to_string()),
        Err(_) => Url::parse(src).ok().map(|u| u.to_string()),
    }
}

fn fixed(selector: &str) -> Selector {
    match Selector::parse(selector) {
        Ok(sel) => sel,
        Err(_) => unreachable!("hardcoded selector '{}' is valid", selector),
    }
}

fn compile_all(selectors: &[String]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(sel) => Some(sel),
            Err(e) => {
                warn!("Invalid extraction selector '{}': {:?}", s, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::TieredPrice;

    const URL: &str = "https://shop.example/p/spritze-5ml";

    fn extractor() -> MarkupExtractor {
        MarkupExtractor::new(&ExtractionSettings::default())
    }

    #[test]
    fn test_empty_markup_yields_nothing() {
        assert!(extractor().extract("", URL).is_none());
        assert!(extractor().extract("   \n", URL).is_none());
    }

    #[test]
    fn test_structural_fields() {
        let html = r#"
            <html><body><div class="product-detail">
                <h1 itemprop="name">Einmalspritze  5 ml</h1>
                <span class="product-detail-ordernumber">10-4711</span>
                <div itemprop="description">Luer-Ansatz, steril</div>
                <meta itemprop="price" content="49.99">
                <img itemprop="image" src="/media/spritze.png">
                <table class="product-block-prices">
                    <tr><td>ab 1 Stück</td><td>49,99 €</td></tr>
                    <tr><td>ab 10 Stück</td><td>45,00 €</td></tr>
                </table>
            </div></body></html>"#;

        let result = extractor().extract(html, URL).unwrap();

        assert_eq!(result.source, Source::Markup);
        assert_eq!(result.article_number, Some(Scored::new("10-4711".to_string(), 1.0)));
        assert_eq!(result.product_name.unwrap().value, "Einmalspritze 5 ml");
        assert_eq!(result.price, Some(Scored::new(49.99, 1.0)));
        assert_eq!(result.image_ref.unwrap().value, "https://shop.example/media/spritze.png");
        assert_eq!(
            result.tiered_prices.unwrap().value,
            vec![
                TieredPrice { quantity: Some(1), price: 49.99 },
                TieredPrice { quantity: Some(10), price: 45.0 },
            ]
        );
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_price_text_with_quantity_label() {
        let html = r#"
            <html><body>
                <h1 itemprop="name">Tupfer</h1>
                <div class="product-detail-price">ab 1 Stück 49,99 €</div>
            </body></html>"#;

        let result = extractor().extract(html, URL).unwrap();
        assert_eq!(result.price, Some(Scored::new(49.99, 1.0)));
    }

    #[test]
    fn test_plain_price_without_cents() {
        let html = r#"<html><body><span itemprop="price">12</span></body></html>"#;

        let result = extractor().extract(html, URL).unwrap();
        assert_eq!(result.price, Some(Scored::new(12.0, 1.0)));
    }

    #[test]
    fn test_json_ld_fallback() {
        let html = r#"
            <html><head>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@graph":[
                {"@type":"BreadcrumbList"},
                {"@type":"Product","sku":"K-200","name":"Kanüle 0,8 mm",
                 "image":["https://cdn.example/k200.jpg"],
                 "offers":{"@type":"Offer","price":"12.40","priceCurrency":"EUR"}}
            ]}
            </script></head><body><p>Kanüle</p></body></html>"#;

        let result = extractor().extract(html, URL).unwrap();

        assert_eq!(result.article_number.unwrap().value, "K-200");
        assert_eq!(result.product_name.unwrap().value, "Kanüle 0,8 mm");
        assert_eq!(result.price.unwrap().value, 12.40);
        assert_eq!(result.image_ref.unwrap().value, "https://cdn.example/k200.jpg");
    }

    #[test]
    fn test_fuzzy_matches_score_lower() {
        let html = r#"
            <html><head><title>Tupfer steril | Beispiel-Shop</title></head>
            <body><p>Art.-Nr.: TS-900</p><p>Nur 3,95 € pro Packung</p></body></html>"#;

        let result = extractor().extract(html, URL).unwrap();

        let article = result.article_number.unwrap();
        assert_eq!(article.value, "TS-900");
        assert_eq!(article.confidence, 0.6);
        assert_eq!(result.product_name.unwrap().value, "Tupfer steril");
        assert_eq!(result.price, Some(Scored::new(3.95, 0.6)));
    }

    #[test]
    fn test_price_on_request() {
        let html = r#"
            <div class="product-detail">
                <h1 itemprop="name">Großgerät</h1>
                <span itemprop="sku">GG-1</span>
                <div class="product-detail-price">Preis auf Anfrage</div>
            </div>"#;

        let result = extractor().extract(html, URL).unwrap();

        assert_eq!(result.price, None);
        assert_eq!(result.price_note.as_deref(), Some("Auf Anfrage"));
    }

    #[test]
    fn test_page_without_fields_warns() {
        let result = extractor().extract("<html><body><nav>Menü</nav></body></html>", URL).unwrap();
        assert_eq!(result.field_count(), 0);
        assert_eq!(result.warnings.len(), 1);
    }
}
