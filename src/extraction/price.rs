//! Price parsing for German shop text.
//!
//! Handles `1.234,56 €`, `49,99`, `49.99 EUR` and quantity tables such as
//! `ab 10 Stück 4,50 €`, including several tiers read into one OCR line.

use regex::Regex;
use std::sync::LazyLock;

use crate::extraction::TieredPrice;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d[\d.,]*").expect("NUMBER: hardcoded regex is valid")
});

/// A price with cents, optionally followed by a currency marker
static PRICE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:\.\d{3})+,\d{2}|\d+[.,]\d{2})\s*(?:€|eur\b)?")
        .expect("PRICE_TOKEN: hardcoded regex is valid")
});

/// `ab 10 Stück 4,50 €`, `10 - 49 St. 4,20 €`, `100: 3,90 EUR`
static TIER_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:ab\s*)?\b(\d{1,6})(?:\s*[-–]\s*\d{1,6})?(?:\s*(?:stück|stk\.?|st\.?|x|pcs\.?))?(?:\s*[:=]\s*|\s+)(?:je\s*)?(\d{1,3}(?:\.\d{3})+,\d{2}|\d+[.,]\d{2})\s*(?:€|eur\b)",
    )
    .expect("TIER_PAIR: hardcoded regex is valid")
});

/// First amount in `text`, read with German or English separators
pub fn parse_price(text: &str) -> Option<f64> {
    let token = NUMBER.find(text)?.as_str();
    parse_amount(token)
}

/// Parse a bare amount like `1.234,56`, `49,99` or `12.5`
pub fn parse_amount(token: &str) -> Option<f64> {
    let cleaned: String = token
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    let cleaned = cleaned.trim_end_matches(['.', ',']);
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            // Whichever separator comes last is the decimal mark
            if comma > dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(_)) => {
            let parts: Vec<&str> = cleaned.split(',').collect();
            if parts.len() == 2 && parts[1].len() != 3 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) => {
            let parts: Vec<&str> = cleaned.split('.').collect();
            // German thousands separator, e.g. "1.234"
            if parts.len() > 2 || parts[1].len() == 3 {
                cleaned.replace('.', "")
            } else {
                cleaned.to_string()
            }
        }
        (None, None) => cleaned.to_string(),
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// First price with cents in `text`
pub fn find_price(text: &str) -> Option<f64> {
    PRICE_TOKEN
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_amount(m.as_str()))
}

/// Every quantity/price pair in `line`; merged table columns yield several
pub fn parse_tier_line(line: &str) -> Vec<TieredPrice> {
    TIER_PAIR
        .captures_iter(line)
        .filter_map(|c| {
            let quantity = c.get(1)?.as_str().parse::<u32>().ok()?;
            let price = parse_amount(c.get(2)?.as_str())?;
            Some(TieredPrice {
                quantity: Some(quantity),
                price,
            })
        })
        .collect()
}

/// Tiers from a list of lines; lines holding only a price become tiers of unknown quantity
pub fn parse_tier_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<TieredPrice> {
    let mut tiers = Vec::new();
    for line in lines {
        let pairs = parse_tier_line(line);
        if !pairs.is_empty() {
            tiers.extend(pairs);
            continue;
        }
        let prices: Vec<f64> = PRICE_TOKEN
            .captures_iter(line)
            .filter_map(|c| c.get(1).and_then(|m| parse_amount(m.as_str())))
            .collect();
        if prices.len() == 1 && line.trim().len() <= 16 {
            tiers.push(TieredPrice {
                quantity: None,
                price: prices[0],
            });
        }
    }
    tiers
}

/// Drop zero tiers, order by quantity and collapse neighbours with the same unit price.
///
/// Tiers of unknown quantity keep their reading order.
pub fn normalize_tiers(tiers: Vec<TieredPrice>) -> Vec<TieredPrice> {
    let mut tiers: Vec<TieredPrice> = tiers.into_iter().filter(|t| t.price > 0.0).collect();

    if tiers.iter().all(|t| t.quantity.is_some()) {
        tiers.sort_by_key(|t| t.quantity);
        tiers.dedup_by_key(|t| t.quantity);
    }

    let mut normalized: Vec<TieredPrice> = Vec::with_capacity(tiers.len());
    for tier in tiers {
        match normalized.last() {
            Some(previous) if (previous.price - tier.price).abs() < 0.005 => continue,
            _ => normalized.push(tier),
        }
    }
    normalized
}

/// The first marker found in `text`, compared case-insensitively
pub fn price_note<'a>(text: &str, markers: &'a [String]) -> Option<&'a str> {
    let lower = text.to_lowercase();
    markers
        .iter()
        .find(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_german_and_english_amounts() {
        assert_eq!(parse_price("49,99 €"), Some(49.99));
        assert_eq!(parse_price("EUR 49.99"), Some(49.99));
        assert_eq!(parse_price("1.234,56 €"), Some(1234.56));
        assert_eq!(parse_price("1,234.56"), Some(1234.56));
        assert_eq!(parse_price("Preis: 1.234 €"), Some(1234.0));
        assert_eq!(parse_price("12.5"), Some(12.5));
        assert_eq!(parse_price("ab 3,-"), Some(3.0));
        assert_eq!(parse_price("Auf Anfrage"), None);
    }

    #[test]
    fn test_tier_pairs_in_merged_columns() {
        let tiers = parse_tier_line("ab 10 Stück 4,50 € ab 50 Stück 4,20 € ab 100 Stk. 3,90 EUR");
        assert_eq!(
            tiers,
            vec![
                TieredPrice { quantity: Some(10), price: 4.5 },
                TieredPrice { quantity: Some(50), price: 4.2 },
                TieredPrice { quantity: Some(100), price: 3.9 },
            ]
        );
    }

    #[test]
    fn test_single_price_is_not_a_tier() {
        assert!(parse_tier_line("45,99 € inkl. MwSt").is_empty());
        assert!(parse_tier_line("1.234,56 €").is_empty());
        assert_eq!(
            parse_tier_line("100: 3,90 EUR"),
            vec![TieredPrice { quantity: Some(100), price: 3.9 }]
        );
    }

    #[test]
    fn test_price_only_lines_have_unknown_quantity() {
        let tiers = parse_tier_lines(["4,99 €", "Menge", "4,49 €"]);
        assert_eq!(tiers.len(), 2);
        assert!(tiers.iter().all(|t| t.quantity.is_none()));
        assert_eq!(tiers[1].price, 4.49);
    }

    #[test]
    fn test_normalize_tiers() {
        let tiers = normalize_tiers(vec![
            TieredPrice { quantity: Some(50), price: 4.2 },
            TieredPrice { quantity: Some(1), price: 4.5 },
            TieredPrice { quantity: Some(10), price: 4.5 },
            TieredPrice { quantity: Some(100), price: 0.0 },
        ]);
        assert_eq!(
            tiers,
            vec![
                TieredPrice { quantity: Some(1), price: 4.5 },
                TieredPrice { quantity: Some(50), price: 4.2 },
            ]
        );

        assert!(normalize_tiers(vec![TieredPrice { quantity: None, price: 0.0 }]).is_empty());
    }

    #[test]
    fn test_price_note_markers() {
        let markers = vec!["Auf Anfrage".to_string(), "Preis auf Anfrage".to_string()];
        assert_eq!(price_note("Preis: auf anfrage", &markers), Some("Auf Anfrage"));
        assert_eq!(price_note("49,99 €", &markers), None);
    }
}
