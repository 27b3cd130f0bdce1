use scraper::{ElementRef, Html, Selector};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::browser::navigation::{NavigationController, NavigationError, PageHandle};
use crate::cli::config::{CrawlerSettings, VariantPolicy};
use crate::variants::policy::{self, Cartesian, EnumerationPolicy, IndependentAxes};
use crate::variants::{OptionHandle, PageState, SelectorKind, VariantGroup, VariantOption};

/// Attributes that carry a per-option article number
const ARTICLE_HINT_ATTRS: &[&str] = &["data-article-number", "data-sku", "data-ordernumber"];

/// Finds variant controls on a product page and plans the states to visit
pub struct VariantDetector {
    scopes: Vec<Selector>,
    button_group_selectors: Vec<(String, Selector)>,
    policy: Box<dyn EnumerationPolicy>,
    max_states: usize,
}

impl VariantDetector {
    pub fn new(settings: &CrawlerSettings) -> Self {
        let policy: Box<dyn EnumerationPolicy> = match settings.variant_policy {
            VariantPolicy::Independent => Box::new(IndependentAxes),
            VariantPolicy::Cartesian => Box::new(Cartesian {
                max_states: settings.max_variant_states,
            }),
        };

        Self {
            scopes: compile_all(&settings.variant_scope_selectors),
            button_group_selectors: settings
                .button_group_selectors
                .iter()
                .filter_map(|s| compile(s).map(|sel| (s.clone(), sel)))
                .collect(),
            policy,
            max_states: settings.max_variant_states,
        }
    }

    /// Detect variant groups on the page currently loaded in `page`
    pub async fn detect(
        &self,
        navigation: &NavigationController,
        page: &PageHandle,
    ) -> Result<Vec<VariantGroup>, NavigationError> {
        let html = navigation.extract_markup(page).await?;
        let groups = self.detect_in_markup(&html);
        debug!("Detected {} variant group(s) on {}", groups.len(), page.url());
        Ok(groups)
    }

    /// Page states to visit for `groups`, base state first
    pub fn enumerate(&self, groups: &[VariantGroup]) -> Vec<PageState> {
        policy::enumerate(self.policy.as_ref(), groups, self.max_states)
    }

    /// Detect variant groups in raw markup.
    ///
    /// Radio sets are grouped by input name, dropdowns by the select itself and
    /// button bars by their container. Groups offering fewer than two distinct
    /// options are dropped.
    pub fn detect_in_markup(&self, html: &str) -> Vec<VariantGroup> {
        let document = Html::parse_document(html);

        let scopes: Vec<ElementRef> = self
            .scopes
            .iter()
            .flat_map(|sel| document.select(sel))
            .collect();
        let scopes = if scopes.is_empty() {
            vec![document.root_element()]
        } else {
            outermost(scopes)
        };

        let mut groups = Vec::new();
        for scope in &scopes {
            groups.extend(radio_groups(&document, *scope));
            groups.extend(dropdown_groups(*scope));
            groups.extend(self.button_groups(*scope));
        }

        let mut seen_keys = HashSet::new();
        groups
            .into_iter()
            .map(dedup_labels)
            .filter(|g| {
                if g.options.len() < 2 {
                    debug!("Ignoring variant group '{}' with {} option(s)", g.key, g.options.len());
                    return false;
                }
                seen_keys.insert(g.key.clone())
            })
            .collect()
    }

    fn button_groups(&self, scope: ElementRef) -> Vec<VariantGroup> {
        let option_sel = match Selector::parse(
            "button, [role='radio'], [role='option'], [data-variant-option], a[data-value]",
        ) {
            Ok(sel) => sel,
            Err(_) => return vec![],
        };

        let mut groups = Vec::new();
        let mut seen = HashSet::new();

        for (raw_selector, selector) in &self.button_group_selectors {
            let containers: Vec<ElementRef> = scope.select(selector).collect();
            for (index, container) in containers.iter().enumerate() {
                if !seen.insert(container.id()) {
                    continue;
                }

                let el = container.value();
                let (key, container_css) = if let Some(id) = el.id() {
                    (id.to_string(), attr_selector("", "id", id))
                } else if let Some(name) = el.attr("data-variant-group") {
                    (name.to_string(), attr_selector("", "data-variant-group", name))
                } else if containers.len() == 1 {
                    (format!("buttons-{}", raw_selector), raw_selector.clone())
                } else {
                    debug!("Skipping unaddressable button group #{} for '{}'", index, raw_selector);
                    continue;
                };

                let options = container
                    .select(&option_sel)
                    .filter(|b| !is_disabled(b))
                    .filter_map(|b| {
                        let handle_css = if let Some(id) = b.value().id() {
                            attr_selector("", "id", id)
                        } else if let Some(value) = b.value().attr("data-value") {
                            format!("{} {}", container_css, attr_selector("", "data-value", value))
                        } else if let Some(title) = b.value().attr("title") {
                            format!("{} {}", container_css, attr_selector("", "title", title))
                        } else {
                            return None;
                        };

                        let label = element_label(b)?;
                        Some(VariantOption {
                            label,
                            handle: OptionHandle {
                                kind: SelectorKind::Button,
                                selector: handle_css,
                                value: None,
                            },
                            article_hint: article_hint(&b),
                            is_default: is_pressed(&b),
                        })
                    })
                    .collect();

                groups.push(VariantGroup {
                    key,
                    kind: SelectorKind::Button,
                    options,
                });
            }
        }

        groups
    }
}

fn radio_groups(document: &Html, scope: ElementRef) -> Vec<VariantGroup> {
    let Some(radio_sel) = compile("input[type='radio'][name]") else {
        return vec![];
    };

    // Document order of first appearance decides group order
    let mut order = Vec::new();
    let mut by_name: BTreeMap<String, Vec<VariantOption>> = BTreeMap::new();

    for input in scope.select(&radio_sel) {
        if is_disabled(&input) {
            continue;
        }
        let el = input.value();
        let Some(name) = el.attr("name") else { continue };

        let selector = if let Some(value) = el.attr("value") {
            format!(
                "{}{}",
                attr_selector("input", "name", name),
                attr_selector("", "value", value)
            )
        } else if let Some(id) = el.id() {
            attr_selector("input", "id", id)
        } else {
            continue;
        };

        let label = radio_label(document, input)
            .or_else(|| el.attr("value").map(normalize_text))
            .filter(|l| !l.is_empty());
        let Some(label) = label else { continue };

        if !by_name.contains_key(name) {
            order.push(name.to_string());
        }
        by_name.entry(name.to_string()).or_default().push(VariantOption {
            label,
            handle: OptionHandle {
                kind: SelectorKind::Radio,
                selector,
                value: None,
            },
            article_hint: article_hint(&input),
            is_default: el.attr("checked").is_some(),
        });
    }

    order
        .into_iter()
        .filter_map(|name| {
            let options = by_name.remove(&name)?;
            Some(VariantGroup {
                key: name,
                kind: SelectorKind::Radio,
                options,
            })
        })
        .collect()
}

fn dropdown_groups(scope: ElementRef) -> Vec<VariantGroup> {
    let (Some(select_sel), Some(option_sel)) = (compile("select"), compile("option")) else {
        return vec![];
    };

    scope
        .select(&select_sel)
        .filter(|s| s.value().attr("multiple").is_none() && !is_disabled(s))
        .filter_map(|select| {
            let el = select.value();
            let (key, selector) = if let Some(name) = el.attr("name") {
                (name.to_string(), attr_selector("select", "name", name))
            } else if let Some(id) = el.id() {
                (id.to_string(), attr_selector("select", "id", id))
            } else {
                return None;
            };

            let options = select
                .select(&option_sel)
                .filter(|o| !is_disabled(o))
                .filter_map(|option| {
                    let value = option.value().attr("value")?.trim();
                    // Placeholder entries like "Bitte wählen"
                    if value.is_empty() {
                        return None;
                    }
                    let label = element_label(option).unwrap_or_else(|| value.to_string());
                    Some(VariantOption {
                        label,
                        handle: OptionHandle {
                            kind: SelectorKind::Dropdown,
                            selector: selector.clone(),
                            value: Some(value.to_string()),
                        },
                        article_hint: article_hint(&option),
                        is_default: option.value().attr("selected").is_some(),
                    })
                })
                .collect();

            Some(VariantGroup {
                key,
                kind: SelectorKind::Dropdown,
                options,
            })
        })
        .collect()
}

fn radio_label(document: &Html, input: ElementRef) -> Option<String> {
    if let Some(id) = input.value().id() {
        if let Some(sel) = compile(&attr_selector("label", "for", id)) {
            if let Some(label) = document.select(&sel).next().and_then(element_label) {
                return Some(label);
            }
        }
    }

    // <label><input type="radio"> 10 ml</label>
    let parent = input.parent().and_then(ElementRef::wrap)?;
    if parent.value().name() == "label" {
        return element_label(parent);
    }

    input
        .value()
        .attr("aria-label")
        .or_else(|| input.value().attr("data-label"))
        .map(normalize_text)
}

/// Visible text of an element, falling back to its descriptive attributes
fn element_label(element: ElementRef) -> Option<String> {
    let text = normalize_text(&element.text().collect::<Vec<_>>().join(" "));
    if !text.is_empty() {
        return Some(text);
    }

    ["aria-label", "data-label", "title"]
        .iter()
        .find_map(|attr| element.value().attr(attr))
        .map(normalize_text)
        .filter(|l| !l.is_empty())
}

fn article_hint(element: &ElementRef) -> Option<String> {
    ARTICLE_HINT_ATTRS
        .iter()
        .find_map(|attr| element.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_disabled(element: &ElementRef) -> bool {
    let el = element.value();
    el.attr("disabled").is_some() || el.attr("aria-disabled") == Some("true")
}

fn is_pressed(element: &ElementRef) -> bool {
    let el = element.value();
    el.attr("aria-pressed") == Some("true")
        || el.attr("aria-checked") == Some("true")
        || el.attr("aria-selected") == Some("true")
        || el.classes().any(|c| matches!(c, "active" | "is-active" | "selected" | "is-selected"))
}

/// Keep the first option for each label; labels are the state key
fn dedup_labels(mut group: VariantGroup) -> VariantGroup {
    let mut seen = HashSet::new();
    group.options.retain(|o| seen.insert(o.label.clone()));
    group
}

/// Drop scopes nested inside another matched scope
fn outermost(scopes: Vec<ElementRef>) -> Vec<ElementRef> {
    let ids: HashSet<_> = scopes.iter().map(|s| s.id()).collect();
    let mut seen = HashSet::new();
    scopes
        .into_iter()
        .filter(|s| !s.ancestors().any(|a| ids.contains(&a.id())))
        .filter(|s| seen.insert(s.id()))
        .collect()
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `tag[attr="value"]` with the value escaped for a CSS string
pub(crate) fn attr_selector(tag: &str, attr: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("{}[{}=\"{}\"]", tag, attr, escaped)
}

pub(crate) fn compile(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(e) => {
            warn!("Invalid CSS selector '{}': {:?}", selector, e);
            None
        }
    }
}

pub(crate) fn compile_all(selectors: &[String]) -> Vec<Selector> {
    selectors.iter().filter_map(|s| compile(s)).collect()
}
