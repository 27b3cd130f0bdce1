pub mod detector;
pub mod policy;

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export common types
pub use detector::VariantDetector;
pub use policy::{enumerate, Cartesian, EnumerationPolicy, IndependentAxes};

/// Control shape behind a variant group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    Radio,
    Dropdown,
    Button,
}

impl SelectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorKind::Radio => "radio",
            SelectorKind::Dropdown => "dropdown",
            SelectorKind::Button => "button",
        }
    }
}

/// How to reach an option again on a freshly loaded page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptionHandle {
    pub kind: SelectorKind,
    /// CSS selector of the control to click, or of the `<select>` for dropdowns
    pub selector: String,
    /// Option value to choose in a dropdown
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantOption {
    pub label: String,
    pub handle: OptionHandle,
    /// Article number the markup attaches to this option, if any
    pub article_hint: Option<String>,
    /// Selected when the page loads
    pub is_default: bool,
}

/// Mutually exclusive options forming one configuration axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantGroup {
    /// Exclusivity scope, e.g. the shared input name
    pub key: String,
    pub kind: SelectorKind,
    pub options: Vec<VariantOption>,
}

impl VariantGroup {
    /// Index of the option shown in the base state
    pub fn default_index(&self) -> usize {
        self.options.iter().position(|o| o.is_default).unwrap_or(0)
    }
}

/// One option to activate when replaying a page state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub group: String,
    pub label: String,
    pub handle: OptionHandle,
    pub article_hint: Option<String>,
}

/// A rendered configuration of a product page.
///
/// Equality and hashing use only the activation tuple, so the same
/// configuration is never processed twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageState {
    activations: Vec<Activation>,
}

impl PageState {
    pub fn base() -> Self {
        Self::default()
    }

    pub fn with_activations(activations: Vec<Activation>) -> Self {
        Self { activations }
    }

    pub fn is_base(&self) -> bool {
        self.activations.is_empty()
    }

    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    /// The activation tuple as (group, label) pairs
    pub fn key(&self) -> Vec<(&str, &str)> {
        self.activations
            .iter()
            .map(|a| (a.group.as_str(), a.label.as_str()))
            .collect()
    }

    /// Stable textual form of the key, used in file names and logs
    pub fn key_string(&self) -> String {
        self.to_string()
    }

    /// Article number the variant controls announce for this state
    pub fn article_hint(&self) -> Option<&str> {
        self.activations.iter().rev().find_map(|a| a.article_hint.as_deref())
    }
}

impl PartialEq for PageState {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PageState {}

impl std::hash::Hash for PageState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.activations.is_empty() {
            return write!(f, "base");
        }
        let parts: Vec<String> = self
            .activations
            .iter()
            .map(|a| format!("{}={}", a.group, a.label))
            .collect();
        write!(f, "{}", parts.join(";"))
    }
}
