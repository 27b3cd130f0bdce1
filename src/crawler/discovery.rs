use scraper::{Html, Selector};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::navigation::{NavigationController, NavigationError};
use crate::browser::pool::PoolError;
use crate::browser::session::BrowserSession;
use crate::cli::config::CrawlerSettings;
use crate::crawler::frontier::Frontier;
use crate::crawler::job::{DiscoveredUrl, UrlKind};
use crate::utils::retry::Backoff;
use crate::variants::detector::compile_all;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("entry point {url} unreachable: {source}")]
    EntryUnreachable {
        url: String,
        #[source]
        source: NavigationError,
    },

    /// The session broke down after some URLs were found
    #[error("discovery interrupted after {} URLs: {source}", .found.len())]
    Interrupted {
        found: Vec<DiscoveredUrl>,
        #[source]
        source: NavigationError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Links read from one listing page
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Listing {
    pub products: Vec<String>,
    pub next_pages: Vec<String>,
    pub categories: Vec<String>,
    /// The page is itself a product detail page
    pub is_product_page: bool,
}

/// Expands a category entry point into product URLs through pagination and sub-categories
pub struct CategoryDiscovery {
    product_links: Vec<Selector>,
    pagination: Vec<Selector>,
    category_links: Vec<Selector>,
    product_markers: Vec<Selector>,
    max_products: usize,
    max_pages: usize,
}

impl CategoryDiscovery {
    pub fn new(settings: &CrawlerSettings) -> Self {
        Self {
            product_links: compile_all(&settings.product_link_selectors),
            pagination: compile_all(&settings.pagination_selectors),
            category_links: compile_all(&settings.category_link_selectors),
            product_markers: compile_all(&settings.product_page_markers),
            max_products: settings.max_products as usize,
            max_pages: settings.max_category_pages.max(1) as usize,
        }
    }

    /// Links of a listing page, resolved against `page_url`
    pub fn parse_listing(&self, html: &str, page_url: &str) -> Listing {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();

        let links = |selectors: &[Selector]| -> Vec<String> {
            let mut found: Vec<String> = Vec::new();
            for selector in selectors {
                for element in document.select(selector) {
                    let Some(href) = element.value().attr("href") else {
                        continue;
                    };
                    let href = href.trim();
                    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
                        continue;
                    }
                    let resolved = match &base {
                        Some(base) => base.join(href).map(|u| u.to_string()).ok(),
                        None => Url::parse(href).map(|u| u.to_string()).ok(),
                    };
                    if let Some(url) = resolved {
                        if !found.contains(&url) {
                            found.push(url);
                        }
                    }
                }
            }
            found
        };

        Listing {
            products: links(&self.product_links),
            next_pages: links(&self.pagination),
            categories: links(&self.category_links),
            is_product_page: self
                .product_markers
                .iter()
                .any(|marker| document.select(marker).next().is_some()),
        }
    }

    /// Walk the category tree from `entry`.
    ///
    /// The entry page must load; later listing pages that fail to load are
    /// skipped. A page with no new product links and no pagination ends its branch.
    pub async fn discover(
        &self,
        navigation: &NavigationController,
        session: &Arc<dyn BrowserSession>,
        entry: &str,
        frontier: &mut Frontier,
        nav_timeout: Duration,
        backoff: &Backoff,
    ) -> Result<Vec<DiscoveredUrl>, DiscoveryError> {
        let entry = frontier.admit_explicit(entry).unwrap_or_else(|| entry.to_string());
        let mut pending = VecDeque::from([DiscoveredUrl {
            url: entry.clone(),
            kind: UrlKind::Category,
            parent: None,
            page_index: 0,
        }]);
        let mut found: Vec<DiscoveredUrl> = Vec::new();
        let mut pages = 0;
        let mut products = 0;

        while let Some(page_url) = pending.pop_front() {
            if products >= self.max_products {
                debug!("Product limit {} reached, stopping discovery", self.max_products);
                break;
            }
            if pages >= self.max_pages {
                debug!("Category page limit {} reached, stopping discovery", self.max_pages);
                break;
            }
            let is_entry = page_url.url == entry && page_url.parent.is_none();

            let loaded = match navigation.load_with_retry(session, &page_url.url, nav_timeout, backoff).await {
                Ok(page) => navigation.extract_markup(&page).await,
                Err(e) => Err(e),
            };
            let html = match loaded {
                Ok(html) => html,
                Err(source) if is_entry => {
                    return Err(DiscoveryError::EntryUnreachable {
                        url: page_url.url,
                        source,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Skipping category page {}: {}", page_url.url, e);
                    continue;
                }
                Err(source) => return Err(DiscoveryError::Interrupted { found, source }),
            };
            pages += 1;

            let listing = self.parse_listing(&html, &page_url.url);

            if is_entry && listing.products.is_empty() && listing.is_product_page {
                info!("Entry point {} is a product page", entry);
                found.push(DiscoveredUrl {
                    url: entry.clone(),
                    kind: UrlKind::Product,
                    parent: None,
                    page_index: 0,
                });
                products += 1;
                break;
            }

            let mut new_products = 0;
            for link in &listing.products {
                if products >= self.max_products {
                    break;
                }
                if let Some(url) = frontier.admit(link) {
                    found.push(DiscoveredUrl {
                        url,
                        kind: UrlKind::Product,
                        parent: Some(page_url.url.clone()),
                        page_index: page_url.page_index,
                    });
                    new_products += 1;
                    products += 1;
                }
            }
            debug!(
                "Category page {} (page {}) yielded {} new product links",
                page_url.url, page_url.page_index, new_products
            );

            if new_products == 0 && listing.next_pages.is_empty() {
                debug!("No new products and no pagination on {}, branch ends", page_url.url);
            }

            for next in &listing.next_pages {
                if let Some(url) = frontier.admit(next) {
                    pending.push_back(DiscoveredUrl {
                        url,
                        kind: UrlKind::Category,
                        parent: Some(page_url.url.clone()),
                        page_index: page_url.page_index + 1,
                    });
                }
            }
            for category in &listing.categories {
                if let Some(url) = frontier.admit(category) {
                    pending.push_back(DiscoveredUrl {
                        url,
                        kind: UrlKind::Category,
                        parent: Some(page_url.url.clone()),
                        page_index: 0,
                    });
                }
            }

            found.push(page_url);
        }

        info!(
            "Discovery from {} found {} product URLs on {} category pages",
            entry, products, pages
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{BrowserSettings, CaptureSettings, RetrySettings, StabilitySettings};
    use crate::testing::{FakePage, FakeSite};

    const CATEGORY: &str = "https://shop.example/c/spritzen";

    fn settings() -> CrawlerSettings {
        CrawlerSettings {
            allowed_domains: vec!["shop.example".to_string()],
            category_link_selectors: vec![".subcategories a".to_string()],
            ..CrawlerSettings::default()
        }
    }

    fn navigation() -> NavigationController {
        let browser = BrowserSettings {
            stability: StabilitySettings::FixedDelay { delay_ms: 10 },
            ..BrowserSettings::default()
        };
        NavigationController::new(&browser, &CaptureSettings::default(), &RetrySettings::default())
    }

    fn backoff() -> Backoff {
        Backoff::new(2, Duration::from_millis(10), Duration::from_millis(20))
    }

    fn listing_page(products: &[&str], next: Option<&str>) -> String {
        let mut html = String::from("<div class=\"listing\">");
        for product in products {
            html.push_str(&format!(
                "<div class=\"product-box\"><a class=\"product-name\" href=\"{}\">P</a></div>",
                product
            ));
        }
        if let Some(next) = next {
            html.push_str(&format!("<a rel=\"next\" href=\"{}\">weiter</a>", next));
        }
        html.push_str("</div>");
        html
    }

    fn product_urls(found: &[DiscoveredUrl]) -> Vec<&str> {
        found
            .iter()
            .filter(|d| d.kind == UrlKind::Product)
            .map(|d| d.url.as_str())
            .collect()
    }

    #[test]
    fn test_parse_listing_resolves_links() {
        let discovery = CategoryDiscovery::new(&settings());
        let html = r##"
            <div class="product-box"><a class="product-name" href="/p/spritze">Spritze</a></div>
            <div class="product-box"><a class="product-name" href="/p/spritze">Spritze</a></div>
            <div class="product-box"><a class="product-name" href="#">leer</a></div>
            <a rel="next" href="?p=2">2</a>
            <div class="subcategories"><a href="/c/kanuelen">Kanülen</a></div>"##;

        let listing = discovery.parse_listing(html, CATEGORY);

        assert_eq!(listing.products, vec!["https://shop.example/p/spritze"]);
        assert_eq!(listing.next_pages, vec!["https://shop.example/c/spritzen?p=2"]);
        assert_eq!(listing.categories, vec!["https://shop.example/c/kanuelen"]);
        assert!(!listing.is_product_page);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_pagination_until_exhausted() {
        let site = FakeSite::new();
        site.add_page(CATEGORY, FakePage::new(listing_page(&["/p/1", "/p/2"], Some("?p=2"))));
        site.add_page(
            "https://shop.example/c/spritzen?p=2",
            // Page 2 repeats a product and has no further page
            FakePage::new(listing_page(&["/p/2", "/p/3"], None)),
        );

        let discovery = CategoryDiscovery::new(&settings());
        let mut frontier = Frontier::new(&settings());
        let nav = navigation();
        let found = discovery
            .discover(&nav, &site.session(), CATEGORY, &mut frontier, Duration::from_secs(5), &backoff())
            .await
            .unwrap();

        assert_eq!(
            product_urls(&found),
            vec!["https://shop.example/p/1", "https://shop.example/p/2", "https://shop.example/p/3"]
        );
        let third = found.iter().find(|d| d.url.ends_with("/p/3")).unwrap();
        assert_eq!(third.page_index, 1);
        assert_eq!(third.parent.as_deref(), Some("https://shop.example/c/spritzen?p=2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_product_limit() {
        let site = FakeSite::new();
        site.add_page(CATEGORY, FakePage::new(listing_page(&["/p/1", "/p/2", "/p/3"], Some("?p=2"))));

        let settings = CrawlerSettings {
            max_products: 2,
            ..settings()
        };
        let discovery = CategoryDiscovery::new(&settings);
        let mut frontier = Frontier::new(&settings);
        let nav = navigation();
        let found = discovery
            .discover(&nav, &site.session(), CATEGORY, &mut frontier, Duration::from_secs(5), &backoff())
            .await
            .unwrap();

        assert_eq!(product_urls(&found).len(), 2);
        // The limit was hit before page 2 was loaded
        assert_eq!(site.visits(), vec![CATEGORY.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_subcategory_is_skipped() {
        let site = FakeSite::new();
        site.add_page(
            CATEGORY,
            FakePage::new(format!(
                "{}<div class=\"subcategories\"><a href=\"/c/missing\">x</a></div>",
                listing_page(&["/p/1"], None)
            )),
        );

        let discovery = CategoryDiscovery::new(&settings());
        let mut frontier = Frontier::new(&settings());
        let nav = navigation();
        let found = discovery
            .discover(&nav, &site.session(), CATEGORY, &mut frontier, Duration::from_secs(5), &backoff())
            .await
            .unwrap();

        assert_eq!(product_urls(&found), vec!["https://shop.example/p/1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_entry_is_fatal() {
        let site = FakeSite::new();
        let discovery = CategoryDiscovery::new(&settings());
        let mut frontier = Frontier::new(&settings());
        let nav = navigation();

        let err = discovery
            .discover(&nav, &site.session(), CATEGORY, &mut frontier, Duration::from_secs(5), &backoff())
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::EntryUnreachable { .. }));
        assert_eq!(site.visits().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_product_entry_point() {
        let site = FakeSite::new();
        site.add_page(CATEGORY, FakePage::new("<div class=\"product-detail\"><h1>Spritze</h1></div>"));

        let discovery = CategoryDiscovery::new(&settings());
        let mut frontier = Frontier::new(&settings());
        let nav = navigation();
        let found = discovery
            .discover(&nav, &site.session(), CATEGORY, &mut frontier, Duration::from_secs(5), &backoff())
            .await
            .unwrap();

        assert_eq!(product_urls(&found), vec![CATEGORY]);
    }
}
