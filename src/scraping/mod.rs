pub mod browser;
pub mod clean;
pub mod discover;
pub mod fetch;
pub mod robots;
pub mod sitemap;

pub use discover::{
    canonical_url, categorize_path, discover_links, registrable_domain, DiscoveredLink,
    DiscoveryConfig, DiscoveryReport, LinkCategory,
};
pub use fetch::{detect_site_signals, FetchedPage, FetcherConfig, PageFetcher, SiteSignals};
pub use robots::{RobotsCache, RobotsRules};
