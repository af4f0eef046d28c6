use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use estate_adapters::SourceScraper;
use estate_core::{ScrapedListing, ScraperConfig, SourceId};
use estate_storage::{BronzeStore, Browser, BrowserOptions, FetchError, LoadedPage, PageLoader};
use tempfile::tempdir;

const TA_LIST: &str = "http://www.tunisie-annonce.com/AnnoncesImmobilier.asp";
const TA_DETAIL: &str = "http://www.tunisie-annonce.com/DetailsAnnonceImmobilier.asp";

#[derive(Default)]
struct FixtureBrowser {
    pages: HashMap<String, String>,
    fail_launch: bool,
    loads: Arc<AtomicUsize>,
}

impl FixtureBrowser {
    fn page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }
}

struct FixtureLoader {
    pages: HashMap<String, String>,
    loads: Arc<AtomicUsize>,
}

#[async_trait]
impl Browser for FixtureBrowser {
    async fn launch(&self, _options: &BrowserOptions) -> Result<Box<dyn PageLoader>, FetchError> {
        if self.fail_launch {
            return Err(FetchError::Launch("chrome binary not found".into()));
        }
        Ok(Box::new(FixtureLoader {
            pages: self.pages.clone(),
            loads: Arc::clone(&self.loads),
        }))
    }
}

#[async_trait]
impl PageLoader for FixtureLoader {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.pages.get(url) {
            Some(html) => Ok(LoadedPage {
                url: url.to_string(),
                status: 200,
                html: html.clone(),
            }),
            None => Err(FetchError::Browser(format!("navigation timeout for {url}"))),
        }
    }
}

fn ta_listing_page() -> String {
    r#"<html><body><table>
        <tr><td>Tunis</td><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450699">Vente villa avec jardin</a></td></tr>
        <tr><td>Sousse</td><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450702">Vente appartement S+2 Sahloul</a></td></tr>
        <tr><td>Nabeul</td><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450703">Vente appartement S+1 Hammamet</a></td></tr>
        <tr><td>Sfax</td><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450704">Vente maison Sfax ville</a></td></tr>
    </table></body></html>"#
        .to_string()
}

fn ta_detail(region: &str, price: Option<&str>, surface: &str) -> String {
    let price_row = price
        .map(|p| format!("<tr><td>Prix</td><td>:</td><td>{p}</td></tr>"))
        .unwrap_or_default();
    format!(
        r#"<html><body><table>
            <tr><td>Région</td><td>:</td><td>{region}</td></tr>
            <tr><td>Surface</td><td>:</td><td>{surface}</td></tr>
            {price_row}
        </table>
        <img src="/upload2/202310/photos/1.jpg"></body></html>"#
    )
}

fn detail_url(id: &str) -> String {
    format!("{TA_DETAIL}?cod_ann={id}")
}

fn config(source: SourceId, max_pages: u32) -> ScraperConfig {
    ScraperConfig::new(source)
        .with_max_pages(max_pages)
        .with_delays(0, 0)
}

#[tokio::test]
async fn run_writes_only_validated_listings_and_records_listing_errors() {
    let dir = tempdir().expect("tempdir");
    let browser = FixtureBrowser::default()
        .page(TA_LIST, &ta_listing_page())
        .page(
            &detail_url("3450699"),
            &ta_detail("Tunis &gt; La Marsa &gt; Gammarth", Some("980 000 Dinars"), "320"),
        )
        // no price on the detail page
        .page(&detail_url("3450702"), &ta_detail("Sousse &gt; Sahloul", None, "95"))
        // the listing id leaked into the surface column
        .page(
            &detail_url("3450703"),
            &ta_detail("Nabeul &gt; Hammamet", Some("210 000 DT"), "3450703"),
        )
        .page(
            &format!("{TA_LIST}?rech_page_num=2"),
            "<html><body><table></table></body></html>",
        );
    // 3450704 has no detail fixture: load fails
    let loads = Arc::clone(&browser.loads);

    let scraper = SourceScraper::new(Arc::new(browser), BronzeStore::new(dir.path()));
    let result = scraper.run(&config(SourceId::TunisieAnnonce, 5)).await;

    assert!(result.success);
    assert_eq!(result.properties_scraped, 1);
    assert_eq!(result.errors.len(), 2, "{:?}", result.errors);
    assert!(result.errors[0].contains("No price found for listing 3450702"));
    assert!(result.errors[1].contains("cod_ann=3450704"));
    // page 1, four details, empty page 2; page 3 never requested
    assert_eq!(loads.load(Ordering::SeqCst), 6);

    let path = result.file_path.expect("bronze file");
    assert!(path.contains("tunisie-annonce_"));
    let records: Vec<ScrapedListing> = BronzeStore::read_json(&path).await.expect("read bronze");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].listing_id, "3450699");
    assert_eq!(records[0].price, Some(980_000.0));
    assert_eq!(records[0].governorate.as_deref(), Some("Tunis"));
    assert_eq!(records[0].source_website, "tunisieannonce.com");
}

#[tokio::test]
async fn launch_failure_is_fatal_and_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let browser = FixtureBrowser {
        fail_launch: true,
        ..FixtureBrowser::default()
    };
    let bronze = BronzeStore::new(dir.path().join("bronze"));
    let scraper = SourceScraper::new(Arc::new(browser), bronze.clone());

    let result = scraper.run(&config(SourceId::Mubawab, 2)).await;

    assert!(!result.success);
    assert_eq!(result.properties_scraped, 0);
    assert_eq!(result.file_path, None);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("Fatal error: "));
    assert!(bronze.list_files().await.expect("list").is_empty());
}

#[tokio::test]
async fn unreachable_page_does_not_stop_later_pages() {
    let dir = tempdir().expect("tempdir");
    let page_two = r#"<html><body>
        <article>
          <a href="/item/abc123/"><h2>Appartement S+2 Ariana</h2></a>
          <span class="price">240 000 DT</span>
        </article>
    </body></html>"#;
    let browser = FixtureBrowser::default()
        .page("https://www.tayara.tn/ads/c/Immobilier?page=2", page_two)
        .page(
            "https://www.tayara.tn/item/abc123/",
            "<html><body><p>2 salles de bain</p></body></html>",
        );

    let scraper = SourceScraper::new(Arc::new(browser), BronzeStore::new(dir.path()));
    let result = scraper.run(&config(SourceId::Tayara, 2)).await;

    assert!(result.success);
    assert_eq!(result.properties_scraped, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("Error scraping immobilier page 1"));
}

#[tokio::test]
async fn empty_run_still_writes_an_empty_bronze_file() {
    let dir = tempdir().expect("tempdir");
    let browser = FixtureBrowser::default()
        .page("https://www.tayara.tn/ads/c/Immobilier?page=1", "<html></html>")
        .page("https://www.tayara.tn/ads/c/immobilier?page=1", "<html></html>");

    let scraper = SourceScraper::new(Arc::new(browser), BronzeStore::new(dir.path()));
    let result = scraper.run(&config(SourceId::Tayara, 3)).await;

    assert!(result.success);
    assert_eq!(result.properties_scraped, 0);
    assert!(result.errors.is_empty());
    let records: Vec<ScrapedListing> = BronzeStore::read_json(result.file_path.expect("path"))
        .await
        .expect("read");
    assert!(records.is_empty());
}

#[tokio::test]
async fn listing_repeated_across_pages_is_fetched_and_reported_once() {
    let dir = tempdir().expect("tempdir");
    let page_one = r#"<html><body><table>
        <tr><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450702">Vente appartement S+2 Sahloul</a></td></tr>
        <tr><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450703">Vente appartement S+1 Hammamet</a></td></tr>
    </table></body></html>"#;
    let page_two = r#"<html><body><table>
        <tr><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450702&rech_page_num=2">Vente appartement S+2 Sahloul</a></td></tr>
        <tr><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450703&rech_page_num=2">Vente appartement S+1 Hammamet</a></td></tr>
        <tr><td><a href="DetailsAnnonceImmobilier.asp?cod_ann=3450699&rech_page_num=2">Vente villa avec jardin</a></td></tr>
    </table></body></html>"#;
    let browser = FixtureBrowser::default()
        .page(TA_LIST, page_one)
        .page(&format!("{TA_LIST}?rech_page_num=2"), page_two)
        .page(
            &format!("{TA_LIST}?rech_page_num=3"),
            "<html><body><table></table></body></html>",
        )
        .page(&detail_url("3450702"), &ta_detail("Sousse &gt; Sahloul", None, "95"))
        .page(
            &detail_url("3450703"),
            &ta_detail("Nabeul &gt; Hammamet", Some("210 000 DT"), "3450703"),
        )
        .page(
            &detail_url("3450699"),
            &ta_detail("Tunis &gt; La Marsa &gt; Gammarth", Some("980 000 Dinars"), "320"),
        );
    let loads = Arc::clone(&browser.loads);

    let scraper = SourceScraper::new(Arc::new(browser), BronzeStore::new(dir.path()));
    let result = scraper.run(&config(SourceId::TunisieAnnonce, 5)).await;

    assert!(result.success);
    assert_eq!(result.properties_scraped, 1);
    assert_eq!(result.errors, vec!["No price found for listing 3450702".to_string()]);
    // three listing pages and one detail fetch per distinct listing
    assert_eq!(loads.load(Ordering::SeqCst), 6);
}
