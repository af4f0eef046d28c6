use estate_core::ScraperConfig;
use lazy_static::lazy_static;
use regex::Regex;
use scraper::Html;

use crate::{
    absolutize, element_text, parse_bathrooms, parse_floor, select_all_attrs, select_first_text,
    selector, text_or_none, AdapterError, CrawlTarget, RawCandidate,
};

const LISTING_BASE: &str = "https://www.tayara.tn/ads/c";

lazy_static! {
    static ref ITEM_ID: Regex = Regex::new(r"/item/([^/?#]+)").unwrap();
    static ref CARD_PRICE: Regex =
        Regex::new(r"(?i)\d[\d\s.,\u{a0}\u{202f}]*\s*(?:TND|DT)\b").unwrap();
}

pub(crate) fn crawl_plan(config: &ScraperConfig) -> Vec<CrawlTarget> {
    let mut target = CrawlTarget::all("immobilier");
    target.area_filter = config.governorates.clone();
    target.type_filter = config
        .property_types
        .iter()
        .map(|t| t.to_uppercase())
        .collect();
    vec![target]
}

pub(crate) fn page_urls(page: u32) -> Vec<String> {
    vec![
        format!("{LISTING_BASE}/Immobilier?page={page}"),
        format!("{LISTING_BASE}/immobilier?page={page}"),
    ]
}

pub(crate) fn extract_listing_page(
    document: &Html,
    page_url: &str,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let card_sel = selector(r#"article, [data-testid*="ad"], [class*="listing"]"#)?;
    let link_sel = selector(r#"a[href*="/item/"]"#)?;
    let title_sel = selector(r#"h2, h3, h4, [class*="title"]"#)?;
    let location_sel = selector(r#"[class*="location"], [class*="address"]"#)?;
    let img_sel = selector("img")?;

    let mut out = Vec::new();
    for card in document.select(&card_sel) {
        let Some(link) = card.select(&link_sel).next() else {
            continue;
        };
        let Some(href) = link
            .value()
            .attr("href")
            .and_then(|h| absolutize(page_url, h))
        else {
            continue;
        };
        let href = href.split('?').next().unwrap_or_default().to_string();
        let Some(listing_id) = ITEM_ID
            .captures(&href)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };

        let title = select_first_text(card, &title_sel).or_else(|| element_text(link));
        let Some(title) = title else {
            continue;
        };

        let card_text = element_text(card).unwrap_or_default();
        let price_text = CARD_PRICE
            .find(&card_text)
            .map(|m| m.as_str().to_string());
        let location_text = select_first_text(card, &location_sel);
        let images = select_all_attrs(card, &img_sel, &["src", "data-src"])
            .into_iter()
            .filter_map(|src| absolutize(page_url, &src))
            .collect();

        out.push(RawCandidate {
            href,
            listing_id,
            title: Some(title),
            price_text,
            size_text: Some(card_text),
            location_text,
            images,
            ..RawCandidate::default()
        });
    }
    Ok(out)
}

pub(crate) fn extract_detail(document: &Html, page_url: &str) -> Result<RawCandidate, AdapterError> {
    let description_sel = selector(r#"[class*="description"], [data-testid*="description"]"#)?;
    let meta_sel = selector(r#"meta[name="description"]"#)?;
    let phone_sel = selector(r#"a[href^="tel:"]"#)?;
    let body_sel = selector("body")?;
    let img_sel = selector("img")?;

    let description = crate::select_document_text(document, &description_sel).or_else(|| {
        document
            .select(&meta_sel)
            .find_map(|m| m.value().attr("content"))
            .and_then(|c| text_or_none(c.to_string()))
    });
    let contact_phone = document
        .select(&phone_sel)
        .find_map(|a| a.value().attr("href"))
        .and_then(|h| text_or_none(h.trim_start_matches("tel:").to_string()));
    let body_text = crate::select_document_text(document, &body_sel).unwrap_or_default();
    let images = document
        .select(&img_sel)
        .filter_map(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
        .filter_map(|src| absolutize(page_url, src))
        .collect();

    Ok(RawCandidate {
        href: page_url.to_string(),
        description,
        bathrooms: parse_bathrooms(&body_text),
        floor: parse_floor(&body_text),
        contact_phone,
        images,
        ..RawCandidate::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extractor_for, Extractor};
    use chrono::Utc;
    use estate_core::SourceId;

    const LISTING_HTML: &str = r#"
        <html><body>
          <article>
            <a href="/item/65f1a2b3c4/appartement-s3-la-marsa/?utm=feed">
              <img src="https://www.tayara.tn/mediaGateway/resize-image?img=a1.jpg" />
              <img src="https://www.tayara.tn/logo.png" />
              <h2>Appartement S+3 120 m² La Marsa</h2>
            </a>
            <span class="price">350 000 DT</span>
            <span class="location">La Marsa, Tunis</span>
          </article>
          <article>
            <a href="/item/65f1a2b3c4/appartement-s3-la-marsa/">duplicate link</a>
          </article>
          <article><a href="/help">Aide</a></article>
        </body></html>
    "#;

    fn extractor() -> Extractor {
        extractor_for(SourceId::Tayara)
    }

    #[test]
    fn page_urls_try_capitalized_category_first() {
        let urls = extractor().page_urls(&CrawlTarget::all("immobilier"), 2);
        assert_eq!(urls[0], "https://www.tayara.tn/ads/c/Immobilier?page=2");
        assert_eq!(urls[1], "https://www.tayara.tn/ads/c/immobilier?page=2");
    }

    #[test]
    fn listing_cards_become_candidates() {
        let page = "https://www.tayara.tn/ads/c/Immobilier?page=1";
        let candidates = extractor()
            .extract_listing_page(LISTING_HTML, page)
            .expect("extract");
        assert_eq!(candidates.len(), 1);

        let first = &candidates[0];
        assert_eq!(
            first.href,
            "https://www.tayara.tn/item/65f1a2b3c4/appartement-s3-la-marsa/"
        );
        assert_eq!(first.listing_id, "65f1a2b3c4");
        assert_eq!(first.price_text.as_deref(), Some("350 000 DT"));

        let target = CrawlTarget::all("immobilier");
        let listing = extractor().build_listing(first, &target, Utc::now());
        assert_eq!(listing.price, Some(350_000.0));
        assert_eq!(listing.bedrooms, Some(3));
        assert_eq!(listing.size, Some(120.0));
        assert_eq!(listing.governorate.as_deref(), Some("Tunis"));
        assert_eq!(listing.delegation.as_deref(), Some("La Marsa"));
        assert_eq!(listing.property_type.as_deref(), Some("APARTMENT"));
        assert_eq!(listing.transaction_type.as_deref(), Some("SALE"));
        assert_eq!(listing.images.len(), 1);
        assert_eq!(listing.source_website, "tayara.tn");
    }

    #[test]
    fn detail_page_adds_contact_and_rooms() {
        let html = r#"
            <html><head><meta name="description" content="Bel appartement avec ascenseur et parking"></head>
            <body><p>2 salles de bain, étage 4</p><a href="tel:+21698123456">Appeler</a></body></html>
        "#;
        let detail = extractor()
            .extract_detail(html, "https://www.tayara.tn/item/1/")
            .expect("detail");
        assert_eq!(
            detail.description.as_deref(),
            Some("Bel appartement avec ascenseur et parking")
        );
        assert_eq!(detail.contact_phone.as_deref(), Some("+21698123456"));
        assert_eq!(detail.bathrooms, Some(2));
        assert_eq!(detail.floor, Some(4));
    }
}
