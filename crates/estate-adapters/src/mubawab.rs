use estate_core::ScraperConfig;
use scraper::Html;
use tracing::warn;

use crate::{
    absolutize, parse_bathrooms, parse_bedrooms, select_all_attrs, select_document_text,
    select_first_text, selector, AdapterError, CrawlTarget, RawCandidate,
};

const BASE: &str = "https://www.mubawab.tn/fr/ct";

const GOVERNORATE_SLUGS: [(&str, &str); 8] = [
    ("Tunis", "tunis"),
    ("Ariana", "ariana"),
    ("Ben Arous", "ben-arous"),
    ("Manouba", "manouba"),
    ("Sousse", "sousse"),
    ("Sfax", "sfax"),
    ("Nabeul", "nabeul"),
    ("Monastir", "monastir"),
];

const TYPE_SLUGS: [(&str, &str); 4] = [
    ("apartment", "ad"),
    ("villa", "vd"),
    ("house", "md"),
    ("land", "td"),
];

fn governorate_slug(name: &str) -> Option<&'static str> {
    GOVERNORATE_SLUGS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
        .map(|(_, slug)| *slug)
}

fn type_slug(name: &str) -> Option<&'static str> {
    TYPE_SLUGS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
        .map(|(_, slug)| *slug)
}

/// Governorates × property types; names without a site slug are skipped.
pub(crate) fn crawl_plan(config: &ScraperConfig) -> Vec<CrawlTarget> {
    let governorates = if config.governorates.is_empty() {
        vec!["Tunis".to_string()]
    } else {
        config.governorates.clone()
    };
    let property_types = if config.property_types.is_empty() {
        vec!["apartment".to_string()]
    } else {
        config.property_types.clone()
    };

    let mut plan = Vec::new();
    for governorate in &governorates {
        let Some(gov_slug) = governorate_slug(governorate) else {
            warn!(governorate = %governorate, "no mubawab slug for governorate, skipping");
            continue;
        };
        for property_type in &property_types {
            let Some(type_code) = type_slug(property_type) else {
                warn!(property_type = %property_type, "no mubawab slug for property type, skipping");
                continue;
            };
            plan.push(CrawlTarget {
                label: format!("{gov_slug}/{type_code}"),
                governorate: Some(governorate.clone()),
                property_type: Some(property_type.to_lowercase()),
                type_filter: Vec::new(),
                area_filter: Vec::new(),
            });
        }
    }
    plan
}

pub(crate) fn page_urls(target: &CrawlTarget, page: u32) -> Vec<String> {
    let Some((gov, code)) = target.label.split_once('/') else {
        return Vec::new();
    };
    vec![format!("{BASE}/{gov}/lst/{code}:p:{page}")]
}

pub(crate) fn extract_listing_page(
    document: &Html,
    page_url: &str,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let card_sel = selector(r#"li.listingBox, div[class*="listing"], article"#)?;
    let link_sel = selector(r#"a[href*="/fr/"]"#)?;
    let title_sel = selector(r#"h2, h3, [class*="title"]"#)?;
    let price_sel = selector(r#"[class*="price"]"#)?;
    let location_sel = selector(r#"[class*="location"]"#)?;
    let features_sel = selector(r#"[class*="features"], [class*="caracteristiques"]"#)?;
    let img_sel = selector(r#"img[src*="mubawab"], img[data-src*="mubawab"]"#)?;

    let mut out = Vec::new();
    for card in document.select(&card_sel) {
        let Some(href) = card
            .select(&link_sel)
            .find_map(|a| a.value().attr("href"))
            .and_then(|h| absolutize(page_url, h))
        else {
            continue;
        };
        let listing_id = href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|segment| segment.split('-').next())
            .unwrap_or_default()
            .to_string();
        if listing_id.is_empty() {
            continue;
        }
        let Some(title) = select_first_text(card, &title_sel) else {
            continue;
        };

        let features = select_first_text(card, &features_sel).unwrap_or_default();
        let images = select_all_attrs(card, &img_sel, &["src", "data-src"])
            .into_iter()
            .filter_map(|src| absolutize(page_url, &src))
            .collect();

        out.push(RawCandidate {
            href,
            listing_id,
            title: Some(title),
            price_text: select_first_text(card, &price_sel),
            location_text: select_first_text(card, &location_sel),
            bedrooms: parse_bedrooms(&features),
            bathrooms: parse_bathrooms(&features),
            size_text: Some(features),
            images,
            ..RawCandidate::default()
        });
    }
    Ok(out)
}

pub(crate) fn extract_detail(document: &Html, page_url: &str) -> Result<RawCandidate, AdapterError> {
    let description_sel = selector(r#"div.blockProp p, [class*="description"]"#)?;
    let features_sel = selector(r#"[class*="adDetailFeature"], [class*="caracteristiques"], [class*="features"]"#)?;
    let img_sel = selector(r#"img[src*="mubawab-media"], img[data-src*="mubawab-media"]"#)?;

    let features = select_document_text(document, &features_sel).unwrap_or_default();
    let images = document
        .select(&img_sel)
        .filter_map(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
        .filter_map(|src| absolutize(page_url, src))
        .collect();

    Ok(RawCandidate {
        href: page_url.to_string(),
        description: select_document_text(document, &description_sel),
        bedrooms: parse_bedrooms(&features),
        bathrooms: parse_bathrooms(&features),
        size_text: (!features.is_empty()).then_some(features),
        images,
        ..RawCandidate::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor_for;
    use chrono::Utc;
    use estate_core::SourceId;

    #[test]
    fn plan_crosses_known_governorates_and_types() {
        let config = ScraperConfig::new(SourceId::Mubawab).with_scope(
            vec!["Tunis".into(), "Sousse".into(), "Atlantis".into()],
            vec!["villa".into(), "apartment".into()],
        );
        let plan = crawl_plan(&config);
        let labels = plan.iter().map(|t| t.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["tunis/vd", "tunis/ad", "sousse/vd", "sousse/ad"]);

        let urls = page_urls(&plan[0], 3);
        assert_eq!(urls, vec!["https://www.mubawab.tn/fr/ct/tunis/lst/vd:p:3".to_string()]);
    }

    #[test]
    fn empty_scope_defaults_to_tunis_apartments() {
        let plan = crawl_plan(&ScraperConfig::new(SourceId::Mubawab));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].label, "tunis/ad");
    }

    #[test]
    fn listing_box_maps_to_listing() {
        let html = r#"
            <ul class="ulListing">
              <li class="listingBox">
                <a href="https://www.mubawab.tn/fr/a/7482311-villa-gammarth">
                  <h2 class="listingTit">Villa avec piscine à Gammarth</h2>
                </a>
                <span class="priceTag">1 250 000 TND</span>
                <span class="location">Gammarth, La Marsa, Tunis</span>
                <div class="features">450 m² 5 Chambres 3 Salles de bains</div>
                <img src="https://www.mubawab-media.com/ad/7/482/311/photo1.jpg" />
              </li>
            </ul>
        "#;
        let extractor = extractor_for(SourceId::Mubawab);
        let page = "https://www.mubawab.tn/fr/ct/tunis/lst/vd:p:1";
        let candidates = extractor.extract_listing_page(html, page).expect("extract");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].listing_id, "7482311");

        let target = CrawlTarget {
            label: "tunis/vd".into(),
            governorate: Some("Tunis".into()),
            property_type: Some("villa".into()),
            type_filter: Vec::new(),
            area_filter: Vec::new(),
        };
        let listing = extractor.build_listing(&candidates[0], &target, Utc::now());
        assert_eq!(listing.price, Some(1_250_000.0));
        assert_eq!(listing.size, Some(450.0));
        assert_eq!(listing.bedrooms, Some(5));
        assert_eq!(listing.bathrooms, Some(3));
        assert_eq!(listing.property_type.as_deref(), Some("VILLA"));
        assert_eq!(listing.neighborhood.as_deref(), Some("Gammarth"));
        assert!(listing.has_pool);
        assert_eq!(listing.images.len(), 1);
    }
}
