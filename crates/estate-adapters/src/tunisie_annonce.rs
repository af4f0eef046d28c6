use estate_core::ScraperConfig;
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::{
    absolutize, element_text, parse_bedrooms, parse_phone, select_document_text, selector,
    AdapterError, CrawlTarget, RawCandidate,
};

const LISTING_URL: &str = "http://www.tunisie-annonce.com/AnnoncesImmobilier.asp";
const DETAIL_URL: &str = "http://www.tunisie-annonce.com/DetailsAnnonceImmobilier.asp";
const MIN_TITLE_CHARS: usize = 5;

lazy_static! {
    static ref COD_ANN: Regex = Regex::new(r"cod_ann=(\d+)").unwrap();
    static ref BODY_PRICE: Regex =
        Regex::new(r"(?i)\d[\d\s.,\u{a0}\u{202f}]*\s*(?:dinars?|dt|tnd)\b").unwrap();
}

pub(crate) fn crawl_plan(config: &ScraperConfig) -> Vec<CrawlTarget> {
    let mut target = CrawlTarget::all("immobilier");
    target.type_filter = config
        .property_types
        .iter()
        .map(|t| t.to_uppercase())
        .collect();
    target.area_filter = config.governorates.clone();
    vec![target]
}

pub(crate) fn page_urls(page: u32) -> Vec<String> {
    if page <= 1 {
        vec![LISTING_URL.to_string()]
    } else {
        vec![format!("{LISTING_URL}?rech_page_num={page}")]
    }
}

/// Canonical detail URL for a listing id, free of paging and search parameters.
pub(crate) fn detail_url(listing_id: &str) -> String {
    format!("{DETAIL_URL}?cod_ann={listing_id}")
}

/// Property and transaction type from the keywords of a listing title.
pub(crate) fn classify_title(title: &str) -> (&'static str, &'static str) {
    let lower = title.to_lowercase();
    let property_type = if lower.contains("villa") {
        "VILLA"
    } else if lower.contains("maison") {
        "HOUSE"
    } else if lower.contains("terrain") {
        "LAND"
    } else if lower.contains("local") || lower.contains("commercial") {
        "COMMERCIAL"
    } else {
        "APARTMENT"
    };
    let transaction_type = if lower.contains("location") { "RENT" } else { "SALE" };
    (property_type, transaction_type)
}

fn enclosing_row(link: ElementRef<'_>) -> Option<ElementRef<'_>> {
    link.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "tr")
}

pub(crate) fn extract_listing_page(
    document: &Html,
    page_url: &str,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let link_sel = selector(r#"a[href*="DetailsAnnonceImmobilier"]"#)?;
    let img_sel = selector("img")?;

    let mut out = Vec::new();
    for link in document.select(&link_sel) {
        let Some(listing_id) = link
            .value()
            .attr("href")
            .and_then(|h| COD_ANN.captures(h))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };
        let Some(title) = element_text(link).filter(|t| t.chars().count() > MIN_TITLE_CHARS) else {
            continue;
        };

        let (property_type, transaction_type) = classify_title(&title);
        let row = enclosing_row(link);
        let images = row
            .map(|r| {
                r.select(&img_sel)
                    .filter_map(|img| img.value().attr("src"))
                    .filter_map(|src| absolutize(page_url, src))
                    .collect()
            })
            .unwrap_or_default();

        out.push(RawCandidate {
            href: detail_url(&listing_id),
            listing_id,
            title: Some(title),
            property_type: Some(property_type.to_string()),
            transaction_type: Some(transaction_type.to_string()),
            images,
            ..RawCandidate::default()
        });
    }
    Ok(out)
}

/// `(label, value)` pairs from two-column detail tables.
fn labelled_cells(document: &Html) -> Result<Vec<(String, String)>, AdapterError> {
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let mut pairs = Vec::new();
    for row in document.select(&row_sel) {
        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if cells.len() < 2 {
            continue;
        }
        let (Some(label), Some(value)) = (element_text(cells[0]), element_text(cells[cells.len() - 1]))
        else {
            continue;
        };
        if label.len() > 40 {
            continue;
        }
        pairs.push((label.to_lowercase(), value));
    }
    Ok(pairs)
}

fn find_label<'a>(pairs: &'a [(String, String)], labels: &[&str]) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(label, _)| labels.iter().any(|l| label.contains(l)))
        .map(|(_, value)| value.as_str())
}

/// `Tunis > La Marsa > Gammarth` becomes `Gammarth, La Marsa, Tunis`.
fn normalize_location(raw: &str) -> String {
    if raw.contains('>') {
        raw.split('>')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .rev()
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        raw.to_string()
    }
}

pub(crate) fn extract_detail(document: &Html, page_url: &str) -> Result<RawCandidate, AdapterError> {
    let body_sel = selector("body")?;
    let description_sel = selector(r#"[class*="description"], [class*="texte"]"#)?;
    let img_sel = selector("img")?;

    let pairs = labelled_cells(document)?;
    let body_text = select_document_text(document, &body_sel).unwrap_or_default();

    let price_text = find_label(&pairs, &["prix"])
        .map(str::to_string)
        .or_else(|| BODY_PRICE.find(&body_text).map(|m| m.as_str().to_string()));
    let location_text =
        find_label(&pairs, &["localisation", "région", "region", "adresse"]).map(normalize_location);
    let size_text = find_label(&pairs, &["surface", "superficie"]).map(|s| {
        if s.to_lowercase().contains('m') {
            s.to_string()
        } else {
            format!("{s} m²")
        }
    });
    let description = find_label(&pairs, &["texte", "description"])
        .map(str::to_string)
        .or_else(|| select_document_text(document, &description_sel));

    let images = document
        .select(&img_sel)
        .filter_map(|img| img.value().attr("src"))
        .filter_map(|src| absolutize(page_url, src))
        .collect();

    Ok(RawCandidate {
        href: page_url.to_string(),
        price_text,
        location_text,
        size_text,
        bedrooms: description.as_deref().and_then(parse_bedrooms),
        description,
        contact_phone: parse_phone(&body_text),
        images,
        ..RawCandidate::default()
    })
}
