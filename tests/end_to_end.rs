use std::sync::Arc;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use nearfeed::saved::ItemKind;
use nearfeed::{open_service, AppConfig, FetchSource, Pagination, Position, StaticSession};

const COFFEE_SHOP: &str = "4bf58dd8d48988d1e0931735";

fn config_for(server: &Server) -> AppConfig {
    AppConfig {
        foursquare_base_url: server.url_str("").trim_end_matches('/').to_string(),
        foursquare_client_id: Some(SecretString::from("client".to_string())),
        foursquare_client_secret: Some(SecretString::from("secret".to_string())),
        provider_rate_limit_qps: 20,
        ..AppConfig::default()
    }
}

fn venue_json(id: &str, lat: f64, lng: f64) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("Cafe {id}"),
        "location": {"lat": lat, "lng": lng, "address": "1 Main St"},
        "categories": [
            {"id": COFFEE_SHOP, "name": "Coffee Shop", "primary": true},
            {"id": "4bf58dd8d48988d16d941735", "name": "Café"}
        ]
    })
}

#[tokio::test]
async fn nearby_fetch_is_cached_across_calls_and_restarts() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/venues/search"),
            request::query(url_decoded(contains(("categoryId", COFFEE_SHOP)))),
            request::query(url_decoded(contains(("ll", "40,-73"))))
        ])
        .times(1)
        .respond_with(json_encoded(json!({
            "meta": {"code": 200},
            "response": {"venues": [
                venue_json("v1", 40.001, -73.0),
                venue_json("v2", 40.0, -73.002)
            ]}
        }))),
    );

    let dir = tempdir().unwrap();
    let config = config_for(&server);
    let here = Position::new(40.0, -73.0);

    let service = open_service(dir.path(), &config, Arc::new(StaticSession::anonymous())).unwrap();
    let first = service.nearby_venues(here, COFFEE_SHOP).await.unwrap();
    assert_eq!(first.source, FetchSource::Provider);
    assert_eq!(first.stats.created, 2);
    assert_eq!(first.items.len(), 2);
    for venue in &first.items {
        assert_eq!(venue.category_id, COFFEE_SHOP);
        assert!(venue.distance_meters >= 0.0);
    }

    let second = service.nearby_venues(here, COFFEE_SHOP).await.unwrap();
    assert_eq!(second.source, FetchSource::Cache);
    let mut ids: Vec<_> = second.items.iter().map(|v| v.venue_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["v1", "v2"]);
    drop(service);

    let reopened = open_service(dir.path(), &config, Arc::new(StaticSession::anonymous())).unwrap();
    let third = reopened.nearby_venues(here, COFFEE_SHOP).await.unwrap();
    assert_eq!(third.source, FetchSource::Cache);
    assert_eq!(third.items.len(), 2);
}

#[tokio::test]
async fn position_updates_and_saved_items_flow_through_the_service() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/venues/search")).respond_with(
            json_encoded(json!({
                "meta": {"code": 200},
                "response": {"venues": [venue_json("v1", 40.0, -73.0)]}
            })),
        ),
    );

    let dir = tempdir().unwrap();
    let session = StaticSession::anonymous();
    let service = open_service(dir.path(), &config_for(&server), Arc::new(session.clone())).unwrap();
    service
        .nearby_venues(Position::new(40.0, -73.0), COFFEE_SHOP)
        .await
        .unwrap();

    session.sign_in("user-1");
    service.register_user("Dana", Some("dana@example.com")).unwrap();
    assert!(service.set_favorite(ItemKind::Venue, "v1", true).unwrap());

    let moved = Position::new(40.0, -72.99);
    assert!(service.accept_position(moved).unwrap());
    let venue = service.venue("v1").unwrap().unwrap();
    let expected = moved.distance_to(&Position::new(40.0, -73.0));
    assert!((venue.distance_meters - expected).abs() < 1e-6);
    assert!(venue.is_favorite);

    let profile = service.current_profile().unwrap().unwrap();
    assert_eq!(profile.location, Some(moved));
    assert_eq!(service.preferences().last_fetched_position, Some(moved));

    let page = service
        .venues_in_category(COFFEE_SHOP, Pagination::default())
        .unwrap();
    assert_eq!(page.total, 1);
}
