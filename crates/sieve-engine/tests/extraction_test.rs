//! End-to-end extraction runs over fixture sites.

use serde_json::json;
use sieve_browser::{Advance, FixtureSite, StaticSession};
use sieve_core::{PaginationConfig, SieveConfig, SubpageConfig};
use sieve_engine::{
    DiagnosticKind, EngineError, ExtractionOrchestrator, Record, RunResult, Sessions, Value,
};
use sieve_template::Template;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const URL: &str = "https://shop.example.com/catalog";

fn quiet_config() -> SieveConfig {
    SieveConfig {
        pagination: PaginationConfig {
            retry_backoff_ms: 0,
            default_pause_ms: 0,
            ..PaginationConfig::default()
        },
        subpage: SubpageConfig {
            inter_navigation_delay_ms: 0,
            retry_backoff_ms: 0,
            ..SubpageConfig::default()
        },
        ..SieveConfig::default()
    }
}

fn template(value: serde_json::Value) -> Template {
    assert_ok!(Template::from_json(&value.to_string()))
}

fn card(index: usize) -> String {
    format!(
        r#"<div class="card"><h3>Item {index}</h3><span class="price">${index}.00</span><a href="/item/{index}">Details</a></div>"#
    )
}

fn cards(range: std::ops::Range<usize>) -> String {
    range.map(card).collect()
}

fn page(body: &str) -> String {
    format!("<html><body><div class=\"grid\">{body}</div></body></html>")
}

fn catalog_template(pagination: serde_json::Value) -> Template {
    template(json!({
        "url": URL,
        "name": "catalog",
        "elements": [{
            "label": "products",
            "selector": ".card",
            "elementType": "container",
            "isContainer": true,
            "subElements": [
                {"label": "name", "selector": "h3"},
                {"label": "price", "selector": ".price"}
            ]
        }],
        "pagination": pagination
    }))
}

async fn run(site: &Arc<FixtureSite>, template: &Template) -> RunResult {
    let sessions = Sessions::from_static(StaticSession::new(site.clone()));
    assert_ok!(
        ExtractionOrchestrator::new(quiet_config())
            .run(template, sessions, CancellationToken::new())
            .await
    )
}

fn text<'a>(record: &'a Record, label: &str) -> Option<&'a str> {
    record.get(label).and_then(Value::as_scalar)
}

fn names(result: &RunResult) -> Vec<&str> {
    result
        .records
        .iter()
        .filter_map(|record| text(record, "name"))
        .collect()
}

#[tokio::test]
async fn test_directory_without_pagination_keeps_document_order() {
    let site = Arc::new(FixtureSite::new().with_page(URL, page(&cards(0..3))));
    let template = catalog_template(json!(null));

    let result = run(&site, &template).await;

    assert_eq!(names(&result), vec!["Item 0", "Item 1", "Item 2"]);
    assert_eq!(text(&result.records[2], "price"), Some("$2.00"));
    assert_eq!(result.pages_processed, 1);
    assert!(!result.incomplete);
    assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    assert_eq!(site.stats(URL).visits, 1);
}

#[tokio::test]
async fn test_load_more_collects_every_record_once() {
    let stage = |count: usize, more: bool| {
        let button = if more { r#"<button class="more">Next batch</button>"# } else { "" };
        page(&format!("{}{button}", cards(0..count)))
    };
    let site = Arc::new(FixtureSite::new().with_staged_page(
        URL,
        vec![stage(3, true), stage(6, true), stage(9, false)],
        Advance::OnClick(".more".to_string()),
    ));
    let template = catalog_template(json!({
        "patternType": "loadMore",
        "selector": ".more",
        "maxPages": 2,
        "scrollPauseSeconds": 0
    }));

    let result = run(&site, &template).await;

    assert_eq!(site.stats(URL).clicks, 2);
    assert_eq!(result.records.len(), 9);
    let unique: HashSet<_> = names(&result).into_iter().collect();
    assert_eq!(unique.len(), 9);
    assert_eq!(names(&result).first(), Some(&"Item 0"));
    assert_eq!(names(&result).last(), Some(&"Item 8"));
    assert!(!result.incomplete);
}

#[tokio::test]
async fn test_repeated_runs_yield_identical_records() {
    let site = Arc::new(FixtureSite::new().with_page(URL, page(&cards(0..4))));
    let template = catalog_template(json!({"patternType": "none"}));

    let first = run(&site, &template).await;
    let second = run(&site, &template).await;

    assert_eq!(first.records, second.records);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_xpath_declared_as_css_still_resolves() {
    let site = Arc::new(FixtureSite::new().with_page(
        URL,
        r#"<html><body>
            <div class="item">Alpha</div>
            <div class="item">Beta</div>
            <div class="other">Gamma</div>
        </body></html>"#,
    ));
    let template = template(json!({
        "url": URL,
        "elements": [
            {"label": "items", "selector": "//div[@class='item']", "isMultiple": true}
        ]
    }));

    let result = run(&site, &template).await;

    assert_eq!(result.records.len(), 1);
    let items = result.records[0].get("items").and_then(Value::as_list);
    assert_eq!(
        items,
        Some(&["Alpha".to_string(), "Beta".to_string()][..])
    );
    assert_eq!(result.diagnostics_of(DiagnosticKind::SelectorResolution).count(), 0);
}

#[tokio::test]
async fn test_container_instances_follow_document_order() {
    for count in [0usize, 1, 5, 100] {
        let site = Arc::new(FixtureSite::new().with_page(URL, page(&cards(0..count))));
        let template = template(json!({
            "url": URL,
            "elements": [{
                "label": "products",
                "selector": ".card",
                "elementType": "container",
                "isRequired": false,
                "subElements": [{"label": "name", "selector": "h3"}]
            }],
            "pagination": {"patternType": "none"}
        }));

        let result = run(&site, &template).await;

        let expected: Vec<String> = (0..count).map(|i| format!("Item {i}")).collect();
        assert_eq!(names(&result), expected, "instance order for {count} cards");
        assert!(!result.incomplete);
    }
}

#[tokio::test]
async fn test_missing_required_container_fails_run() {
    let site = Arc::new(FixtureSite::new().with_page(URL, page("<p>Nothing here yet</p>")));
    let template = catalog_template(json!({"patternType": "none"}));
    let sessions = Sessions::from_static(StaticSession::new(site.clone()));

    let err = assert_err!(
        ExtractionOrchestrator::new(quiet_config())
            .run(&template, sessions, CancellationToken::new())
            .await
    );
    assert!(matches!(err, EngineError::ContainerNotFound { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_one_missing_required_field_is_reported_once() {
    let body = format!(
        r#"{}<div class="card"><h3>Item 1</h3><a href="/item/1">Details</a></div>{}"#,
        card(0),
        card(2)
    );
    let site = Arc::new(FixtureSite::new().with_page(URL, page(&body)));
    let template = catalog_template(json!({"patternType": "none"}));

    let result = run(&site, &template).await;

    assert_eq!(result.records.len(), 3);
    assert_eq!(result.records[1].get("price"), Some(&Value::Null));
    let misses: Vec<_> = result
        .diagnostics_of(DiagnosticKind::SelectorResolution)
        .collect();
    assert_eq!(misses.len(), 1);
    assert!(misses[0].subject.contains("price"), "{}", misses[0].subject);
    assert!(!result.incomplete);
}

#[tokio::test]
async fn test_same_field_missing_on_each_url_page_is_reported_per_page() {
    let first = format!("{URL}?page=1");
    let bare = |index: usize| {
        format!(r#"<div class="card"><h3>Item {index}</h3><a href="/item/{index}">Details</a></div>"#)
    };
    let site = Arc::new(
        FixtureSite::new()
            .with_page(&first, page(&card(0)))
            .with_page(&format!("{URL}?page=2"), page(&bare(10)))
            .with_page(&format!("{URL}?page=3"), page(&bare(20)))
            .with_page(&format!("{URL}?page=4"), page(&bare(20))),
    );
    let template = template(json!({
        "url": first,
        "elements": [{
            "label": "products",
            "selector": ".card",
            "elementType": "container",
            "subElements": [
                {"label": "name", "selector": "h3"},
                {"label": "price", "selector": ".price"}
            ]
        }],
        "pagination": {"patternType": "urlBased", "scrollPauseSeconds": 0}
    }));

    let result = run(&site, &template).await;

    assert_eq!(names(&result), vec!["Item 0", "Item 10", "Item 20"]);
    let misses: Vec<_> = result
        .diagnostics_of(DiagnosticKind::SelectorResolution)
        .collect();
    assert_eq!(misses.len(), 2, "{misses:?}");
    assert!(misses.iter().all(|d| d.subject == "products[0].price"));
    let pages: Vec<_> = misses.iter().filter_map(|d| d.page.as_deref()).collect();
    assert_eq!(
        pages,
        vec![
            "https://shop.example.com/catalog?page=2",
            "https://shop.example.com/catalog?page=3"
        ]
    );
    assert_eq!(result.pages_processed, 4);
    assert!(!result.incomplete);
}

#[tokio::test]
async fn test_infinite_scroll_stops_after_stall() {
    let site = Arc::new(FixtureSite::new().with_staged_page(
        URL,
        vec![page(&cards(0..3)), page(&cards(0..6)), page(&cards(0..9))],
        Advance::OnScroll,
    ));
    let template = catalog_template(json!({
        "patternType": "infiniteScroll",
        "scrollPauseSeconds": 0
    }));

    let result = run(&site, &template).await;

    let stall_threshold = quiet_config().pagination.stall_threshold as usize;
    let productive = 2;
    assert_eq!(result.records.len(), 9);
    assert!(site.stats(URL).scrolls <= stall_threshold + productive);
    assert!(!result.incomplete);
    assert_eq!(result.diagnostics_of(DiagnosticKind::PaginationStall).count(), 0);
}

#[tokio::test]
async fn test_subpage_timeout_leaves_one_record_unenriched() {
    let detail = |name: &str| {
        format!(r#"<html><body><h1>{name}</h1><p class="bio">About {name}</p></body></html>"#)
    };
    let site = Arc::new(
        FixtureSite::new()
            .with_page(URL, page(&cards(0..4)))
            .with_page("https://shop.example.com/item/0", detail("Item 0"))
            .with_page("https://shop.example.com/item/1", detail("Item 1"))
            .with_timeout("https://shop.example.com/item/2")
            .with_page("https://shop.example.com/item/3", detail("Item 3")),
    );
    let template = template(json!({
        "url": URL,
        "elements": [{
            "label": "products",
            "selector": ".card",
            "elementType": "container",
            "subElements": [{"label": "name", "selector": "h3"}],
            "followLinks": true,
            "subpageElements": [{"label": "bio", "selector": ".bio"}]
        }],
        "pagination": {"patternType": "none"}
    }));

    let result = run(&site, &template).await;

    assert_eq!(result.records.len(), 4);
    let enriched: Vec<_> = result
        .records
        .iter()
        .map(|record| text(record, "bio").is_some())
        .collect();
    assert_eq!(enriched, vec![true, true, false, true]);
    assert_eq!(text(&result.records[3], "bio"), Some("About Item 3"));
    assert_eq!(result.subpages_processed, 3);
    assert_eq!(result.diagnostics_of(DiagnosticKind::SubpageMerge).count(), 1);
    assert!(result.incomplete);
}

#[tokio::test]
async fn test_single_session_crawls_details_after_pagination() {
    let detail = |name: &str| {
        format!(r#"<html><body><h1>{name}</h1><p class="bio">About {name}</p></body></html>"#)
    };
    let mut fixture = FixtureSite::new().with_page(URL, page(&cards(0..3)));
    for index in 0..3 {
        fixture = fixture.with_page(
            &format!("https://shop.example.com/item/{index}"),
            detail(&format!("Item {index}")),
        );
    }
    let site = Arc::new(fixture);
    let template = template(json!({
        "url": URL,
        "elements": [{
            "label": "products",
            "selector": ".card",
            "elementType": "container",
            "subElements": [{"label": "name", "selector": "h3"}],
            "followLinks": true,
            "subpageElements": [{"label": "bio", "selector": ".bio"}]
        }],
        "pagination": {"patternType": "none"}
    }));
    let sessions = Sessions::single(Arc::new(StaticSession::new(site.clone())));

    let result = assert_ok!(
        ExtractionOrchestrator::new(quiet_config())
            .run(&template, sessions, CancellationToken::new())
            .await
    );

    let bios: Vec<_> = result
        .records
        .iter()
        .filter_map(|record| text(record, "bio"))
        .collect();
    assert_eq!(bios, vec!["About Item 0", "About Item 1", "About Item 2"]);
    assert_eq!(result.subpages_processed, 3);
    assert_eq!(site.stats(URL).visits, 1);
    assert_eq!(site.total_visits(), 4);
    assert!(!result.incomplete);
    assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
}

#[tokio::test]
async fn test_cancelled_run_returns_partial_result() {
    let site = Arc::new(FixtureSite::new().with_page(URL, page(&cards(0..2))));
    let template = catalog_template(json!({"patternType": "none"}));
    let sessions = Sessions::from_static(StaticSession::new(site.clone()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = assert_ok!(
        ExtractionOrchestrator::new(quiet_config())
            .run(&template, sessions, cancel)
            .await
    );

    assert!(result.incomplete);
    assert_eq!(result.diagnostics_of(DiagnosticKind::Cancelled).count(), 1);
}
