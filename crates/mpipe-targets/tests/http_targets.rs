use mpipe_core::Document;
use mpipe_storage::HttpClientConfig;
use mpipe_targets::{HttpLinkResolver, LinkResolver, SearchIndex, SolrIndex, TargetError};
use serde_json::{json, Value as JsonValue};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn doc(value: JsonValue) -> Document {
    match value {
        JsonValue::Object(map) => map,
        _ => panic!("documents are objects"),
    }
}

#[tokio::test]
async fn solr_batch_posts_json_array_with_commit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/solr/collection1/update"))
        .and(query_param("commit", "true"))
        .and(body_json(json!([{"bibcode": "A"}, {"bibcode": "B"}])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let solr = SolrIndex::new(
        &HttpClientConfig::default(),
        vec![format!("{}/solr/collection1/update", server.uri())],
    )
    .expect("client");
    solr.submit(&[doc(json!({"bibcode": "A"})), doc(json!({"bibcode": "B"}))], true)
        .await
        .expect("accepted");
}

#[tokio::test]
async fn solr_requires_every_endpoint_to_accept() {
    let good = MockServer::start().await;
    let bad = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&good)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string("immense term in field=\"body\""),
        )
        .expect(1)
        .mount(&bad)
        .await;

    let solr = SolrIndex::new(
        &HttpClientConfig::default(),
        vec![
            format!("{}/solr/c/update", good.uri()),
            format!("{}/solr/c/update", bad.uri()),
        ],
    )
    .expect("client");
    let err = solr
        .submit(&[doc(json!({"bibcode": "A", "body": "x"}))], false)
        .await
        .expect_err("one endpoint failed");
    assert!(matches!(err, TargetError::Status { status: 400, .. }));
    assert!(err.mentions_field("body"));
}

#[tokio::test]
async fn solr_delete_sends_query_by_bibcode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_json(json!({"delete": {"query": "bibcode:\"2020ApJ...1..1A\""}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let solr = SolrIndex::new(
        &HttpClientConfig::default(),
        vec![format!("{}/solr/c/update", server.uri())],
    )
    .expect("client");
    solr.delete("2020ApJ...1..1A").await.expect("deleted");
}

#[tokio::test]
async fn link_resolver_puts_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/update"))
        .and(header("Authorization", "Bearer secret"))
        .and(body_json(json!([{"bibcode": "A", "data_links_rows": [{"url": "u"}]}])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = HttpLinkResolver::new(
        &HttpClientConfig::default(),
        format!("{}/update", server.uri()),
        "secret",
    )
    .expect("client");
    resolver
        .update(&[doc(json!({"bibcode": "A", "data_links_rows": [{"url": "u"}]}))])
        .await
        .expect("accepted");
}

#[tokio::test]
async fn link_resolver_surfaces_non_200() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let resolver =
        HttpLinkResolver::new(&HttpClientConfig::default(), server.uri(), "t").expect("client");
    let err = resolver.update(&[doc(json!({"bibcode": "A"}))]).await.unwrap_err();
    assert!(matches!(err, TargetError::Status { status: 503, .. }));
}
