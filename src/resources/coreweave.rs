use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::record::{CoreWeaveFacts, EnvironmentRecord, StatsRecord};
use crate::resources::Resource;

/// Backend lookup deciding whether an entity's organization participates in
/// CoreWeave. Implemented over GraphQL in production; injectable for tests.
#[async_trait]
pub trait OrgLookup: Send + Sync {
    /// The CoreWeave organization id for `entity`, or None when the
    /// organization does not participate.
    async fn coreweave_org_id(&self, entity: &str) -> Result<Option<String>>;
}

const ORG_QUERY: &str = "\
query OrganizationCoreWeaveOrganizationID($entityName: String!) {
  organization(entityName: $entityName) {
    coreWeaveOrganizationId
  }
}";

#[derive(Debug, Deserialize)]
struct OrgQueryResponse {
    data: Option<OrgQueryData>,
}

#[derive(Debug, Deserialize)]
struct OrgQueryData {
    organization: Option<OrgQueryOrganization>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgQueryOrganization {
    core_weave_organization_id: Option<String>,
}

/// GraphQL client for the single typed org-lookup operation.
pub struct GraphqlOrgClient {
    url: String,
    client: reqwest::Client,
}

impl GraphqlOrgClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OrgLookup for GraphqlOrgClient {
    async fn coreweave_org_id(&self, entity: &str) -> Result<Option<String>> {
        let body = serde_json::json!({
            "query": ORG_QUERY,
            "variables": { "entityName": entity },
        });

        let response: OrgQueryResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("org lookup request failed")?
            .error_for_status()
            .context("org lookup returned an error status")?
            .json()
            .await
            .context("org lookup response was not valid JSON")?;

        Ok(response
            .data
            .and_then(|d| d.organization)
            .and_then(|o| o.core_weave_organization_id))
    }
}

/// Probe-only resource populating CoreWeave instance facts. The metadata
/// endpoint is contacted only after the org lookup confirms participation.
pub struct CoreWeaveResource {
    lookup: Arc<dyn OrgLookup>,
    metadata_url: String,
    entity: String,
    client: reqwest::Client,
}

impl CoreWeaveResource {
    pub fn new(lookup: Arc<dyn OrgLookup>, metadata_url: String, entity: String) -> Self {
        Self {
            lookup,
            metadata_url,
            entity,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Resource for CoreWeaveResource {
    fn name(&self) -> &'static str {
        "coreweave"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        Ok(None)
    }

    async fn probe(&self, cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        let org_id = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.lookup.coreweave_org_id(&self.entity) => match result {
                Ok(id) => id,
                Err(e) => {
                    debug!(error = %e, "CoreWeave org lookup failed");
                    return None;
                }
            },
        };
        match org_id {
            Some(id) if !id.is_empty() => {}
            _ => return None, // not a CoreWeave org; never fetch metadata
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.fetch_metadata() => match result {
                Ok(body) => body,
                Err(e) => {
                    debug!(error = %e, "CoreWeave metadata fetch failed");
                    return None;
                }
            },
        };

        Some(EnvironmentRecord {
            coreweave: Some(parse_instance_metadata(&body)),
            ..Default::default()
        })
    }
}

impl CoreWeaveResource {
    async fn fetch_metadata(&self) -> Result<String> {
        self.client
            .get(&self.metadata_url)
            .send()
            .await
            .context("metadata request failed")?
            .error_for_status()
            .context("metadata endpoint returned an error status")?
            .text()
            .await
            .context("reading metadata body")
    }
}

/// Parse the line-oriented `key: value` metadata document. Malformed lines
/// and unknown keys are skipped.
fn parse_instance_metadata(body: &str) -> CoreWeaveFacts {
    let mut facts = CoreWeaveFacts::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            debug!(line = %line, "Skipping malformed metadata line");
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "cluster_name" => facts.cluster_name = Some(value.to_string()),
            "org_id" => facts.org_id = Some(value.to_string()),
            "region" => facts.region = Some(value.to_string()),
            "node_pool" => facts.node_pool = Some(value.to_string()),
            "fde_raid" => match parse_lenient_bool(value) {
                Some(b) => facts.fde_raid = Some(b),
                None => debug!(value = %value, "Skipping unparsable boolean"),
            },
            _ => {} // unknown key
        }
    }

    facts
}

/// Accept the common boolean spellings: 1/0, t/f, true/false, any case.
fn parse_lenient_bool(s: &str) -> Option<bool> {
    if s == "1" || s.eq_ignore_ascii_case("t") || s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s == "0" || s.eq_ignore_ascii_case("f") || s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedLookup {
        org_id: Option<String>,
        calls: AtomicUsize,
    }

    impl FixedLookup {
        fn new(org_id: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                org_id: org_id.map(String::from),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OrgLookup for FixedLookup {
        async fn coreweave_org_id(&self, _entity: &str) -> Result<Option<String>> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.org_id.clone())
        }
    }

    // -- metadata parsing ----------------------------------------------------

    #[test]
    fn parses_known_keys_and_skips_malformed() {
        let body =
            "cluster_name: cks-wb\norg_id: b13ad0\nregion: us-east-04\nfde_raid: true\nmalformed line";
        let facts = parse_instance_metadata(body);
        assert_eq!(facts.cluster_name.as_deref(), Some("cks-wb"));
        assert_eq!(facts.org_id.as_deref(), Some("b13ad0"));
        assert_eq!(facts.region.as_deref(), Some("us-east-04"));
        assert_eq!(facts.fde_raid, Some(true));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let facts = parse_instance_metadata("mystery_key: 42\nregion: eu-west-01\n");
        assert_eq!(facts.region.as_deref(), Some("eu-west-01"));
    }

    #[test]
    fn lenient_bool_accepts_common_spellings() {
        for s in ["1", "t", "T", "true", "TRUE", "True"] {
            assert_eq!(parse_lenient_bool(s), Some(true), "for {s}");
        }
        for s in ["0", "f", "F", "false", "FALSE", "False"] {
            assert_eq!(parse_lenient_bool(s), Some(false), "for {s}");
        }
        assert_eq!(parse_lenient_bool("yes"), None);
        assert_eq!(parse_lenient_bool(""), None);
    }

    // -- probe gating --------------------------------------------------------

    #[tokio::test]
    async fn probe_skips_metadata_when_org_lookup_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("cluster_name: x"))
            .expect(0) // must never be contacted
            .mount(&server)
            .await;

        for org in [None, Some("")] {
            let resource = CoreWeaveResource::new(
                FixedLookup::new(org),
                server.uri(),
                "acme".to_string(),
            );
            let cancel = CancellationToken::new();
            assert!(resource.probe(&cancel).await.is_none());
        }
    }

    #[tokio::test]
    async fn probe_fetches_and_parses_when_org_participates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "cluster_name: cks-wb\norg_id: b13ad0\nregion: us-east-04\nfde_raid: true\nmalformed line",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let resource =
            CoreWeaveResource::new(FixedLookup::new(Some("b13ad0")), server.uri(), "acme".into());
        let cancel = CancellationToken::new();
        let env = resource.probe(&cancel).await.unwrap();
        let facts = env.coreweave.unwrap();
        assert_eq!(facts.cluster_name.as_deref(), Some("cks-wb"));
        assert_eq!(facts.fde_raid, Some(true));
    }

    #[tokio::test]
    async fn probe_returns_none_on_metadata_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let resource =
            CoreWeaveResource::new(FixedLookup::new(Some("org")), server.uri(), "acme".into());
        let cancel = CancellationToken::new();
        assert!(resource.probe(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn sample_yields_nothing() {
        let resource = CoreWeaveResource::new(
            FixedLookup::new(Some("org")),
            "http://unused".into(),
            "acme".into(),
        );
        assert!(resource.sample().await.unwrap().is_none());
    }

    // -- GraphQL client ------------------------------------------------------

    #[tokio::test]
    async fn graphql_client_extracts_org_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"data\":{\"organization\":{\"coreWeaveOrganizationId\":\"b13ad0\"}}}",
            ))
            .mount(&server)
            .await;

        let client = GraphqlOrgClient::new(server.uri());
        let org = client.coreweave_org_id("acme").await.unwrap();
        assert_eq!(org.as_deref(), Some("b13ad0"));
    }

    #[tokio::test]
    async fn graphql_client_null_organization_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"data\":{\"organization\":null}}"))
            .mount(&server)
            .await;

        let client = GraphqlOrgClient::new(server.uri());
        assert!(client.coreweave_org_id("acme").await.unwrap().is_none());
    }
}
