//! HTTP client for the source FHIR server and the optional mirror sink.
//!
//! The source facet speaks the search-paging protocol: count probes,
//! `_getpages`/`_getpagesoffset` continuation windows, and `_id=a,b,c` batch
//! fetches. The sink facet uploads resources with `PUT /<type>/<id>` update
//! semantics. Transient failures (5xx, connection resets) are retried with
//! capped exponential backoff; 4xx responses never retry.

use std::time::Duration;

use fhir_etl_config::shared::{RetryConfig, SinkFhirConfig, SourceFhirConfig};
use rand::Rng;
use reqwest::RequestBuilder;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ErrorKind, EtlResult};
use crate::fhir::Bundle;
use crate::metrics::{ETL_RESOURCES_UPLOADED_TOTAL, ETL_UPLOAD_FAILURES_TOTAL};
use crate::{bail, etl_error};

/// Outcome of mirroring one bundle to the sink FHIR server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: u64,
    pub failed: u64,
}

/// Client over the source FHIR server and the optional mirror sink.
#[derive(Debug)]
pub struct FhirClient {
    http: reqwest::Client,
    source: SourceFhirConfig,
    sink: Option<SinkFhirConfig>,
    retry: RetryConfig,
}

impl FhirClient {
    /// Builds the client. `worker_count` caps the connection pool so the
    /// number of inflight requests matches the fetch parallelism.
    pub fn new(
        source: SourceFhirConfig,
        sink: Option<SinkFhirConfig>,
        retry: RetryConfig,
        worker_count: usize,
    ) -> EtlResult<Self> {
        source.validate()?;
        if let Some(sink) = &sink {
            sink.validate()?;
        }
        retry.validate()?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(worker_count)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| {
                etl_error!(ErrorKind::ConfigError, "failed to build http client").with_source(e)
            })?;

        Ok(FhirClient {
            http,
            source,
            sink,
            retry,
        })
    }

    /// True when a mirror sink server is configured.
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Searches for a resource type. With `summary_count` the server returns
    /// only the total; otherwise a first page of `count` entries.
    pub async fn search_for_resource(
        &self,
        resource_type: &str,
        count: usize,
        summary_count: bool,
    ) -> EtlResult<Bundle> {
        let mut url = format!(
            "{}/{}?_count={}",
            self.source.trimmed_base_url(),
            resource_type,
            count
        );
        if summary_count {
            url.push_str("&_summary=count");
        }
        self.get_bundle_with_retry(&url).await
    }

    /// Fetches one continuation window of a search started elsewhere.
    ///
    /// `page_token` is the verbatim `_getpages=<token>` parameter returned by
    /// [`find_base_search_url`].
    pub async fn search_by_page(
        &self,
        page_token: &str,
        count: usize,
        offset: u64,
    ) -> EtlResult<Bundle> {
        let url = format!(
            "{}?{}&_getpagesoffset={}&_count={}",
            self.source.trimmed_base_url(),
            page_token,
            offset,
            count
        );
        self.get_bundle_with_retry(&url).await
    }

    /// Fetches a batch of resources by id (`?_id=a,b,c`).
    pub async fn batch_get_by_ids(&self, resource_type: &str, joined_ids: &str) -> EtlResult<Bundle> {
        let url = format!(
            "{}/{}?_id={}",
            self.source.trimmed_base_url(),
            resource_type,
            joined_ids
        );
        self.get_bundle_with_retry(&url).await
    }

    /// Uploads every entry of a bundle to the mirror server with update
    /// semantics. Per-resource failures are counted; the run continues.
    pub async fn upload_bundle(&self, bundle: &Bundle) -> EtlResult<UploadSummary> {
        let Some(sink) = &self.sink else {
            return Ok(UploadSummary::default());
        };

        let mut summary = UploadSummary::default();
        for resource in bundle.resources()? {
            let url = format!(
                "{}/{}/{}",
                sink.trimmed_base_url(),
                resource.resource_type,
                resource.id
            );

            let mut request = self.http.put(&url).json(resource.body());
            if let Some(username) = &sink.username {
                request = request.basic_auth(username, sink.password.as_deref());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    summary.uploaded += 1;
                    metrics::counter!(ETL_RESOURCES_UPLOADED_TOTAL).increment(1);
                }
                Ok(response) => {
                    warn!(
                        url = %url,
                        status = %response.status(),
                        "mirror upload rejected"
                    );
                    summary.failed += 1;
                    metrics::counter!(ETL_UPLOAD_FAILURES_TOTAL).increment(1);
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "mirror upload failed");
                    summary.failed += 1;
                    metrics::counter!(ETL_UPLOAD_FAILURES_TOTAL).increment(1);
                }
            }
        }

        Ok(summary)
    }

    fn with_source_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.source.bearer_token {
            request.bearer_auth(token)
        } else if let Some(username) = &self.source.username {
            request.basic_auth(username, self.source.password.as_deref())
        } else {
            request
        }
    }

    async fn get_bundle_with_retry(&self, url: &str) -> EtlResult<Bundle> {
        let mut attempt: u32 = 0;
        loop {
            match self.get_bundle_once(url).await {
                Ok(bundle) => return Ok(bundle),
                Err(error) if error.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..=self.retry.initial_backoff_ms / 2);
                    let delay = self.retry.backoff_ms(attempt) + jitter;
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        delay_ms = delay,
                        error = %error,
                        "transient fetch failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn get_bundle_once(&self, url: &str) -> EtlResult<Bundle> {
        debug!(url = %url, "fetching bundle");

        let request = self.with_source_auth(self.http.get(url));
        let response = request.send().await.map_err(|e| {
            etl_error!(
                ErrorKind::TransientRemoteError,
                "connection to source fhir server failed",
                url.to_string()
            )
            .with_source(e)
        })?;

        let status = response.status();
        if status.is_server_error() {
            bail!(
                ErrorKind::TransientRemoteError,
                "source fhir server error",
                format!("{status} for {url}")
            );
        }
        if !status.is_success() {
            bail!(
                ErrorKind::PermanentRemoteError,
                "source fhir request rejected",
                format!("{status} for {url}")
            );
        }

        response.json::<Bundle>().await.map_err(|e| {
            etl_error!(
                ErrorKind::PermanentRemoteError,
                "malformed bundle payload",
                url.to_string()
            )
            .with_source(e)
        })
    }
}

/// Returns the verbatim `_getpages=<token>` parameter from a bundle's `next`
/// link. The token identifies the server-side search cursor that every
/// continuation window of the run reuses.
pub fn find_base_search_url(bundle: &Bundle) -> EtlResult<String> {
    let link = bundle.next_link().ok_or_else(|| {
        etl_error!(ErrorKind::NoNextLink, "bundle carries no next link")
    })?;

    let url = Url::parse(link).map_err(|e| {
        etl_error!(
            ErrorKind::MalformedLink,
            "next link is not a valid url",
            link.to_string()
        )
        .with_source(e)
    })?;

    let token = url
        .query_pairs()
        .find(|(key, _)| key == "_getpages")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            etl_error!(
                ErrorKind::MissingGetpagesParam,
                "next link has no _getpages parameter",
                link.to_string()
            )
        })?;

    Ok(format!("_getpages={token}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle_with_next(url: Option<&str>) -> Bundle {
        let mut links = vec![json!({"relation": "self", "url": "http://fhir/Patient"})];
        if let Some(url) = url {
            links.push(json!({"relation": "next", "url": url}));
        }
        serde_json::from_value(json!({"link": links})).unwrap()
    }

    #[test]
    fn test_find_base_search_url_extracts_token() {
        let bundle = bundle_with_next(Some(
            "http://fhir?_getpages=0b317b93-b0c3-4b17-a1a8-5a0f44d43c1c&_getpagesoffset=2&_count=2",
        ));

        assert_eq!(
            find_base_search_url(&bundle).unwrap(),
            "_getpages=0b317b93-b0c3-4b17-a1a8-5a0f44d43c1c"
        );
    }

    #[test]
    fn test_find_base_search_url_no_next_link() {
        let bundle = bundle_with_next(None);
        let error = find_base_search_url(&bundle).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NoNextLink);
    }

    #[test]
    fn test_find_base_search_url_malformed_link() {
        let bundle = bundle_with_next(Some("::not a url::"));
        let error = find_base_search_url(&bundle).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MalformedLink);
    }

    #[test]
    fn test_find_base_search_url_missing_getpages() {
        let bundle = bundle_with_next(Some("http://fhir?_count=10&_getpagesoffset=0"));
        let error = find_base_search_url(&bundle).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingGetpagesParam);
    }
}
