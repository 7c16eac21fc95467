//! Where documents come from.
//!
//! The archive itself sits behind an authenticated session that is set up
//! outside this program. We consume the session as a cookie file and talk to
//! a small JSON API: one record per document, one image per page token, and
//! an optional rendered PDF.

use std::{collections::BTreeMap, time::Duration};

use reqwest::{
    Url,
    header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue},
};

use crate::{
    async_utils::io::read_json,
    prelude::*,
    retry::{
        AttemptResult, retry_result_ok, try_fatal, try_potentially_transient,
        try_retry_result, with_timeout,
    },
};

/// One page of a document, as listed by the archive.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PageToken {
    pub page_num: u32,
    /// Opaque token used to fetch the page image.
    pub token: String,
}

/// A document's page list and baseline transcription.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub pages: Vec<PageToken>,
    /// The archive's own OCR text, keyed by page number.
    #[serde(default)]
    pub baseline_text: BTreeMap<u32, String>,
}

impl DocumentRecord {
    /// Reject records we cannot safely turn into page units.
    pub fn validate(&self) -> Result<()> {
        if self.pages.is_empty() {
            return Err(anyhow!("document {} has no pages", self.doc_id));
        }
        let mut previous = 0;
        for page in &self.pages {
            if page.page_num <= previous {
                return Err(anyhow!(
                    "document {} has page {} after page {}",
                    self.doc_id,
                    page.page_num,
                    previous
                ));
            }
            previous = page.page_num;
        }
        Ok(())
    }

    /// Render the baseline text with `--- Page N ---` markers, or `None` if
    /// the archive had no text for this document.
    pub fn baseline_document(&self) -> Option<String> {
        let mut out = String::new();
        for (page_num, text) in &self.baseline_text {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            out.push_str(&format!("--- Page {page_num} ---\n{text}\n\n"));
        }
        (!out.is_empty()).then_some(out)
    }
}

/// A downloaded file body.
#[derive(Clone, Debug)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetches documents from the archive. Each call is a single attempt; the
/// executor decides whether to try again.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    async fn fetch_record(&self, doc_id: &str) -> AttemptResult<DocumentRecord>;

    async fn fetch_page_image(&self, doc_id: &str, page: &PageToken)
    -> AttemptResult<Payload>;

    async fn fetch_pdf(&self, doc_id: &str) -> AttemptResult<Payload>;
}

/// A [`DocumentSource`] backed by the archive's HTTP API.
pub struct HttpDocumentSource {
    client: reqwest::Client,
    base_url: Url,
    request_timeout: Option<Duration>,
    pdf_timeout: Option<Duration>,
}

impl HttpDocumentSource {
    /// Create a client. `cookies_file` holds a JSON object mapping cookie
    /// names to values, exported from a logged-in browser session.
    pub async fn new(
        base_url: &str,
        cookies_file: Option<&Path>,
        request_timeout: Option<Duration>,
        pdf_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .with_context(|| format!("invalid archive URL: {:?}", base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(cookies_file) = cookies_file {
            let cookies: BTreeMap<String, String> = read_json(cookies_file)
                .await
                .context("could not load archive session cookies")?;
            let header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&header).context("invalid cookie value")?,
            );
            debug!(count = cookies.len(), "loaded session cookies");
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("could not create HTTP client")?;
        Ok(Self {
            client,
            base_url,
            request_timeout,
            pdf_timeout,
        })
    }

    /// `base/documents/<doc_id>/<rest...>`, with each segment escaped.
    fn document_url(&self, doc_id: &str, rest: &[&str]) -> Result<Url> {
        let mut url = self.base_url.join("documents/")?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("archive URL cannot have a path: {}", self.base_url))?
            .pop_if_empty()
            .push(doc_id)
            .extend(rest);
        Ok(url)
    }

    async fn get(&self, url: Url, timeout: Option<Duration>) -> AttemptResult<Payload> {
        trace!(%url, "GET");
        let client = &self.client;
        let result = with_timeout(timeout, async {
            let response = client.get(url).send().await?.error_for_status()?;
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>(Payload {
                bytes: bytes.to_vec(),
                content_type,
            })
        })
        .await;
        retry_result_ok(try_potentially_transient!(result))
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_record(&self, doc_id: &str) -> AttemptResult<DocumentRecord> {
        let url = try_fatal!(self.document_url(doc_id, &[]));
        let payload = try_retry_result!(self.get(url, self.request_timeout).await);
        let record = try_fatal!(
            serde_json::from_slice::<DocumentRecord>(&payload.bytes)
                .with_context(|| format!("malformed record for document {doc_id}"))
        );
        retry_result_ok(record)
    }

    #[instrument(level = "debug", skip(self, page), fields(page = page.page_num))]
    async fn fetch_page_image(
        &self,
        doc_id: &str,
        page: &PageToken,
    ) -> AttemptResult<Payload> {
        let url = try_fatal!(self.document_url(doc_id, &["pages", &page.token]));
        self.get(url, self.request_timeout).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch_pdf(&self, doc_id: &str) -> AttemptResult<Payload> {
        let url = try_fatal!(self.document_url(doc_id, &["pdf"]));
        self.get(url, self.pdf_timeout).await
    }
}
