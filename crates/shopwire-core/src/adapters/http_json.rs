use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::credentials::CredentialSource;
use crate::data_source::{DetailsRequest, ProductSource, SearchRequest, SourceError, SourceFuture};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, ReqwestHttpClient};
use crate::{ProductRecord, ProviderId, ValidationError};

#[derive(Debug, Deserialize)]
struct SearchPayload {
    #[serde(default)]
    products: Vec<ProductPayload>,
}

#[derive(Debug, Deserialize)]
struct ProductPayload {
    id: String,
    name: String,
    price: Option<f64>,
    currency: Option<String>,
    in_stock: Option<bool>,
    url: Option<String>,
    image_url: Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, serde_json::Value>,
}

fn normalize(source: &ProviderId, payload: ProductPayload) -> Result<ProductRecord, SourceError> {
    let invalid = |error: ValidationError| {
        SourceError::decoding(format!("invalid product from '{source}': {error}"))
            .with_provider(source.clone())
    };

    let mut record =
        ProductRecord::new(source.clone(), payload.id, payload.name).map_err(invalid)?;
    if let (Some(price), Some(currency)) = (payload.price, payload.currency.as_deref()) {
        record = record.with_price(price, currency).map_err(invalid)?;
    }
    if let Some(in_stock) = payload.in_stock {
        record = record.with_stock(in_stock);
    }
    if let Some(url) = payload.url {
        record = record.with_url(url);
    }
    record.image_url = payload.image_url;
    record.attributes = payload.attributes;
    Ok(record)
}

/// Adapter for endpoints that already serve products in the common JSON shape.
///
/// `GET {base}/search?q=<query>` answers `{"products": [...]}` and
/// `GET {base}/products/<id>` answers a single product object.
#[derive(Clone)]
pub struct JsonApiSource {
    id: ProviderId,
    base_url: String,
    api_key_header: Option<String>,
    timeout: Duration,
    http_client: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialSource>,
}

impl JsonApiSource {
    pub fn new(
        id: ProviderId,
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            id,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key_header: None,
            timeout: Duration::from_secs(5),
            http_client: Arc::new(ReqwestHttpClient::new()),
            credentials,
        }
    }

    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = http_client;
        self
    }

    /// Sends the key in `name` instead of a bearer authorization header.
    pub fn with_api_key_header(mut self, name: impl Into<String>) -> Self {
        self.api_key_header = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get_json<T>(&self, request: HttpRequest) -> Result<T, SourceError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let credential = self.credentials.credential(&self.id)?;
        let auth = match &self.api_key_header {
            Some(name) => HttpAuth::Header {
                name: name.clone(),
                value: credential,
            },
            None => HttpAuth::BearerToken(credential),
        };

        let request = request
            .with_header("accept", "application/json")
            .with_auth(&auth)
            .with_timeout(self.timeout);
        debug!(provider = %self.id, url = %request.url, "calling provider");

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|error| SourceError::from(error).with_provider(self.id.clone()))?;
        if !response.is_success() {
            return Err(response.status_error().with_provider(self.id.clone()));
        }

        serde_json::from_str(&response.body).map_err(|error| {
            SourceError::decoding(format!("malformed response from '{}': {error}", self.id))
                .with_provider(self.id.clone())
        })
    }
}

impl std::fmt::Debug for JsonApiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonApiSource")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("api_key_header", &self.api_key_header)
            .finish_non_exhaustive()
    }
}

impl ProductSource for JsonApiSource {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn search<'a>(&'a self, req: SearchRequest) -> SourceFuture<'a, Vec<ProductRecord>> {
        Box::pin(async move {
            let request = HttpRequest::get(format!("{}/search", self.base_url))
                .with_query("q", req.query.trim());
            let payload: SearchPayload = self.get_json(request).await?;
            payload
                .products
                .into_iter()
                .map(|product| normalize(&self.id, product))
                .collect()
        })
    }

    fn details<'a>(&'a self, req: DetailsRequest) -> SourceFuture<'a, ProductRecord> {
        Box::pin(async move {
            let request = HttpRequest::get(format!(
                "{}/products/{}",
                self.base_url,
                urlencoding::encode(req.id.trim())
            ));
            let payload: ProductPayload = self.get_json(request).await?;
            normalize(&self.id, payload)
        })
    }
}
