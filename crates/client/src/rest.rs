//! Thin authenticated REST transport.
//!
//! All HTTP traffic funnels through here: requests are decorated by the
//! auth manager (bearer header or cookie jar), success envelopes are
//! unwrapped, and failure envelopes become [`Error::Api`].

use reqwest::RequestBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use pictor_protocol::rest::ApiErrorResponse;

use crate::auth::AuthManager;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct RestClient {
    base_url: Url,
    http: reqwest::Client,
    auth: AuthManager,
}

impl RestClient {
    pub(crate) fn new(base_url: Url, auth: AuthManager) -> Result<Self> {
        // The cookie jar carries the session for cookie-mode auth and is
        // harmless in token mode.
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self { base_url, http, auth })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path)?;
        self.execute(path, self.http.get(url).query(query)).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.base_url.join(path)?;
        self.execute(path, self.http.post(url).json(body)).await
    }

    async fn execute<T>(&self, path: &str, builder: RequestBuilder) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let builder = self.auth.authenticate_request(builder).await?;
        let response = builder.send().await?;
        let status = response.status();
        debug!(target: "pictor.rest", %path, status = status.as_u16(), "api response");
        if !status.is_success() {
            let payload = response.json::<ApiErrorResponse>().await.unwrap_or_else(|_| {
                ApiErrorResponse {
                    status: "error".into(),
                    message: format!("request failed with status {}", status.as_u16()),
                    error_code: 0,
                }
            });
            return Err(Error::api(status.as_u16(), payload));
        }
        Ok(response.json().await?)
    }
}
