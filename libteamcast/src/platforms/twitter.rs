//! Twitter / X adapter
//!
//! OAuth 2.0 authorization code flow with PKCE (S256), the v2 tweet and user
//! endpoints, and v1.1 media upload for attachments.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::http::{build_client, check, header_u64, read_json, transport_error};
use super::{Pkce, PlatformAdapter, PlatformResult};
use crate::accounts::Credentials;
use crate::config::TwitterConfig;
use crate::error::{PlatformError, Result};
use crate::types::{
    AccountType, Analytics, Content, Platform, ProfileInfo, PublishResult, RateLimitStatus,
};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
    name: Option<String>,
    profile_image_url: Option<String>,
    verified_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TweetMetrics {
    public_metrics: PublicMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    quote_count: u64,
    #[serde(default)]
    bookmark_count: u64,
    #[serde(default)]
    impression_count: u64,
}

#[derive(Debug, Deserialize)]
struct UploadedMedia {
    media_id_string: String,
}

pub struct TwitterAdapter {
    client: Client,
    config: TwitterConfig,
}

impl TwitterAdapter {
    pub fn new(config: TwitterConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            config,
        })
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> PlatformResult<Credentials> {
        let response = self
            .client
            .post(format!("{}/2/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;
        let token: TokenResponse = read_json(check(response).await?).await?;

        let mut credentials = Credentials::new(token.access_token, "");
        if let Some(refresh) = token.refresh_token {
            credentials = credentials.with_refresh_token(refresh);
        }
        if let Some(expires_in) = token.expires_in {
            let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
            credentials = credentials.with_expiry(expires_at);
        }
        if let Some(scope) = token.scope {
            credentials = credentials.with_scopes(scope.split_whitespace());
        }
        Ok(credentials)
    }

    async fn me(&self, credentials: &Credentials) -> PlatformResult<User> {
        let response = self
            .client
            .get(format!("{}/2/users/me", self.config.api_base))
            .query(&[("user.fields", "profile_image_url,verified_type")])
            .bearer_auth(credentials.access_token.expose())
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: Envelope<User> = read_json(check(response).await?).await?;
        Ok(envelope.data)
    }

    async fn upload_media(&self, credentials: &Credentials, url: &str) -> PlatformResult<String> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let bytes = check(response).await?.bytes().await.map_err(transport_error)?;

        let response = self
            .client
            .post(format!("{}/1.1/media/upload.json", self.config.upload_base))
            .bearer_auth(credentials.access_token.expose())
            .form(&[("media_data", STANDARD.encode(&bytes))])
            .send()
            .await
            .map_err(transport_error)?;
        let media: UploadedMedia = read_json(check(response).await?).await?;
        debug!(media_id = %media.media_id_string, "uploaded media to twitter");
        Ok(media.media_id_string)
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn default_scopes(&self) -> Vec<String> {
        self.config.scopes.clone()
    }

    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        pkce: &Pkce,
    ) -> PlatformResult<String> {
        let challenge = pkce.challenge();
        let scope = scopes.join(" ");
        let url = Url::parse_with_params(
            &format!("{}/i/oauth2/authorize", self.config.auth_base),
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| PlatformError::Validation(format!("invalid authorize url: {e}")))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, pkce: &Pkce) -> PlatformResult<Credentials> {
        let mut credentials = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_verifier", pkce.verifier()),
                ("client_id", self.config.client_id.as_str()),
            ])
            .await?;
        credentials.platform_user_id = self.me(&credentials).await?.id;
        Ok(credentials)
    }

    async fn refresh_token(&self, credentials: &Credentials) -> PlatformResult<Credentials> {
        let refresh = credentials.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::RefreshNotSupported(
                "no refresh token was granted (offline.access scope missing)".to_string(),
            )
        })?;
        let refreshed = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.expose()),
                ("client_id", self.config.client_id.as_str()),
            ])
            .await
            .map_err(|e| match e {
                // an invalid_grant on refresh means the grant itself is gone
                PlatformError::Rejected { body, .. } | PlatformError::TokenExpired(body) => {
                    PlatformError::Authentication(body)
                }
                other => other,
            })?;
        Ok(refreshed.carry_forward(credentials))
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> PlatformResult<bool> {
        match self.me(credentials).await {
            Ok(user) => {
                let expected = &credentials.platform_user_id;
                Ok(expected.is_empty() || user.id == *expected)
            }
            Err(PlatformError::TokenExpired(_) | PlatformError::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch_profile(&self, credentials: &Credentials) -> PlatformResult<ProfileInfo> {
        let user = self.me(credentials).await?;
        let account_type = match user.verified_type.as_deref() {
            Some("business") | Some("government") => AccountType::Business,
            _ => AccountType::Personal,
        };
        Ok(ProfileInfo {
            profile_url: Some(format!("https://x.com/{}", user.username)),
            username: user.username,
            display_name: user.name,
            avatar_url: user.profile_image_url,
            account_type,
        })
    }

    async fn publish(
        &self,
        credentials: &Credentials,
        content: &Content,
    ) -> PlatformResult<PublishResult> {
        self.validate_content(content)?;

        let mut media_ids = Vec::with_capacity(content.media_urls.len());
        for url in &content.media_urls {
            media_ids.push(self.upload_media(credentials, url).await?);
        }

        let mut body = json!({ "text": content.text });
        if !media_ids.is_empty() {
            body["media"] = json!({ "media_ids": media_ids });
        }

        let response = self
            .client
            .post(format!("{}/2/tweets", self.config.api_base))
            .bearer_auth(credentials.access_token.expose())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let created: Envelope<CreatedTweet> = read_json(check(response).await?).await?;

        Ok(PublishResult {
            url: format!("https://x.com/i/web/status/{}", created.data.id),
            platform_post_id: created.data.id,
            published_at: Utc::now(),
        })
    }

    async fn fetch_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> PlatformResult<Analytics> {
        let response = self
            .client
            .get(format!("{}/2/tweets/{}", self.config.api_base, platform_post_id))
            .query(&[("tweet.fields", "public_metrics")])
            .bearer_auth(credentials.access_token.expose())
            .send()
            .await
            .map_err(transport_error)?;
        let tweet: Envelope<TweetMetrics> = read_json(check(response).await?).await?;
        let m = tweet.data.public_metrics;

        Ok(Analytics {
            impressions: m.impression_count,
            likes: m.like_count,
            comments: m.reply_count,
            shares: m.retweet_count + m.quote_count,
            clicks: 0,
            engagements: m.like_count
                + m.reply_count
                + m.retweet_count
                + m.quote_count
                + m.bookmark_count,
        })
    }

    async fn fetch_rate_limits(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<RateLimitStatus> {
        let response = self
            .client
            .get(format!("{}/2/users/me", self.config.api_base))
            .bearer_auth(credentials.access_token.expose())
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        let headers = response.headers();

        Ok(RateLimitStatus {
            limit: header_u64(headers, "x-rate-limit-limit").map(|v| v as u32),
            remaining: header_u64(headers, "x-rate-limit-remaining").map(|v| v as u32),
            resets_at: header_u64(headers, "x-rate-limit-reset")
                .and_then(|epoch| chrono::DateTime::from_timestamp(epoch as i64, 0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::http::test_server::{serve, Canned};
    use super::*;

    const VERIFIER: &str = "dBjftJeZ4CVP-mJ92IGnfOGnTP5XHo63PcrR0lAwvNxQ";

    fn adapter(base: &str) -> TwitterAdapter {
        TwitterAdapter::new(
            TwitterConfig {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                redirect_uri: "https://app.example.com/callback".to_string(),
                scopes: vec!["tweet.write".to_string(), "offline.access".to_string()],
                api_base: base.to_string(),
                auth_base: "https://twitter.com".to_string(),
                upload_base: base.to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_authorization_url() {
        let adapter = adapter("https://api.twitter.com");
        let url = adapter
            .authorization_url(
                "state-123",
                &["tweet.read".to_string(), "tweet.write".to_string()],
                &Pkce::from_verifier(VERIFIER),
            )
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/i/oauth2/authorize");

        let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["scope"], "tweet.read tweet.write");
        assert_eq!(params["state"], "state-123");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], "qCboChJHqPn2J6PU6Cbf3iIb5REo5LrzS63gUWhlnrA");
        assert_eq!(params["redirect_uri"], "https://app.example.com/callback");
    }

    #[tokio::test]
    async fn test_publish_rejects_long_text_without_request() {
        // nothing listens here; a request would fail with a network error
        let adapter = adapter("http://127.0.0.1:9");
        let credentials = Credentials::new("token", "1");
        let err = adapter
            .publish(&credentials, &Content::text("a".repeat(281)))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
    }

    #[tokio::test]
    async fn test_exchange_code_and_publish() {
        let (base, mut requests) = serve(vec![
            Canned::json(
                200,
                concat!(
                    r#"{"token_type":"bearer","access_token":"at-1","refresh_token":"rt-1","#,
                    r#""expires_in":7200,"scope":"tweet.write offline.access"}"#,
                ),
            ),
            Canned::json(200, r#"{"data":{"id":"2244994945","username":"acme","name":"Acme"}}"#),
            Canned::json(201, r#"{"data":{"id":"1790000000000000001","text":"hello"}}"#),
        ])
        .await;
        let adapter = adapter(&base);

        let credentials = adapter
            .exchange_code("auth-code", &Pkce::from_verifier(VERIFIER))
            .await
            .unwrap();
        assert_eq!(credentials.access_token.expose(), "at-1");
        assert_eq!(credentials.refresh_token.as_ref().unwrap().expose(), "rt-1");
        assert_eq!(credentials.platform_user_id, "2244994945");
        assert_eq!(credentials.scopes, vec!["tweet.write", "offline.access"]);
        assert!(credentials.expires_at.is_some());

        let token_request = requests.recv().await.unwrap();
        assert!(token_request.starts_with("POST /2/oauth2/token"));
        assert!(token_request.contains("grant_type=authorization_code"));
        assert!(token_request.contains(&format!("code_verifier={VERIFIER}")));
        let me_request = requests.recv().await.unwrap();
        assert!(me_request
            .to_ascii_lowercase()
            .contains("authorization: bearer at-1"));

        let result = adapter.publish(&credentials, &Content::text("hello")).await.unwrap();
        assert_eq!(result.platform_post_id, "1790000000000000001");
        assert_eq!(result.url, "https://x.com/i/web/status/1790000000000000001");

        let tweet_request = requests.recv().await.unwrap();
        assert!(tweet_request.starts_with("POST /2/tweets"));
        assert!(tweet_request.contains(r#""text":"hello""#));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let adapter = adapter("http://127.0.0.1:9");
        let err = adapter
            .refresh_token(&Credentials::new("token", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::RefreshNotSupported(_)));
        assert!(err.requires_reconnect());
    }

    #[tokio::test]
    async fn test_invalid_grant_on_refresh_requires_reconnect() {
        let (base, _requests) = serve(vec![Canned::json(
            400,
            concat!(
                r#"{"error":"invalid_request","#,
                r#""error_description":"Value passed for the token was invalid."}"#,
            ),
        )])
        .await;
        let adapter = adapter(&base);
        let err = adapter
            .refresh_token(&Credentials::new("token", "1").with_refresh_token("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_analytics_from_public_metrics() {
        let (base, _requests) = serve(vec![Canned::json(
            200,
            concat!(
                r#"{"data":{"id":"1","public_metrics":{"retweet_count":2,"reply_count":3,"#,
                r#""like_count":10,"quote_count":1,"bookmark_count":4,"impression_count":900}}}"#,
            ),
        )])
        .await;
        let analytics = adapter(&base)
            .fetch_analytics(&Credentials::new("token", "1"), "1")
            .await
            .unwrap();
        assert_eq!(analytics.impressions, 900);
        assert_eq!(analytics.likes, 10);
        assert_eq!(analytics.comments, 3);
        assert_eq!(analytics.shares, 3);
        assert_eq!(analytics.engagements, 20);
    }

    #[tokio::test]
    async fn test_rate_limit_headers() {
        let canned = Canned::json(200, r#"{"data":{"id":"1","username":"acme"}}"#)
            .with_header("x-rate-limit-limit", "75")
            .with_header("x-rate-limit-remaining", "0")
            .with_header("x-rate-limit-reset", "1893456000");
        let (base, _requests) = serve(vec![canned]).await;
        let status = adapter(&base)
            .fetch_rate_limits(&Credentials::new("token", "1"))
            .await
            .unwrap();
        assert_eq!(status.limit, Some(75));
        assert!(status.is_exhausted());
        assert_eq!(status.resets_at.unwrap().timestamp(), 1_893_456_000);
    }
}
