//! Facebook Pages adapter
//!
//! Publishing goes through a Page access token. The user's code is traded
//! for a short-lived user token, upgraded to a long-lived one, and the Page
//! token is taken from `/me/accounts`. Page tokens obtained this way do not
//! expire, so there is nothing to refresh: when one stops working the user
//! has to connect again.
//!
//! Every Graph call made with a Page token carries `appsecret_proof`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use super::http::{build_client, check, read_json, transport_error};
use super::{Pkce, PlatformAdapter, PlatformResult};
use crate::accounts::Credentials;
use crate::config::FacebookConfig;
use crate::error::{PlatformError, Result};
use crate::types::{
    AccountType, Analytics, Content, MediaMimeType, Platform, ProfileInfo, PublishResult,
    RateLimitStatus,
};

type HmacSha256 = Hmac<Sha256>;

/// Graph error codes that mean "slow down"
const THROTTLE_CODES: [i64; 4] = [4, 17, 32, 613];
/// Invalid or revoked OAuth token
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Paged<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ManagedPage {
    id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PageProfile {
    id: String,
    name: Option<String>,
    username: Option<String>,
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Insight {
    name: String,
    values: Vec<InsightValue>,
}

#[derive(Debug, Deserialize)]
struct InsightValue {
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Engagement {
    likes: Option<Summary>,
    comments: Option<Summary>,
    shares: Option<Shares>,
}

#[derive(Debug, Deserialize)]
struct Summary {
    summary: SummaryCount,
}

#[derive(Debug, Deserialize)]
struct SummaryCount {
    #[serde(default)]
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct Shares {
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    code: i64,
}

#[derive(Debug, Default, Deserialize)]
struct AppUsage {
    #[serde(default)]
    call_count: u32,
    #[serde(default)]
    total_time: u32,
    #[serde(default)]
    total_cputime: u32,
}

pub struct FacebookAdapter {
    client: Client,
    config: FacebookConfig,
}

impl FacebookAdapter {
    pub fn new(config: FacebookConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            config,
        })
    }

    fn graph_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.config.graph_base, self.config.graph_version, path)
    }

    /// HMAC-SHA256 of the access token keyed with the app secret, hex encoded
    pub fn appsecret_proof(&self, access_token: &str) -> PlatformResult<String> {
        appsecret_proof(&self.config.app_secret, access_token)
    }

    fn auth_params(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<[(&'static str, String); 2]> {
        let token = credentials.access_token.expose();
        Ok([
            ("access_token", token.to_string()),
            ("appsecret_proof", self.appsecret_proof(token)?),
        ])
    }

    async fn graph_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        credentials: &Credentials,
    ) -> PlatformResult<T> {
        let response = self
            .client
            .get(self.graph_url(path))
            .query(query)
            .query(&self.auth_params(credentials)?)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(graph_check(response).await?).await
    }

    async fn graph_post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        credentials: &Credentials,
    ) -> PlatformResult<T> {
        let mut fields: Vec<(&str, String)> = form.to_vec();
        fields.extend(self.auth_params(credentials)?);
        let response = self
            .client
            .post(self.graph_url(path))
            .form(&fields)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(graph_check(response).await?).await
    }

    async fn oauth_token(&self, query: &[(&str, &str)]) -> PlatformResult<String> {
        let response = self
            .client
            .get(self.graph_url("oauth/access_token"))
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        let token: AccessToken = read_json(graph_check(response).await?).await?;
        Ok(token.access_token)
    }

    fn choose_page(&self, pages: Vec<ManagedPage>) -> PlatformResult<ManagedPage> {
        match &self.config.page_id {
            Some(page_id) => pages.into_iter().find(|p| &p.id == page_id).ok_or_else(|| {
                PlatformError::Authentication(format!("user does not manage page {page_id}"))
            }),
            None => pages
                .into_iter()
                .next()
                .ok_or_else(|| PlatformError::Authentication("user manages no pages".to_string())),
        }
    }

    async fn publish_video(
        &self,
        credentials: &Credentials,
        content: &Content,
        url: &str,
    ) -> PlatformResult<String> {
        let page = &credentials.platform_user_id;
        let created: Created = self
            .graph_post(
                &format!("{page}/videos"),
                &[("file_url", url.to_string()), ("description", content.text.clone())],
                credentials,
            )
            .await?;
        Ok(created.id)
    }

    async fn publish_feed(
        &self,
        credentials: &Credentials,
        content: &Content,
    ) -> PlatformResult<String> {
        let page = &credentials.platform_user_id;

        // photos are uploaded unpublished, then attached to a single feed post
        let mut photo_ids = Vec::with_capacity(content.media_urls.len());
        for url in &content.media_urls {
            let photo: Created = self
                .graph_post(
                    &format!("{page}/photos"),
                    &[("url", url.clone()), ("published", "false".to_string())],
                    credentials,
                )
                .await?;
            debug!(photo_id = %photo.id, "uploaded unpublished photo");
            photo_ids.push(photo.id);
        }

        let keys: Vec<String> = (0..photo_ids.len())
            .map(|i| format!("attached_media[{i}]"))
            .collect();
        let mut form = vec![("message", content.text.clone())];
        for (key, id) in keys.iter().zip(photo_ids) {
            form.push((key.as_str(), json!({ "media_fbid": id }).to_string()));
        }

        let created: Created = self.graph_post(&format!("{page}/feed"), &form, credentials).await?;
        Ok(created.id)
    }
}

pub(crate) fn appsecret_proof(app_secret: &str, access_token: &str) -> PlatformResult<String> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .map_err(|e| PlatformError::Validation(format!("invalid app secret: {e}")))?;
    mac.update(access_token.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Like [`check`], but reads Graph error codes out of the body
async fn graph_check(response: Response) -> PlatformResult<Response> {
    check(response).await.map_err(remap_graph_error)
}

fn remap_graph_error(error: PlatformError) -> PlatformError {
    let body = match &error {
        PlatformError::Rejected { body, .. }
        | PlatformError::Server { body, .. }
        | PlatformError::TokenExpired(body) => body,
        _ => return error,
    };
    let code = match serde_json::from_str::<GraphErrorBody>(body) {
        Ok(parsed) => parsed.error.code,
        Err(_) => return error,
    };
    if THROTTLE_CODES.contains(&code) {
        PlatformError::RateLimit {
            message: body.clone(),
            retry_after: None,
        }
    } else if code == INVALID_TOKEN_CODE {
        PlatformError::Authentication(body.clone())
    } else {
        error
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    fn default_scopes(&self) -> Vec<String> {
        self.config.scopes.clone()
    }

    // the code exchange is authenticated with the app secret, so no PKCE
    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        _pkce: &Pkce,
    ) -> PlatformResult<String> {
        let scope = scopes.join(",");
        let url = Url::parse_with_params(
            &format!("{}/{}/dialog/oauth", self.config.dialog_base, self.config.graph_version),
            &[
                ("client_id", self.config.app_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("state", state),
                ("scope", scope.as_str()),
                ("response_type", "code"),
            ],
        )
        .map_err(|e| PlatformError::Validation(format!("invalid dialog url: {e}")))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, _pkce: &Pkce) -> PlatformResult<Credentials> {
        let short_lived = self
            .oauth_token(&[
                ("client_id", self.config.app_id.as_str()),
                ("client_secret", self.config.app_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code", code),
            ])
            .await?;
        let long_lived = self
            .oauth_token(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.config.app_id.as_str()),
                ("client_secret", self.config.app_secret.as_str()),
                ("fb_exchange_token", short_lived.as_str()),
            ])
            .await?;

        let user = Credentials::new(long_lived, "");
        let pages: Paged<ManagedPage> = self
            .graph_get("me/accounts", &[("fields", "id,access_token")], &user)
            .await?;
        let page = self.choose_page(pages.data)?;

        Ok(Credentials::new(page.access_token, page.id).with_scopes(self.config.scopes.clone()))
    }

    async fn refresh_token(&self, _credentials: &Credentials) -> PlatformResult<Credentials> {
        Err(PlatformError::RefreshNotSupported(
            "facebook page tokens cannot be refreshed; reconnect the page".to_string(),
        ))
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> PlatformResult<bool> {
        match self.graph_get::<PageProfile>("me", &[("fields", "id")], credentials).await {
            Ok(me) => Ok(me.id == credentials.platform_user_id),
            Err(PlatformError::Authentication(_) | PlatformError::TokenExpired(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch_profile(&self, credentials: &Credentials) -> PlatformResult<ProfileInfo> {
        let page: PageProfile = self
            .graph_get(
                &credentials.platform_user_id,
                &[("fields", "id,name,username,link")],
                credentials,
            )
            .await?;
        Ok(ProfileInfo {
            username: page.username.clone().unwrap_or_else(|| page.id.clone()),
            display_name: page.name,
            avatar_url: Some(self.graph_url(&format!("{}/picture", page.id))),
            profile_url: page.link,
            account_type: AccountType::Page,
        })
    }

    async fn publish(
        &self,
        credentials: &Credentials,
        content: &Content,
    ) -> PlatformResult<PublishResult> {
        self.validate_content(content)?;

        let video = content
            .media_urls
            .iter()
            .find(|url| MediaMimeType::from_url(url).is_some_and(|m| m.is_video()));
        let id = match video {
            Some(url) if content.media_urls.len() == 1 => {
                self.publish_video(credentials, content, url).await?
            }
            Some(_) => {
                return Err(PlatformError::Validation(
                    "facebook videos cannot be combined with other media".to_string(),
                ))
            }
            None => self.publish_feed(credentials, content).await?,
        };

        Ok(PublishResult {
            url: format!("https://www.facebook.com/{id}"),
            platform_post_id: id,
            published_at: Utc::now(),
        })
    }

    async fn fetch_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> PlatformResult<Analytics> {
        let insights: Paged<Insight> = self
            .graph_get(
                &format!("{platform_post_id}/insights"),
                &[("metric", "post_impressions,post_clicks,post_engaged_users")],
                credentials,
            )
            .await?;
        let engagement: Engagement = self
            .graph_get(
                platform_post_id,
                &[(
                    "fields",
                    "likes.summary(true).limit(0),comments.summary(true).limit(0),shares",
                )],
                credentials,
            )
            .await?;

        let metric = |name: &str| {
            insights
                .data
                .iter()
                .find(|i| i.name == name)
                .and_then(|i| i.values.first())
                .and_then(|v| v.value.as_u64())
                .unwrap_or(0)
        };

        Ok(Analytics {
            impressions: metric("post_impressions"),
            clicks: metric("post_clicks"),
            engagements: metric("post_engaged_users"),
            likes: engagement.likes.map(|s| s.summary.total_count).unwrap_or(0),
            comments: engagement.comments.map(|s| s.summary.total_count).unwrap_or(0),
            shares: engagement.shares.map(|s| s.count).unwrap_or(0),
        })
    }

    async fn fetch_rate_limits(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<RateLimitStatus> {
        let response = self
            .client
            .get(self.graph_url("me"))
            .query(&[("fields", "id")])
            .query(&self.auth_params(credentials)?)
            .send()
            .await
            .map_err(transport_error)?;
        let response = graph_check(response).await?;

        // usage is reported as percentages of the app's hourly allowance
        let usage = response
            .headers()
            .get("x-app-usage")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<AppUsage>(v).ok());
        Ok(match usage {
            Some(usage) => {
                let used = usage.call_count.max(usage.total_time).max(usage.total_cputime).min(100);
                RateLimitStatus {
                    limit: Some(100),
                    remaining: Some(100 - used),
                    resets_at: None,
                }
            }
            None => RateLimitStatus::unknown(),
        })
    }
}
