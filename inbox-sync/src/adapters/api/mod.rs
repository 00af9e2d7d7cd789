//! REST collaborator
//!
//! The sync engine only needs six calls from the server. They sit behind
//! [`InboxApi`] so the session can run against the real HTTP endpoint or an
//! in-memory double in tests.

pub mod credentials;
#[cfg(test)]
pub(crate) mod mock;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub use credentials::CredentialProvider;

use crate::config::AppConfig;
use crate::sync::codec::{
    encode, ConversationPatch, CreateCommentRequest, CreateMessageRequest, CreatedMessage,
    OutboundCommand,
};
use crate::types::error::{InboxError, Result};
use crate::types::{Comment, Conversation};

pub trait InboxApi: Send + Sync + 'static {
    fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> impl Future<Output = Result<CreatedMessage>> + Send;

    fn create_comment(
        &self,
        request: CreateCommentRequest,
    ) -> impl Future<Output = Result<Comment>> + Send;

    fn update_conversation(
        &self,
        conversation_id: String,
        patch: ConversationPatch,
    ) -> impl Future<Output = Result<Conversation>> + Send;

    /// Current conversations for the tenant, newest first
    fn list_conversations(&self) -> impl Future<Output = Result<Vec<Conversation>>> + Send;

    /// The conversation owning `thread_id`, if the server knows it
    fn fetch_conversation(
        &self,
        thread_id: String,
    ) -> impl Future<Output = Result<Option<Conversation>>> + Send;

    fn list_comments(&self, message_id: String) -> impl Future<Output = Result<Vec<Comment>>> + Send;

    /// Point subsequent calls at another tenant
    fn set_tenant(&self, _tenant_id: &str) {}
}

/// Either a bare array or a paginated `{ results, next }` page
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Page {
        results: Vec<T>,
        #[serde(default)]
        next: Option<String>,
    },
    Plain(Vec<T>),
}

impl<T> Listing<T> {
    fn into_parts(self) -> (Vec<T>, Option<String>) {
        match self {
            Listing::Page { results, next } => (results, next),
            Listing::Plain(items) => (items, None),
        }
    }
}

/// Safety valve against servers that keep returning a `next` link
const MAX_PAGES: usize = 100;

pub struct HttpInboxApi {
    client: reqwest::Client,
    base_url: Url,
    tenant: RwLock<String>,
    credentials: Box<dyn CredentialProvider>,
}

impl HttpInboxApi {
    pub fn new(
        base_url: &str,
        tenant_id: &str,
        credentials: impl CredentialProvider + 'static,
        timeout: Duration,
    ) -> Result<Self> {
        // Url::join drops the last segment unless the base ends with a slash
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&base)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InboxError::Network(format!("HTTP client error: {}", e)))?;

        info!("REST collaborator at {}", base_url);

        Ok(Self {
            client,
            base_url,
            tenant: RwLock::new(tenant_id.to_string()),
            credentials: Box::new(credentials),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(
            &config.session.api_base_url,
            &config.session.tenant_id,
            config.session.token.clone(),
            config.http.timeout(),
        )
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.join(path)?;
        {
            let tenant = self.tenant.read().unwrap_or_else(PoisonError::into_inner);
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("tenant", &tenant);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let token = self.credentials.bearer_token()?;
        let response = request.bearer_auth(token).send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(InboxError::Auth(format!("{} rejected: {}", what, status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InboxError::Network(format!(
                "{} failed: {} - {}",
                what, status, text
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| InboxError::Parse(format!("Failed to parse {} response: {}", what, e)))
    }

    async fn list_all<T: DeserializeOwned>(&self, first: Url, what: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first);
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(InboxError::Consistency(format!(
                    "{} exceeded {} pages",
                    what, MAX_PAGES
                )));
            }
            let listing: Listing<T> = self.send(self.client.get(url), what).await?;
            let (page, link) = listing.into_parts();
            items.extend(page);
            next = link.map(|l| Url::parse(&l)).transpose()?;
        }

        debug!("{}: {} item(s) in {} page(s)", what, items.len(), pages);
        Ok(items)
    }
}

impl InboxApi for HttpInboxApi {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<CreatedMessage> {
        let url = self.endpoint("messages/", &[])?;
        let body = encode(&OutboundCommand::CreateMessage(request))?;
        self.send(self.client.post(url).json(&body), "create message")
            .await
    }

    async fn create_comment(&self, request: CreateCommentRequest) -> Result<Comment> {
        let url = self.endpoint("comments/", &[])?;
        let body = encode(&OutboundCommand::CreateComment(request))?;
        self.send(self.client.post(url).json(&body), "create comment")
            .await
    }

    async fn update_conversation(
        &self,
        conversation_id: String,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        let url = self.endpoint(&format!("conversations/{}/", conversation_id), &[])?;
        let body = encode(&OutboundCommand::UpdateConversation {
            conversation_id,
            patch,
        })?;
        self.send(self.client.patch(url).json(&body), "update conversation")
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let url = self.endpoint("conversations/", &[])?;
        self.list_all(url, "list conversations").await
    }

    async fn fetch_conversation(&self, thread_id: String) -> Result<Option<Conversation>> {
        let url = self.endpoint("conversations/", &[("thread_id", thread_id.as_str())])?;
        let listing: Listing<Conversation> = self.send(self.client.get(url), "fetch conversation").await?;
        let (found, _) = listing.into_parts();
        Ok(found.into_iter().find(|c| c.thread_id == thread_id))
    }

    async fn list_comments(&self, message_id: String) -> Result<Vec<Comment>> {
        let url = self.endpoint("comments/", &[("message_id", message_id.as_str())])?;
        self.list_all(url, "list comments").await
    }

    fn set_tenant(&self, tenant_id: &str) {
        *self.tenant.write().unwrap_or_else(PoisonError::into_inner) = tenant_id.to_string();
    }
}
