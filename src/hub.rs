use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::cast::PROTOCOL_EPOCH;
use crate::error::{Error, Result};

pub const DEFAULT_HUB_URL: &str = "https://hub.pinata.cloud";
const API_KEY_HEADER: &str = "x-api-key";
const EVENT_SEQUENCE_BITS: u32 = 12;

/// A post as the hub delivers it, before any lemon3 interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPost {
    pub author_id: u64,
    pub hash: String,
    pub timestamp: u32,
    pub text: String,
    pub embeds: Vec<String>,
    pub mentions: Vec<u64>,
    pub mention_positions: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PostsPage {
    pub posts: Vec<RawPost>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    CastAdded(RawPost),
    LinkAdded { fid: u64, target_fid: u64 },
    LinkRemoved { fid: u64, target_fid: u64 },
    /// A merged message lemon3 has no interest in.
    Other,
    /// Nothing new arrived during one poll window.
    Idle,
}

pub trait EventStream: Send {
    /// `Ok(None)` is a clean end of stream.
    fn next_event(&mut self) -> Result<Option<HubEvent>>;
}

pub trait Hub: Send + Sync {
    fn resolve_author_id(&self, handle: &str) -> Result<u64>;
    fn posts_page(
        &self,
        author_id: u64,
        page_token: Option<&str>,
        page_size: u32,
        reverse: bool,
    ) -> Result<PostsPage>;
    fn get_post(&self, author_id: u64, hash: &str) -> Result<RawPost>;
    /// The fname an author is addressed by (`@name`), empty when unset.
    fn display_name(&self, fid: u64) -> Result<String>;
    fn following(&self, fid: u64, limit: u32) -> Result<Vec<u64>>;
    fn subscribe(&self) -> Result<Box<dyn EventStream>>;
    /// Submits an encoded, signed message and returns its hash.
    fn submit_message(&self, message: &[u8]) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub poll_interval: Duration,
    pub http_client: Option<HttpClient>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HUB_URL.to_string(),
            api_key: None,
            user_agent: format!("lemon3/{}", crate::VERSION),
            poll_interval: Duration::from_secs(2),
            http_client: None,
        }
    }
}

/// Hub access over the `/v1` HTTP API.
pub struct HttpHub {
    api: Api,
    poll_interval: Duration,
}

#[derive(Clone)]
struct Api {
    http: HttpClient,
    base_url: Url,
    api_key: Option<String>,
    user_agent: String,
}

impl HttpHub {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", config.url.trim_end_matches('/')))
            .map_err(|err| Error::transport(format!("hub: invalid url {}", config.url), err))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|err| Error::transport("hub: build http client", err))?,
        };
        Ok(Self {
            api: Api {
                http,
                base_url,
                api_key: config.api_key.filter(|key| !key.trim().is_empty()),
                user_agent: config.user_agent,
            },
            poll_interval: config.poll_interval,
        })
    }
}

impl Api {
    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| Error::transport(format!("hub: build url {path}"), err))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(USER_AGENT, &self.user_agent);
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.endpoint(path, query)?;
        let response = self
            .decorate(self.http.get(url))
            .send()
            .map_err(|err| Error::transport(format!("hub: GET {path}"), err))?;
        read_json(path, response)
    }
}

fn read_json<T: DeserializeOwned>(path: &str, response: reqwest::blocking::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(Error::transport(
            format!("hub: {path}"),
            format!("request failed: {status} - {}", body.trim()),
        ));
    }
    response
        .json()
        .map_err(|err| Error::transport(format!("hub: decode {path}"), err))
}

impl Hub for HttpHub {
    fn resolve_author_id(&self, handle: &str) -> Result<u64> {
        let name = handle.trim_start_matches('@');
        let url = self
            .api
            .endpoint("v1/userNameProofByName", &[("name", name.to_string())])?;
        let response = self
            .api
            .decorate(self.api.http.get(url))
            .send()
            .map_err(|err| Error::transport("hub: userNameProofByName", err))?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST
        ) {
            return Err(Error::AuthorNotFound(name.to_string()));
        }
        let proof: WireUsernameProof = read_json("v1/userNameProofByName", response)?;
        if proof.fid == 0 {
            return Err(Error::AuthorNotFound(name.to_string()));
        }
        Ok(proof.fid)
    }

    fn posts_page(
        &self,
        author_id: u64,
        page_token: Option<&str>,
        page_size: u32,
        reverse: bool,
    ) -> Result<PostsPage> {
        let mut query = vec![
            ("fid", author_id.to_string()),
            ("pageSize", page_size.to_string()),
            ("reverse", reverse.to_string()),
        ];
        if let Some(token) = page_token.filter(|token| !token.is_empty()) {
            query.push(("pageToken", token.to_string()));
        }
        let response: WireMessagesResponse = self.api.get_json("v1/castsByFid", &query)?;
        Ok(PostsPage {
            posts: response
                .messages
                .into_iter()
                .filter_map(WireMessage::into_raw_post)
                .collect(),
            next_page_token: response.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    fn get_post(&self, author_id: u64, hash: &str) -> Result<RawPost> {
        let message: WireMessage = self.api.get_json(
            "v1/castById",
            &[("fid", author_id.to_string()), ("hash", hash.to_string())],
        )?;
        message.into_raw_post().ok_or_else(|| {
            Error::transport(
                "hub: castById",
                format!("message {hash} is not a cast"),
            )
        })
    }

    fn display_name(&self, fid: u64) -> Result<String> {
        let message: WireMessage = self.api.get_json(
            "v1/userDataByFid",
            &[
                ("fid", fid.to_string()),
                ("user_data_type", "USER_DATA_TYPE_USERNAME".to_string()),
            ],
        )?;
        Ok(message
            .data
            .and_then(|data| data.user_data_body)
            .map(|body| body.value)
            .unwrap_or_default())
    }

    fn following(&self, fid: u64, limit: u32) -> Result<Vec<u64>> {
        let response: WireMessagesResponse = self.api.get_json(
            "v1/linksByFid",
            &[
                ("fid", fid.to_string()),
                ("link_type", "follow".to_string()),
                ("pageSize", limit.to_string()),
                ("reverse", "true".to_string()),
            ],
        )?;
        Ok(response
            .messages
            .into_iter()
            .filter_map(|message| message.data)
            .filter_map(|data| data.link_body)
            .map(|link| link.target_fid)
            .collect())
    }

    fn subscribe(&self) -> Result<Box<dyn EventStream>> {
        Ok(Box::new(PollingEvents {
            api: self.api.clone(),
            next_event_id: event_id_at(SystemTime::now()),
            buffer: VecDeque::new(),
            poll_interval: self.poll_interval,
        }))
    }

    fn submit_message(&self, message: &[u8]) -> Result<String> {
        let url = self.api.endpoint("v1/submitMessage", &[])?;
        let response = self
            .api
            .decorate(self.api.http.post(url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(message.to_vec())
            .send()
            .map_err(|err| Error::transport("hub: submitMessage", err))?;
        let accepted: WireMessage = read_json("v1/submitMessage", response)?;
        Ok(accepted.hash)
    }
}

/// First event id the hub assigns at `at`; ids are `(ms since epoch) << 12 | seq`.
pub fn event_id_at(at: SystemTime) -> u64 {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64;
    millis.saturating_sub(PROTOCOL_EPOCH * 1000) << EVENT_SEQUENCE_BITS
}

struct PollingEvents {
    api: Api,
    next_event_id: u64,
    buffer: VecDeque<HubEvent>,
    poll_interval: Duration,
}

impl EventStream for PollingEvents {
    fn next_event(&mut self) -> Result<Option<HubEvent>> {
        if let Some(event) = self.buffer.pop_front() {
            return Ok(Some(event));
        }
        let page: WireEventsResponse = self.api.get_json(
            "v1/events",
            &[("from_event_id", self.next_event_id.to_string())],
        )?;
        if page.events.is_empty() {
            thread::sleep(self.poll_interval);
            return Ok(Some(HubEvent::Idle));
        }
        let last_id = page.events.iter().map(|event| event.id).max().unwrap_or(0);
        self.next_event_id = page
            .next_page_event_id
            .filter(|next| *next > last_id)
            .unwrap_or(last_id + 1);
        self.buffer
            .extend(page.events.into_iter().map(WireEvent::into_hub_event));
        Ok(self.buffer.pop_front())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: Option<WireMessageData>,
    #[serde(default)]
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessageData {
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    fid: u64,
    #[serde(default)]
    timestamp: u32,
    #[serde(default)]
    cast_add_body: Option<WireCastAddBody>,
    #[serde(default)]
    link_body: Option<WireLinkBody>,
    #[serde(default)]
    user_data_body: Option<WireUserDataBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCastAddBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    embeds: Vec<WireEmbed>,
    #[serde(default)]
    mentions: Vec<u64>,
    #[serde(default)]
    mentions_positions: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct WireEmbed {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLinkBody {
    #[serde(default)]
    target_fid: u64,
}

#[derive(Debug, Deserialize)]
struct WireUserDataBody {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireUsernameProof {
    #[serde(default)]
    fid: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEventsResponse {
    #[serde(default)]
    events: Vec<WireEvent>,
    #[serde(default)]
    next_page_event_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    id: u64,
    #[serde(default)]
    merge_message_body: Option<WireMergeBody>,
}

#[derive(Debug, Deserialize)]
struct WireMergeBody {
    message: WireMessage,
}

impl WireMessage {
    fn into_raw_post(self) -> Option<RawPost> {
        let data = self.data?;
        if data.message_type != "MESSAGE_TYPE_CAST_ADD" {
            return None;
        }
        let body = data.cast_add_body?;
        Some(RawPost {
            author_id: data.fid,
            hash: self.hash,
            timestamp: data.timestamp,
            text: body.text,
            embeds: body.embeds.into_iter().filter_map(|e| e.url).collect(),
            mentions: body.mentions,
            mention_positions: body.mentions_positions,
        })
    }
}

impl WireEvent {
    fn into_hub_event(self) -> HubEvent {
        if self.event_type != "HUB_EVENT_TYPE_MERGE_MESSAGE" {
            return HubEvent::Other;
        }
        let Some(message) = self.merge_message_body.map(|body| body.message) else {
            return HubEvent::Other;
        };
        let Some(data) = message.data.as_ref() else {
            return HubEvent::Other;
        };
        let fid = data.fid;
        let target_fid = data.link_body.as_ref().map_or(0, |link| link.target_fid);
        match data.message_type.as_str() {
            "MESSAGE_TYPE_CAST_ADD" => {}
            "MESSAGE_TYPE_LINK_ADD" => return HubEvent::LinkAdded { fid, target_fid },
            "MESSAGE_TYPE_LINK_REMOVE" => return HubEvent::LinkRemoved { fid, target_fid },
            _ => return HubEvent::Other,
        }
        message
            .into_raw_post()
            .map(HubEvent::CastAdded)
            .unwrap_or(HubEvent::Other)
    }
}
