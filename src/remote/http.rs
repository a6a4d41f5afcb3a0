use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{Connector, Payload, Remote};
use crate::auth::TokenPair;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::server::dto::{GrainList, LoginRequest, SliceList, SubscriptionList};
use crate::types::{Grain, Settings, Slice, Subscription};

const API_PREFIX: &str = "v1";
const TIMEOUT: Duration = Duration::from_secs(10);
const DEBUG_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub struct HttpRemote {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, debug: bool) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Remote(format!("invalid sync address '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Remote(format!("invalid sync address '{base_url}'")));
        }
        let client = Client::builder()
            .timeout(if debug { DEBUG_TIMEOUT } else { TIMEOUT })
            .build()?;
        Ok(Self {
            client,
            base,
            token: None,
        })
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<TokenPair> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let request = self.client.post(self.url(&["login"])?).json(&body);
        let pair: TokenPair = self.send(request)?;
        self.token = Some(pair.token.clone());
        Ok(pair)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Remote(format!("invalid sync address '{}'", self.base)))?
            .pop_if_empty()
            .push(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let mut request = request
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, "Sandpiper");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        check(request.send()?)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = self.execute(request)?;
        // Grains can be large; decode straight off the socket.
        serde_json::from_reader(resp).map_err(|e| Error::Remote(format!("bad response body: {e}")))
    }

    fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        self.execute(request).map(drop)
    }

    fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        self.send(self.client.get(self.url(segments)?))
    }
}

fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::OK {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(Error::Remote(format!("{status}: {}", body.trim())))
}

impl Remote for HttpRemote {
    fn all_subs(&self) -> Result<Vec<Subscription>> {
        let list: SubscriptionList = self.get(&["sync", "subs"])?;
        Ok(list.subscriptions)
    }

    fn grain_list(&self, slice_id: Uuid) -> Result<Vec<Grain>> {
        let id = slice_id.to_string();
        let request = self
            .client
            .get(self.url(&["sync", "slice", &id])?)
            .query(&[("brief", "yes")]);
        let list: GrainList = self.send(request)?;
        Ok(list.grains)
    }

    fn grain(&self, id: Uuid) -> Result<Grain> {
        self.get(&["grains", &id.to_string()])
    }

    fn grain_payload(&self, id: Uuid) -> Result<Payload> {
        let request = self.client.get(self.url(&["grains", "payload", &id.to_string()])?);
        let resp = self.execute(request)?;
        let len = resp
            .content_length()
            .ok_or_else(|| Error::Remote(format!("payload of grain {id} has no length")))?;
        Ok(Payload {
            len,
            body: Box::new(resp),
        })
    }

    fn slice_by_id(&self, id: Uuid) -> Result<Slice> {
        self.get(&["slices", &id.to_string()])
    }

    fn slice_by_name(&self, name: &str) -> Result<Slice> {
        self.get(&["slices", "name", name])
    }

    fn list_slices(&self) -> Result<Vec<Slice>> {
        let list: SliceList = self.get(&["slices"])?;
        Ok(list.slices)
    }

    fn refresh_slice(&self, id: Uuid) -> Result<Slice> {
        let id = id.to_string();
        self.send(self.client.post(self.url(&["slices", "refresh", &id])?))
    }

    fn lock_slice(&self, id: Uuid) -> Result<()> {
        let id = id.to_string();
        self.send_empty(self.client.put(self.url(&["slices", "lock", &id])?))
    }

    fn unlock_slice(&self, id: Uuid) -> Result<()> {
        let id = id.to_string();
        self.send_empty(self.client.put(self.url(&["slices", "unlock", &id])?))
    }

    fn server_role(&self) -> Result<Settings> {
        self.get(&["role"])
    }
}

/// Opens [`HttpRemote`] sessions with a fresh login each time.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector {
    pub debug: bool,
}

impl Connector for HttpConnector {
    fn connect(&self, addr: &str, credentials: &Credentials) -> Result<Box<dyn Remote>> {
        let mut remote = HttpRemote::new(addr, self.debug)?;
        remote.login(&credentials.username, &credentials.password)?;
        Ok(Box::new(remote))
    }
}
