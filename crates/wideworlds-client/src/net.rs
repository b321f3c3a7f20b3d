use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use wideworlds_entity::{AvatarDef, Sequence};
use wideworlds_protocol::BatchStatus;
use wideworlds_types::{ChunkPos, Prop, PropUpdate, WorldDescriptor};
use wideworlds_world::{TerrainPageData, WaterPageData};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Unauthorized: missing or rejected credentials")]
    Unauthorized,
    #[error("Forbidden: invalid token")]
    Forbidden,
    #[error("Not found")]
    NotFound,
    #[error("Bad request")]
    BadRequest,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status: {0}")]
    UnexpectedStatus(u16),
}

pub type NetResult<T> = Result<T, NetError>;

/// An authenticated session.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub id: u32,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorldSummary {
    pub id: u32,
    pub name: String,
}

/// The server's REST surface as the runtime consumes it. The live
/// implementation talks HTTP; tests substitute an in-memory world.
pub trait WorldServer {
    fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> impl std::future::Future<Output = NetResult<Session>>;
    fn worlds(&self) -> impl std::future::Future<Output = NetResult<Vec<WorldSummary>>>;
    fn world(&self, id: u32) -> impl std::future::Future<Output = NetResult<WorldDescriptor>>;
    /// Props of one chunk, queried through the bounds endpoint.
    fn chunk_props(
        &self,
        world: u32,
        pos: ChunkPos,
        side: f32,
    ) -> impl std::future::Future<Output = NetResult<Vec<Prop>>>;
    fn create_props(
        &self,
        world: u32,
        props: &[Prop],
    ) -> impl std::future::Future<Output = NetResult<BatchStatus>>;
    fn update_props(
        &self,
        world: u32,
        updates: &[PropUpdate],
    ) -> impl std::future::Future<Output = NetResult<BatchStatus>>;
    fn delete_props(
        &self,
        world: u32,
        ids: &[u32],
    ) -> impl std::future::Future<Output = NetResult<BatchStatus>>;
    fn terrain_page(
        &self,
        world: u32,
        px: i32,
        pz: i32,
    ) -> impl std::future::Future<Output = NetResult<TerrainPageData>>;
    fn water_page(
        &self,
        world: u32,
        px: i32,
        pz: i32,
    ) -> impl std::future::Future<Output = NetResult<WaterPageData>>;
    /// Avatar dictionary under the world's asset path base.
    fn avatars(
        &self,
        path_base: &str,
    ) -> impl std::future::Future<Output = NetResult<Vec<AvatarDef>>>;
    /// Fetch and parse one sequence archive. Parsing belongs to an
    /// external collaborator; implementations delegate to it.
    fn sequence(
        &self,
        path_base: &str,
        file: &str,
    ) -> impl std::future::Future<Output = NetResult<Sequence>>;
}

/// Parses a fetched sequence archive. Supplied by the asset pipeline.
pub type SequenceParser = fn(&[u8], &str) -> Option<Sequence>;

/// reqwest-backed implementation of the REST surface.
pub struct HttpWorldClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    sequence_parser: SequenceParser,
}

impl HttpWorldClient {
    pub fn new(base: impl Into<String>, sequence_parser: SequenceParser) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            token: None,
            sequence_parser,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> NetResult<reqwest::Response> {
        match response.status().as_u16() {
            200 => Ok(response),
            400 => Err(NetError::BadRequest),
            401 => Err(NetError::Unauthorized),
            403 => Err(NetError::Forbidden),
            404 => Err(NetError::NotFound),
            other => Err(NetError::UnexpectedStatus(other)),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> NetResult<T> {
        let response = self.authed(self.http.get(url)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

/// Raw id-keyed ternary batch response: `true | false | null` per id.
fn parse_batch(raw: HashMap<String, Option<bool>>) -> BatchStatus {
    raw.into_iter()
        .filter_map(|(id, status)| id.parse::<u32>().ok().map(|id| (id, status)))
        .collect()
}

impl WorldServer for HttpWorldClient {
    async fn login(&mut self, username: &str, password: &str) -> NetResult<Session> {
        let response = self
            .http
            .post(format!("{}/api/login", self.base))
            .json(&serde_json::json!({"username": username, "password": password}))
            .send()
            .await?;
        let session: Session = Self::check(response).await?.json().await?;
        self.token = Some(session.token.clone());
        Ok(session)
    }

    async fn worlds(&self) -> NetResult<Vec<WorldSummary>> {
        self.get_json(format!("{}/api/worlds", self.base)).await
    }

    async fn world(&self, id: u32) -> NetResult<WorldDescriptor> {
        self.get_json(format!("{}/api/worlds/{}", self.base, id)).await
    }

    async fn chunk_props(&self, world: u32, pos: ChunkPos, side: f32) -> NetResult<Vec<Prop>> {
        let anchor = pos.anchor(side);
        let half = side as f64 / 2.0;
        let url = format!(
            "{}/api/worlds/{}/props?minX={}&maxX={}&minY={}&maxY={}&minZ={}&maxZ={}",
            self.base,
            world,
            anchor.x - half,
            anchor.x + half,
            f64::MIN,
            f64::MAX,
            anchor.z - half,
            anchor.z + half,
        );
        self.get_json(url).await
    }

    async fn create_props(&self, world: u32, props: &[Prop]) -> NetResult<BatchStatus> {
        let response = self
            .authed(self.http.post(format!("{}/api/worlds/{}/props", self.base, world)))
            .json(props)
            .send()
            .await?;
        Ok(parse_batch(Self::check(response).await?.json().await?))
    }

    async fn update_props(&self, world: u32, updates: &[PropUpdate]) -> NetResult<BatchStatus> {
        let body: HashMap<String, &PropUpdate> = updates
            .iter()
            .map(|u| (u.id.to_string(), u))
            .collect();
        let response = self
            .authed(self.http.put(format!("{}/api/worlds/{}/props", self.base, world)))
            .json(&body)
            .send()
            .await?;
        Ok(parse_batch(Self::check(response).await?.json().await?))
    }

    async fn delete_props(&self, world: u32, ids: &[u32]) -> NetResult<BatchStatus> {
        let response = self
            .authed(self.http.delete(format!("{}/api/worlds/{}/props", self.base, world)))
            .json(ids)
            .send()
            .await?;
        Ok(parse_batch(Self::check(response).await?.json().await?))
    }

    async fn terrain_page(&self, world: u32, px: i32, pz: i32) -> NetResult<TerrainPageData> {
        self.get_json(format!(
            "{}/api/worlds/{}/terrain/{}/{}",
            self.base, world, px, pz
        ))
        .await
    }

    async fn water_page(&self, world: u32, px: i32, pz: i32) -> NetResult<WaterPageData> {
        self.get_json(format!(
            "{}/api/worlds/{}/water/{}/{}",
            self.base, world, px, pz
        ))
        .await
    }

    async fn avatars(&self, path_base: &str) -> NetResult<Vec<AvatarDef>> {
        self.get_json(format!("{}/avatars/avatars.json", path_base)).await
    }

    async fn sequence(&self, path_base: &str, file: &str) -> NetResult<Sequence> {
        let response = self
            .authed(self.http.get(format!("{}/seqs/{}", path_base, file)))
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        (self.sequence_parser)(&bytes, file).ok_or(NetError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_ternary() {
        let raw: HashMap<String, Option<bool>> = serde_json::from_str(
            r#"{"7": true, "8": false, "9": null}"#,
        )
        .unwrap();
        let status = parse_batch(raw);
        assert_eq!(status.get(&7), Some(&Some(true)));
        assert_eq!(status.get(&8), Some(&Some(false)));
        assert_eq!(status.get(&9), Some(&None));
    }

    #[test]
    fn test_session_shape() {
        let session: Session = serde_json::from_str(r#"{"id": 12, "token": "abc"}"#).unwrap();
        assert_eq!(session.id, 12);
        assert_eq!(session.token, "abc");
    }
}
