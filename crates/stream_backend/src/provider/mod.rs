pub mod dispatcharr;
pub mod stream_master;

use async_trait::async_trait;

use crate::{BackendError, Credentials, StreamSnapshot};

pub const STREAM_ID_PLACEHOLDER: &str = "{id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    StreamMaster,
    Dispatcharr,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::StreamMaster => "stream_master",
            BackendType::Dispatcharr => "dispatcharr",
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = BackendError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accepts "Stream_Master", "stream-master", "streammaster", ...
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "streammaster" => Ok(BackendType::StreamMaster),
            "dispatcharr" => Ok(BackendType::Dispatcharr),
            _ => Err(BackendError::UnsupportedBackend(s.to_string())),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// URL a probe pulls, with `{id}` where the stream id goes
    fn stream_url_template(&self) -> String;

    fn stream_url(&self, stream_id: &str) -> String {
        self.stream_url_template()
            .replace(STREAM_ID_PLACEHOLDER, stream_id)
    }

    /// Fetch the streams that are currently being served
    async fn list_active_streams(&self) -> Result<Vec<StreamSnapshot>, BackendError>;

    /// Ask the backend to move a stream to its next source.
    ///
    /// `Ok(false)` means the backend answered but refused or reported an error.
    async fn switch_to_next(&self, stream_id: &str) -> Result<bool, BackendError>;
}

pub fn create_backend(
    backend_type: BackendType,
    server_url: &str,
    credentials: Option<Credentials>,
) -> Result<Box<dyn BackendAdapter>, BackendError> {
    let server_url = server_url.trim_end_matches('/');
    match backend_type {
        BackendType::StreamMaster => Ok(Box::new(stream_master::StreamMasterBackend::new(
            server_url,
        )?)),
        BackendType::Dispatcharr => Ok(Box::new(dispatcharr::DispatcharrBackend::new(
            server_url,
            credentials,
        )?)),
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(BackendError::Network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_from_str() {
        assert_eq!(
            "Stream_Master".parse::<BackendType>().unwrap(),
            BackendType::StreamMaster
        );
        assert_eq!(
            "stream-master".parse::<BackendType>().unwrap(),
            BackendType::StreamMaster
        );
        assert_eq!(
            "Dispatcharr".parse::<BackendType>().unwrap(),
            BackendType::Dispatcharr
        );
        assert!(matches!(
            "AIPTV".parse::<BackendType>(),
            Err(BackendError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn test_create_backend_templates() {
        let backend =
            create_backend(BackendType::StreamMaster, "http://10.0.0.2:7095/", None).unwrap();
        assert_eq!(backend.stream_url("12"), "http://10.0.0.2:7095/v/0/12");

        let backend =
            create_backend(BackendType::Dispatcharr, "http://10.0.0.3:9191", None).unwrap();
        assert_eq!(
            backend.stream_url("5f2e"),
            "http://10.0.0.3:9191/proxy/ts/stream/5f2e"
        );
        assert_eq!(backend.backend_type(), BackendType::Dispatcharr);
    }
}
