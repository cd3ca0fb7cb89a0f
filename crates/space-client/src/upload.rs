use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{SpaceError, SpaceResult};
use crate::session::Session;
use crate::transport::{join_url, HttpRequest, HttpTransport, UploadFile};

/// Server-side paths of uploaded files, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadResult {
    pub paths: Vec<String>,
}

pub struct UploadManager {
    transport: Arc<dyn HttpTransport>,
}

impl UploadManager {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Uploads are not retried: a replayed multipart body may leave
    /// duplicate files behind.
    pub async fn upload(
        &self,
        session: &Session,
        files: Vec<UploadFile>,
    ) -> SpaceResult<UploadResult> {
        if files.is_empty() {
            return Ok(UploadResult::default());
        }
        let expected = files.len();
        let url = join_url(session.root(), "upload")?;
        let request = session.authorize(HttpRequest::post(url).multipart(files));
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            return Err(SpaceError::from_status(response.status, "upload"));
        }
        let paths = parse_paths(&response.body).map_err(|reason| {
            warn!(
                target = "space_client::upload",
                space = %session.target(),
                body = %response.text(),
                "upload returned an unexpected body"
            );
            SpaceError::MalformedResponse(format!("upload: {reason}"))
        })?;
        if paths.len() != expected {
            return Err(SpaceError::MalformedResponse(format!(
                "upload returned {} paths for {expected} files",
                paths.len()
            )));
        }

        debug!(
            target = "space_client::upload",
            space = %session.target(),
            files = expected,
            "files uploaded"
        );
        Ok(UploadResult { paths })
    }
}

fn parse_paths(body: &[u8]) -> Result<Vec<String>, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| format!("body is not json: {err}"))?;
    let items = value
        .as_array()
        .ok_or_else(|| format!("expected a list of paths, got {value}"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("path entry {item} is not a string"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_list_of_paths() {
        assert_eq!(
            parse_paths(br#"["/tmp/gradio/lion.jpg", "b.txt"]"#).unwrap(),
            vec!["/tmp/gradio/lion.jpg".to_string(), "b.txt".to_string()]
        );
    }

    #[test_timeout::timeout]
    fn rejects_other_shapes() {
        assert!(parse_paths(br#""Internal Server Error""#).is_err());
        assert!(parse_paths(b"Internal Server Error").is_err());
        assert!(parse_paths(br#"[1, 2]"#).is_err());
        assert!(parse_paths(br#"{"error": "nope"}"#).is_err());
    }
}
