mod common;

use common::*;
use serde_json::json;
use space_client::transport::Method;
use space_client::{SessionOptions, SpaceReference, Submission, UploadFile};

#[test_timeout::tokio_timeout_test(paused)]
async fn config_root_is_used_for_every_session_request() {
    let mock = fixture();
    let client = client(&mock);

    let session = client
        .resolve(
            SpaceReference::parse("hmb/mounted_app").unwrap(),
            SessionOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(session.host().base_url().as_str(), format!("{MOUNTED_HOST}/"));
    assert_eq!(session.root().as_str(), MOUNTED_ROOT);
    let resolved = mock.requests().len();

    let output = client
        .predict(&session, &Submission::by_name("predict", vec![json!("hi")]))
        .await
        .unwrap();
    assert_eq!(output, json!({"data": ["mounted"]}));

    let uploaded = client
        .upload(&session, vec![UploadFile::new("a.txt", "hello")])
        .await
        .unwrap();
    assert_eq!(uploaded.paths, vec!["/tmp/gradio/a.txt"]);

    let info = client.api_info(&session).await.unwrap();
    assert_eq!(info.named_endpoints(), vec!["/predict".to_string()]);

    let posted = client.post_data(&session, json!({"ping": 1})).await.unwrap();
    assert_eq!(posted, json!({"ok": true}));

    let session_requests: Vec<_> = mock.requests().into_iter().skip(resolved).collect();
    let paths: Vec<(Method, String)> = session_requests
        .iter()
        .map(|request| (request.method.clone(), request.url.path().to_string()))
        .collect();
    assert_eq!(
        paths,
        vec![
            (Method::POST, "/gradio/queue/join".to_string()),
            (Method::GET, "/gradio/queue/data".to_string()),
            (Method::POST, "/gradio/upload".to_string()),
            (Method::GET, "/gradio/info".to_string()),
            (Method::POST, "/gradio/".to_string()),
        ]
    );
    assert!(session_requests
        .iter()
        .all(|request| request.url.host_str() == Some("hmb-mounted-app.hf.space")));
}
