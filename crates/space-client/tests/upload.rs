mod common;

use common::*;
use serde_json::json;
use space_client::transport::{Method, RequestBody};
use space_client::{SessionOptions, SpaceError, SpaceReference, UploadFile};

async fn session_for(
    client: &space_client::SpaceClient,
    reference: &str,
) -> space_client::Session {
    client
        .resolve(SpaceReference::parse(reference).unwrap(), SessionOptions::new())
        .await
        .unwrap()
}

#[test_timeout::tokio_timeout_test(paused)]
async fn upload_returns_server_paths_in_input_order() {
    let mock = fixture();
    mock.respond(
        Method::POST,
        &format!("{HELLO_ROOT}/upload"),
        ok(json!(["/tmp/gradio/lion.jpg", "/tmp/gradio/notes.txt"])),
    );
    let client = client(&mock);
    let session = session_for(&client, "hmb/hello_world").await;

    let result = client
        .upload(
            &session,
            vec![
                UploadFile::new("lion.jpg", vec![0xffu8, 0xd8]).with_mime("image/jpeg"),
                UploadFile::new("notes.txt", "hello"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result.paths, vec!["/tmp/gradio/lion.jpg", "/tmp/gradio/notes.txt"]);

    let sent = mock
        .requests()
        .into_iter()
        .find(|request| request.url.as_str().ends_with("/upload"))
        .unwrap();
    let RequestBody::Multipart(files) = sent.body else {
        panic!("upload must be multipart");
    };
    assert_eq!(files[0].name, "lion.jpg");
    assert_eq!(files[1].name, "notes.txt");
}

#[test_timeout::tokio_timeout_test(paused)]
async fn bare_string_body_is_a_malformed_response() {
    let mock = fixture();
    let client = client(&mock);
    let session = session_for(&client, "hmb/server_test").await;

    let err = client
        .upload(&session, vec![UploadFile::new("lion.jpg", vec![1u8, 2, 3])])
        .await
        .unwrap_err();
    assert!(matches!(err, SpaceError::MalformedResponse(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn path_count_must_match_file_count() {
    let mock = fixture();
    let client = client(&mock);
    let session = session_for(&client, "hmb/hello_world").await;

    let err = client
        .upload(
            &session,
            vec![UploadFile::new("a.txt", "a"), UploadFile::new("b.txt", "b")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SpaceError::MalformedResponse(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn empty_upload_makes_no_request() {
    let mock = fixture();
    let client = client(&mock);
    let session = session_for(&client, "hmb/hello_world").await;

    let result = client.upload(&session, Vec::new()).await.unwrap();
    assert!(result.paths.is_empty());
    assert_eq!(mock.count(Method::POST, &format!("{HELLO_ROOT}/upload")), 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn post_data_and_api_info() {
    let mock = fixture();
    let client = client(&mock);
    let session = session_for(&client, "hmb/hello_world").await;

    let reply = client.post_data(&session, json!({"data": []})).await.unwrap();
    assert_eq!(reply, json!({}));

    let info = client.api_info(&session).await.unwrap();
    assert_eq!(info.named_endpoints(), vec!["/predict".to_string()]);
}
