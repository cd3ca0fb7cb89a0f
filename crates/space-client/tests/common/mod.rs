#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use space_client::transport::mock::MockTransport;
use space_client::transport::{HttpResponse, Method, StatusCode};
use space_client::{ClientConfig, SpaceClient};

pub const HUB: &str = "https://huggingface.co";
pub const HELLO_ROOT: &str = "https://hmb-hello-world.hf.space";
pub const SECRET_ROOT: &str = "https://hmb-secret-world.hf.space";
pub const PAUSED_ROOT: &str = "https://hmb-paused-space.hf.space";
pub const SERVER_TEST_ROOT: &str = "https://hmb-server-test.hf.space";
pub const MOUNTED_HOST: &str = "https://hmb-mounted-app.hf.space";
pub const MOUNTED_ROOT: &str = "https://hmb-mounted-app.hf.space/gradio";

pub fn hub(path: &str) -> String {
    format!("{HUB}/api/spaces/{path}")
}

pub fn ok(body: Value) -> HttpResponse {
    HttpResponse::json_body(StatusCode::OK, &body)
}

pub fn config() -> ClientConfig {
    ClientConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
        poll_initial_ms: 50,
        poll_max_ms: 200,
        runtime_timeout_secs: 30,
        ..ClientConfig::default()
    }
}

pub fn client(mock: &Arc<MockTransport>) -> SpaceClient {
    SpaceClient::with_transport(mock.clone(), config()).unwrap()
}

fn register_host(mock: &MockTransport, reference: &str, subdomain: &str, root: &str) {
    mock.respond(
        Method::GET,
        &hub(&format!("{reference}/host")),
        ok(json!({ "subdomain": subdomain, "host": root })),
    );
}

fn space_config(root: &str) -> Value {
    json!({
        "root": root,
        "version": "4.27.0",
        "protocol": "sse_v3",
        "dependencies": [
            { "api_name": "predict" },
            { "api_name": "greet" }
        ]
    })
}

fn authorized(request: &space_client::transport::HttpRequest) -> bool {
    matches!(request.bearer_token(), Some("hf_123") | Some("jwt_123"))
}

/// The fixture spaces:
/// `hmb/hello_world` public and running, `hmb/secret_world` private
/// (token `hf_123`), `hmb/bye_world` unknown, `hmb/paused_space` paused until
/// woken, `hmb/failed_space` failed, `hmb/building_space` never finishes
/// building, `hmb/server_test` answers uploads with a bare string,
/// `hmb/mounted_app` serves its app under `/gradio`.
pub fn fixture() -> Arc<MockTransport> {
    let mock = MockTransport::new();

    register_host(&mock, "hmb/hello_world", "hmb-hello-world", HELLO_ROOT);
    mock.respond(Method::GET, &format!("{HELLO_ROOT}/config"), ok(space_config(HELLO_ROOT)));
    mock.respond(Method::GET, &hub("hmb/hello_world/runtime"), ok(json!({ "stage": "RUNNING" })));
    mock.respond(Method::GET, &hub("hmb/hello_world/jwt"), ok(json!({ "token": "jwt_123" })));
    mock.respond(
        Method::POST,
        &format!("{HELLO_ROOT}/queue/join"),
        ok(json!({ "event_id": "123" })),
    );
    mock.respond(Method::POST, &format!("{HELLO_ROOT}/upload"), ok(json!(["lion.jpg"])));
    mock.respond(Method::POST, &format!("{HELLO_ROOT}/"), ok(json!({})));
    mock.respond(
        Method::GET,
        &format!("{HELLO_ROOT}/info"),
        ok(json!({ "named_endpoints": { "/predict": {} }, "unnamed_endpoints": {} })),
    );

    mock.on(Method::GET, &hub("hmb/secret_world/host"), |request| {
        if request.bearer_token() != Some("hf_123") {
            return HttpResponse::empty(StatusCode::UNAUTHORIZED);
        }
        ok(json!({ "subdomain": "hmb/secret_world", "host": SECRET_ROOT }))
    });
    mock.on(Method::GET, &format!("{SECRET_ROOT}/config"), |request| {
        if !authorized(request) {
            return HttpResponse::empty(StatusCode::UNAUTHORIZED);
        }
        ok(space_config(SECRET_ROOT))
    });
    mock.respond(Method::GET, &hub("hmb/secret_world/runtime"), ok(json!({ "stage": "RUNNING" })));
    mock.respond(Method::GET, &hub("hmb/secret_world/jwt"), ok(json!({ "token": "jwt_123" })));
    mock.on(Method::POST, &format!("{SECRET_ROOT}/"), |request| {
        if !authorized(request) {
            return HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
        ok(json!({ "ok": true }))
    });
    mock.respond(
        Method::GET,
        &format!("{HUB}/api/whoami-v2"),
        ok(json!({ "type": "user", "name": "hmb", "orgs": [] })),
    );

    mock.respond(
        Method::GET,
        &hub("hmb/bye_world/host"),
        HttpResponse::empty(StatusCode::NOT_FOUND),
    );
    mock.respond(
        Method::GET,
        &hub("hmb/bye_world/runtime"),
        HttpResponse::empty(StatusCode::NOT_FOUND),
    );
    mock.respond(
        Method::GET,
        &hub("hmb/bye_world/jwt"),
        HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR),
    );

    let awake = Arc::new(AtomicBool::new(false));
    register_host(&mock, "hmb/paused_space", "hmb-paused-space", PAUSED_ROOT);
    let config_awake = awake.clone();
    mock.on(Method::GET, &format!("{PAUSED_ROOT}/config"), move |_| {
        if config_awake.load(Ordering::SeqCst) {
            ok(space_config(PAUSED_ROOT))
        } else {
            HttpResponse::empty(StatusCode::SERVICE_UNAVAILABLE)
        }
    });
    let runtime_awake = awake.clone();
    mock.on(Method::GET, &hub("hmb/paused_space/runtime"), move |_| {
        let stage = if runtime_awake.load(Ordering::SeqCst) { "RUNNING" } else { "PAUSED" };
        ok(json!({ "stage": stage }))
    });
    mock.on(Method::POST, &hub("hmb/paused_space/sleeptime"), move |_| {
        awake.store(true, Ordering::SeqCst);
        ok(json!({}))
    });

    register_host(
        &mock,
        "hmb/failed_space",
        "hmb-failed-space",
        "https://hmb-failed-space.hf.space",
    );
    mock.respond(
        Method::GET,
        "https://hmb-failed-space.hf.space/config",
        HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR),
    );
    mock.respond(Method::GET, &hub("hmb/failed_space/runtime"), ok(json!({ "stage": "FAILED" })));

    register_host(
        &mock,
        "hmb/building_space",
        "hmb-building-space",
        "https://hmb-building-space.hf.space",
    );
    mock.respond(
        Method::GET,
        "https://hmb-building-space.hf.space/config",
        ok(space_config("https://hmb-building-space.hf.space")),
    );
    mock.respond(
        Method::GET,
        &hub("hmb/building_space/runtime"),
        ok(json!({ "stage": "BUILDING" })),
    );

    register_host(&mock, "hmb/server_test", "hmb-server-test", SERVER_TEST_ROOT);
    mock.respond(
        Method::GET,
        &format!("{SERVER_TEST_ROOT}/config"),
        ok(space_config(SERVER_TEST_ROOT)),
    );
    mock.respond(Method::GET, &hub("hmb/server_test/runtime"), ok(json!({ "stage": "RUNNING" })));
    mock.respond(
        Method::POST,
        &format!("{SERVER_TEST_ROOT}/upload"),
        ok(json!("Internal Server Error")),
    );
    mock.respond(
        Method::POST,
        &format!("{SERVER_TEST_ROOT}/queue/join"),
        HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR),
    );

    register_host(&mock, "hmb/mounted_app", "hmb-mounted-app", MOUNTED_HOST);
    mock.respond(Method::GET, &format!("{MOUNTED_HOST}/config"), ok(space_config(MOUNTED_ROOT)));
    mock.respond(Method::GET, &hub("hmb/mounted_app/runtime"), ok(json!({ "stage": "RUNNING" })));
    mock.respond(
        Method::POST,
        &format!("{MOUNTED_ROOT}/queue/join"),
        ok(json!({ "event_id": "7" })),
    );
    mock.stream(
        &format!("{MOUNTED_ROOT}/queue/data"),
        vec![json!({ "msg": "process_completed", "event_id": "7", "success": true,
                     "output": { "data": ["mounted"] } })
        .to_string()],
    );
    mock.respond(Method::POST, &format!("{MOUNTED_ROOT}/upload"), ok(json!(["/tmp/gradio/a.txt"])));
    mock.respond(Method::POST, &format!("{MOUNTED_ROOT}/"), ok(json!({ "ok": true })));
    mock.respond(
        Method::GET,
        &format!("{MOUNTED_ROOT}/info"),
        ok(json!({ "named_endpoints": { "/predict": {} }, "unnamed_endpoints": {} })),
    );

    Arc::new(mock)
}
