//! End-to-end lifecycle against a scripted local server pair: a
//! websocket endpoint that plays back a full generation run and a REST
//! endpoint that resolves image URLs.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::Query;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use url::Url;

use pictor::auth::AuthCredentials;
use pictor::projects::ProjectParams;
use pictor::{ClientConfig, PictorClient, ProjectStatus};
use pictor_protocol::{Envelope, JobRequest};

fn forge_token(ttl: Duration) -> String {
    let exp = (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({"alg": "HS256"})).unwrap());
    let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({"exp": exp})).unwrap());
    format!("{header}.{claims}.sig")
}

async fn spawn_rest_server() -> Url {
    let app = axum::Router::new().route(
        "/v1/image/downloadUrl",
        get(|Query(q): Query<HashMap<String, String>>| async move {
            Json(json!({
                "status": "success",
                "data": { "downloadUrl": format!("https://cdn/{}/{}.png", q["type"], q["imageId"]) },
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    Url::parse(&format!("http://{addr}")).unwrap()
}

/// Accepts one connection, waits for the generation request, then plays
/// the whole run back: queue, start, progress, result, completion.
async fn spawn_socket_server() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let project_id = loop {
            let frame = ws.next().await.unwrap().unwrap();
            if !frame.is_text() {
                continue;
            }
            let envelope = Envelope::from_text(frame.to_text().unwrap()).unwrap();
            assert_eq!(envelope.kind, "jobRequest");
            let request: JobRequest = envelope.payload().unwrap();
            assert_eq!(request.number_of_images, 1);
            assert_eq!(request.key_frames[0].positive_prompt, "a lighthouse at dusk");
            break request.job_id;
        };

        let script = [
            ("jobState", json!({"type": "queued", "jobID": project_id, "queuePosition": 2})),
            ("jobState", json!({"type": "jobStarted", "jobID": project_id, "imgID": "i1", "workerName": "w-3"})),
            ("jobProgress", json!({"jobID": project_id, "imgID": "i1", "step": 10, "stepCount": 20})),
            ("jobProgress", json!({"jobID": project_id, "imgID": "i1", "step": 20, "stepCount": 20})),
            (
                "jobResult",
                json!({
                    "jobID": project_id,
                    "imgID": "i1",
                    "performedStepCount": 20,
                    "lastSeed": "31337",
                }),
            ),
            ("jobState", json!({"type": "jobCompleted", "jobID": project_id})),
        ];
        for (kind, payload) in script {
            let text = Envelope::encode(kind, &payload).unwrap().into_text().unwrap();
            ws.send(text.into()).await.unwrap();
        }
        // Hold the connection so the run ends on its own terms.
        std::future::pending::<()>().await;
    });
    Url::parse(&format!("ws://{addr}")).unwrap()
}

#[tokio::test]
async fn full_generation_run_resolves_result_urls() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).try_init();

    let rest = spawn_rest_server().await;
    let socket = spawn_socket_server().await;

    let mut config = ClientConfig::new("app-e2e");
    config.rest_endpoint = Some(rest.to_string());
    config.socket_endpoint = Some(socket.to_string());
    let client = PictorClient::new(config)?;

    client
        .auth()
        .authenticate(AuthCredentials {
            token: Some(forge_token(Duration::from_secs(3600))),
            refresh_token: forge_token(Duration::from_secs(3600)),
        })
        .await?;

    let project = client
        .projects
        .create(ProjectParams {
            model_id: "flux.1-schnell".into(),
            positive_prompt: "a lighthouse at dusk".into(),
            steps: 20,
            ..ProjectParams::default()
        })
        .await?;

    let urls = tokio::time::timeout(Duration::from_secs(10), project.wait_for_completion())
        .await
        .expect("run did not settle in time")
        .expect("project failed");
    assert_eq!(urls, vec!["https://cdn/complete/i1.png".to_string()]);

    assert_eq!(project.status(), ProjectStatus::Completed);
    assert_eq!(project.queue_position(), 2);
    let job = project.job("i1").unwrap();
    assert_eq!(job.step(), 20);
    assert_eq!(job.result_url().as_deref(), Some("https://cdn/complete/i1.png"));
    Ok(())
}
