use std::time::Duration;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use carewise_core::{
    OrchestratorError,
    analysis::{FailureReason, ModuleAdapter, ModuleKind, PatientDirectory, PatientId, PatientSnapshot},
};
use carewise_server::infra::collaborators::{
    HttpModuleAdapter, HttpPatientDirectory, build_http_client,
};

async fn patient_snapshot(Path(id): Path<String>) -> impl IntoResponse {
    if id == "p-1" {
        (
            StatusCode::OK,
            Json(json!({ "display_name": "Ada", "record": { "age": 61 } })),
        )
            .into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn invoke_module(Path(kind): Path<String>, Json(snapshot): Json<Value>) -> impl IntoResponse {
    match kind.as_str() {
        "cognitive" => (
            StatusCode::OK,
            Json(json!({
                "summary": format!("reviewed {}", snapshot["patient_id"].as_str().unwrap_or("?")),
                "score": 0.7,
                "findings": ["memory within range"],
            })),
        )
            .into_response(),
        "persona" => (StatusCode::UNPROCESSABLE_ENTITY, "missing questionnaire").into_response(),
        "social" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK.into_response()
        }
        _ => (StatusCode::BAD_GATEWAY, "model offline").into_response(),
    }
}

async fn spawn_upstream() -> Result<String> {
    let app = Router::new()
        .route("/patients/{id}/snapshot", get(patient_snapshot))
        .route("/modules/{kind}/invoke", post(invoke_module));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn snapshot() -> PatientSnapshot {
    PatientSnapshot::new(PatientId::from("p-1"), json!({ "age": 61 }))
}

#[tokio::test]
async fn patient_directory_reads_snapshots_and_maps_missing() -> Result<()> {
    let base = spawn_upstream().await?;
    let directory = HttpPatientDirectory::new(build_http_client(Duration::from_secs(2))?, &base);

    let found = directory.snapshot(&PatientId::from("p-1")).await?;
    assert_eq!(found.display_name.as_deref(), Some("Ada"));
    assert_eq!(found.record["age"], 61);
    assert!(directory.exists(&PatientId::from("p-1")).await?);

    assert!(!directory.exists(&PatientId::from("p-404")).await?);
    assert!(matches!(
        directory.snapshot(&PatientId::from("p-404")).await,
        Err(OrchestratorError::PatientNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn module_adapter_maps_upstream_responses() -> Result<()> {
    let base = spawn_upstream().await?;
    let client = build_http_client(Duration::from_millis(300))?;
    let adapter = |kind| HttpModuleAdapter::new(client.clone(), base.as_str(), kind);

    let payload = adapter(ModuleKind::Cognitive)
        .invoke(&snapshot(), CancellationToken::new())
        .await
        .expect("cognitive succeeds");
    assert_eq!(payload.summary, "reviewed p-1");
    assert_eq!(payload.score, Some(0.7));

    let invalid = adapter(ModuleKind::Persona)
        .invoke(&snapshot(), CancellationToken::new())
        .await;
    assert_eq!(
        invalid,
        Err(FailureReason::InvalidInput("missing questionnaire".into()))
    );

    let offline = adapter(ModuleKind::Holistic)
        .invoke(&snapshot(), CancellationToken::new())
        .await;
    assert!(matches!(offline, Err(FailureReason::AdapterError(msg)) if msg.contains("502")));

    let slow = adapter(ModuleKind::Social)
        .invoke(&snapshot(), CancellationToken::new())
        .await;
    assert_eq!(slow, Err(FailureReason::Timeout));
    Ok(())
}

#[tokio::test]
async fn module_adapter_stops_when_cancelled() -> Result<()> {
    let base = spawn_upstream().await?;
    let adapter = HttpModuleAdapter::new(
        build_http_client(Duration::from_secs(10))?,
        base.as_str(),
        ModuleKind::Social,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(2), adapter.invoke(&snapshot(), cancel))
        .await
        .expect("cancel interrupts the call");
    assert!(outcome.is_err());
    Ok(())
}
