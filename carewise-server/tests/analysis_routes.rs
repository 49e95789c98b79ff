use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use carewise_config::Config;
use carewise_core::{
    analysis::{
        AnalysisOrchestrator, FailureReason, InMemoryPatientDirectory, ModuleAdapter, ModuleKind,
        ModulePayload, ModuleRegistry, OrchestratorConfig, PatientId, PatientSnapshot,
    },
    routes::{HEALTH, utils::replace_param, utils::replace_params, v1},
};
use carewise_server::{AppState, create_app};

struct StaticAdapter(&'static str);

#[async_trait]
impl ModuleAdapter for StaticAdapter {
    async fn invoke(
        &self,
        _snapshot: &PatientSnapshot,
        _cancel: CancellationToken,
    ) -> Result<ModulePayload, FailureReason> {
        Ok(ModulePayload {
            summary: format!("{} looks stable", self.0),
            score: Some(0.8),
            findings: vec![format!("{} baseline", self.0)],
            recommendations: vec!["follow up in 6 weeks".into()],
            data: json!({ "source": self.0 }),
        })
    }
}

struct FailingAdapter;

#[async_trait]
impl ModuleAdapter for FailingAdapter {
    async fn invoke(
        &self,
        _snapshot: &PatientSnapshot,
        _cancel: CancellationToken,
    ) -> Result<ModulePayload, FailureReason> {
        Err(FailureReason::AdapterError("upstream unavailable".into()))
    }
}

struct Harness {
    server: TestServer,
    orchestrator: Arc<AnalysisOrchestrator>,
}

fn test_config(max_depth: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.queue.max_depth = max_depth;
    config.queue.worker_count = 2;
    config.queue.poll_interval_ms = 10;
    config.timeouts.module_timeout_ms = 500;
    config.timeouts.dispatch_deadline_ms = 500;
    config
}

async fn harness(max_depth: usize, start_workers: bool) -> Result<Harness> {
    let patients = InMemoryPatientDirectory::new();
    for id in ["p-1", "p-2", "p-3"] {
        patients
            .upsert(PatientSnapshot::new(
                PatientId::try_new(id)?,
                json!({ "age": 54 }),
            ))
            .await;
    }

    let modules = ModuleRegistry::new()
        .with(ModuleKind::Cognitive, Arc::new(StaticAdapter("cognitive")))
        .with(ModuleKind::Biometric, Arc::new(StaticAdapter("biometric")))
        .with(ModuleKind::Social, Arc::new(FailingAdapter));

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        test_config(max_depth),
        Arc::new(patients),
        modules,
    ));
    if start_workers {
        orchestrator.start().await?;
    }

    let state = AppState::new(Arc::clone(&orchestrator), Arc::new(Config::default()));
    let server = TestServer::new(create_app(state)).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(Harness {
        server,
        orchestrator,
    })
}

async fn create(server: &TestServer, patient: &str, modules: &[&str]) -> Value {
    let response = server
        .post(v1::analyses::COLLECTION)
        .add_header("x-actor-id", "dr-lee")
        .json(&json!({ "patient_id": patient, "modules": modules }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json::<Value>()
}

async fn wait_for_state(server: &TestServer, job_id: &str, wanted: &str) -> Value {
    let path = replace_param(v1::analyses::ITEM, "{id}", job_id);
    for _ in 0..200 {
        let body = server.get(&path).await.json::<Value>();
        if body["data"]["state"] == wanted {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {wanted}");
}

#[tokio::test]
async fn health_reports_worker_state() -> Result<()> {
    let harness = harness(10, true).await?;
    let body = harness.server.get(HEALTH).await.json::<Value>();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workers_running"], true);
    harness.orchestrator.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn completed_analysis_exposes_result_and_modules() -> Result<()> {
    let harness = harness(10, true).await?;
    let server = &harness.server;

    let created = create(server, "p-1", &["cognitive", "biometric"]).await;
    assert_eq!(created["success"], true);
    let job_id = created["data"]["job_id"].as_str().unwrap().to_string();

    let status = wait_for_state(server, &job_id, "completed").await;
    assert_eq!(status["data"]["has_result"], true);
    assert_eq!(status["data"]["modules"]["cognitive"]["status"], "succeeded");

    let result = server
        .get(&replace_param(v1::analyses::RESULT, "{id}", &job_id))
        .await;
    result.assert_status_ok();
    let result = result.json::<Value>();
    assert_eq!(
        result["data"]["summary"]["modules_succeeded"],
        json!(["cognitive", "biometric"])
    );
    assert_eq!(result["data"]["low_confidence"], false);

    let module = server
        .get(&replace_params(
            v1::analyses::MODULE,
            &[("{id}", job_id.as_str()), ("{module}", "biometric")],
        ))
        .await;
    module.assert_status_ok();
    assert_eq!(module.json::<Value>()["data"]["status"], "succeeded");

    let not_requested = server
        .get(&replace_params(
            v1::analyses::MODULE,
            &[("{id}", job_id.as_str()), ("{module}", "persona")],
        ))
        .await;
    not_requested.assert_status(StatusCode::BAD_REQUEST);

    // Terminal reads are stable.
    let again = server
        .get(&replace_param(v1::analyses::RESULT, "{id}", &job_id))
        .await
        .json::<Value>();
    assert_eq!(again, result);

    harness.orchestrator.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn request_validation_maps_to_client_errors() -> Result<()> {
    let harness = harness(10, false).await?;
    let server = &harness.server;

    let unknown_patient = server
        .post(v1::analyses::COLLECTION)
        .json(&json!({ "patient_id": "ghost", "modules": ["cognitive"] }))
        .await;
    unknown_patient.assert_status(StatusCode::NOT_FOUND);
    let body = unknown_patient.json::<Value>();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    let unknown_module = server
        .post(v1::analyses::COLLECTION)
        .json(&json!({ "patient_id": "p-1", "modules": ["astrology"] }))
        .await;
    unknown_module.assert_status(StatusCode::BAD_REQUEST);

    let no_modules = server
        .post(v1::analyses::COLLECTION)
        .json(&json!({ "patient_id": "p-1", "modules": [] }))
        .await;
    no_modules.assert_status(StatusCode::BAD_REQUEST);

    let missing_job = server
        .get(&replace_param(
            v1::analyses::ITEM,
            "{id}",
            "0190a1f2-0000-7000-8000-000000000000",
        ))
        .await;
    missing_job.assert_status(StatusCode::NOT_FOUND);

    let bad_state = server
        .get(v1::analyses::COLLECTION)
        .add_query_param("state", "sleeping")
        .await;
    bad_state.assert_status(StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn admission_conflicts_and_saturation() -> Result<()> {
    let harness = harness(2, false).await?;
    let server = &harness.server;

    let first = create(server, "p-1", &["cognitive"]).await;

    let duplicate = server
        .post(v1::analyses::COLLECTION)
        .json(&json!({ "patient_id": "p-1", "modules": ["biometric"] }))
        .await;
    duplicate.assert_status(StatusCode::CONFLICT);
    assert!(
        duplicate.json::<Value>()["error"]
            .as_str()
            .unwrap()
            .contains(first["data"]["job_id"].as_str().unwrap())
    );

    create(server, "p-2", &["cognitive"]).await;
    let saturated = server
        .post(v1::analyses::COLLECTION)
        .json(&json!({ "patient_id": "p-3", "modules": ["cognitive"] }))
        .await;
    saturated.assert_status(StatusCode::TOO_MANY_REQUESTS);

    let listed = server.get(v1::analyses::COLLECTION).await.json::<Value>();
    assert_eq!(listed["pagination"]["total"], 2);

    let queue = server.get(v1::queue::STATUS).await.json::<Value>();
    assert_eq!(queue["data"]["depth"], 2);
    assert_eq!(queue["data"]["max_depth"], 2);

    let pending = server.get(v1::queue::PENDING).await.json::<Value>();
    assert_eq!(pending["data"].as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn cancelling_a_queued_job_is_final() -> Result<()> {
    let harness = harness(10, false).await?;
    let server = &harness.server;

    let created = create(server, "p-1", &["cognitive"]).await;
    let job_id = created["data"]["job_id"].as_str().unwrap().to_string();
    let cancel_path = replace_param(v1::analyses::CANCEL, "{id}", &job_id);

    let cancelled = server
        .post(&cancel_path)
        .add_header("x-actor-id", "nurse-kim")
        .await;
    cancelled.assert_status_ok();
    let body = cancelled.json::<Value>();
    assert_eq!(body["data"]["outcome"], "cancelled");
    assert_eq!(body["data"]["state"], "cancelled");

    server.post(&cancel_path).await.assert_status(StatusCode::BAD_REQUEST);

    let not_ready = server
        .get(&replace_param(v1::analyses::RESULT, "{id}", &job_id))
        .await;
    not_ready.assert_status(StatusCode::BAD_REQUEST);

    let exported = server
        .get(v1::analyses::EXPORT)
        .add_query_param("patient_id", "p-1")
        .await
        .json::<Value>();
    let record = &exported["data"][0];
    assert_eq!(record["requested_by"], "dr-lee");
    let transitions = record["transitions"].as_array().unwrap();
    assert_eq!(transitions.last().unwrap()["actor"], "nurse-kim");
    assert!(transitions.iter().all(|t| t["to"] != "processing"));
    Ok(())
}

#[tokio::test]
async fn failed_jobs_can_be_retried_with_a_narrowed_module_set() -> Result<()> {
    let harness = harness(10, true).await?;
    let server = &harness.server;

    let created = create(server, "p-2", &["cognitive", "social"]).await;
    let job_id = created["data"]["job_id"].as_str().unwrap().to_string();
    wait_for_state(server, &job_id, "partially_failed").await;

    let failed = server.get(v1::queue::FAILED).await.json::<Value>();
    assert_eq!(failed["data"][0]["job_id"], job_id.as_str());

    let retry_path = replace_param(v1::analyses::RETRY, "{id}", &job_id);
    let widened = server
        .post(&retry_path)
        .json(&json!({ "modules": ["persona"] }))
        .await;
    widened.assert_status(StatusCode::BAD_REQUEST);

    let retried = server
        .post(&retry_path)
        .json(&json!({ "modules": ["social"] }))
        .await;
    retried.assert_status(StatusCode::CREATED);
    let retried = retried.json::<Value>();
    assert_eq!(retried["data"]["retried_from"], job_id.as_str());
    assert_eq!(retried["data"]["attempt"], 2);

    let retry_id = retried["data"]["job_id"].as_str().unwrap().to_string();
    wait_for_state(server, &retry_id, "failed").await;

    // Retrying the same job again hands back the follow-up already issued.
    let repeated = server
        .post(&retry_path)
        .json(&json!({ "modules": ["social"] }))
        .await
        .json::<Value>();
    assert_eq!(repeated["data"]["job_id"], retry_id.as_str());

    let lineage = server
        .get(v1::analyses::COLLECTION)
        .add_query_param("retried_from", &job_id)
        .await
        .json::<Value>();
    assert_eq!(lineage["pagination"]["total"], 1);

    // The retry leaves the original record untouched.
    let original = server
        .get(&replace_param(v1::analyses::ITEM, "{id}", &job_id))
        .await
        .json::<Value>();
    assert_eq!(original["data"]["state"], "partially_failed");

    harness.orchestrator.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn feedback_is_validated_and_stored() -> Result<()> {
    let harness = harness(10, false).await?;
    let server = &harness.server;

    let created = create(server, "p-3", &["cognitive"]).await;
    let job_id = created["data"]["job_id"].as_str().unwrap().to_string();
    let path = replace_param(v1::analyses::FEEDBACK, "{id}", &job_id);

    server
        .post(&path)
        .json(&json!({ "rating": 9 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let stored = server
        .post(&path)
        .add_header("x-actor-id", "dr-lee")
        .json(&json!({ "rating": 4, "comment": "useful summary" }))
        .await;
    stored.assert_status(StatusCode::CREATED);
    let body = stored.json::<Value>();
    assert_eq!(body["data"][0]["author"], "dr-lee");
    assert_eq!(body["data"][0]["rating"], 4);

    let status = server
        .get(&replace_param(v1::analyses::ITEM, "{id}", &job_id))
        .await
        .json::<Value>();
    assert_eq!(status["data"]["state"], "queued");
    Ok(())
}

#[tokio::test]
async fn batches_report_members_and_rejections() -> Result<()> {
    let harness = harness(10, true).await?;
    let server = &harness.server;

    let submitted = server
        .post(v1::batches::COLLECTION)
        .add_header("x-actor-id", "coordinator")
        .json(&json!({
            "patient_ids": ["p-1", "p-2", "p-1", "ghost"],
            "modules": ["cognitive"],
            "priority": "P2"
        }))
        .await;
    submitted.assert_status(StatusCode::CREATED);
    let submitted = submitted.json::<Value>();
    assert_eq!(submitted["data"]["member_job_ids"].as_array().unwrap().len(), 2);
    let rejected = submitted["data"]["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["patient_id"], "ghost");

    let batch_id = submitted["data"]["batch_id"].as_str().unwrap().to_string();
    let path = replace_param(v1::batches::ITEM, "{id}", &batch_id);
    let mut settled = Value::Null;
    for _ in 0..200 {
        let body = server.get(&path).await.json::<Value>();
        if body["data"]["counts"]["completed"] == 2 {
            settled = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(settled["data"]["total"], 2);
    assert_eq!(settled["data"]["created_by"], "coordinator");

    let by_batch = server
        .get(v1::analyses::COLLECTION)
        .add_query_param("batch_id", &batch_id)
        .add_query_param("per_page", "1")
        .await
        .json::<Value>();
    assert_eq!(by_batch["pagination"]["total"], 2);
    assert_eq!(by_batch["pagination"]["total_pages"], 2);
    assert_eq!(by_batch["data"].as_array().unwrap().len(), 1);

    harness.orchestrator.shutdown().await?;
    Ok(())
}
