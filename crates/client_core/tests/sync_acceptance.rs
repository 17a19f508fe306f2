use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use client_core::{
    ClientEvent, ClientSettings, ControllerClient, EngineView, OperationFamily, ReconnectPolicy,
};
use shared::{
    domain::{ProcedureId, ProcedureStatus, StepStatus},
    protocol::{
        CommandEnvelope, ProcedureDraft, ProcedureListResponse, ProcedureRecord, PushMessage,
        StepDraft, StepRecord,
    },
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};
use url::Url;

#[derive(Clone)]
struct MockBackend {
    procedures: Arc<Mutex<Vec<ProcedureRecord>>>,
    next_id: Arc<AtomicUsize>,
    frames: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
}

impl MockBackend {
    fn new() -> Self {
        let (frames, _) = broadcast::channel(64);
        Self {
            procedures: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicUsize::new(1)),
            frames,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn record(&self, id: &str) -> ProcedureRecord {
        self.procedures
            .lock()
            .await
            .iter()
            .find(|record| record.id.as_str() == id)
            .cloned()
            .expect("record exists")
    }

    fn push(&self, message: &PushMessage) {
        let frame = serde_json::to_string(message).expect("encode frame");
        let _ = self.frames.send(frame);
    }
}

fn envelope(record: ProcedureRecord) -> Json<CommandEnvelope> {
    Json(CommandEnvelope {
        success: true,
        message: None,
        procedure: Some(record),
    })
}

fn rejected(message: &str) -> Json<CommandEnvelope> {
    Json(CommandEnvelope {
        success: false,
        message: Some(message.to_string()),
        procedure: None,
    })
}

fn mark_running(record: &mut ProcedureRecord, step: usize, elapsed: u64) {
    record.status = ProcedureStatus::Running;
    record.current_step = Some(step as i64);
    for (index, entry) in record.steps.iter_mut().enumerate() {
        entry.status = match index.cmp(&step) {
            std::cmp::Ordering::Less => StepStatus::Completed,
            std::cmp::Ordering::Equal => StepStatus::Running,
            std::cmp::Ordering::Greater => StepStatus::Queued,
        };
        entry.elapsed_time = if index == step { elapsed } else { 0 };
    }
}

async fn list_procedures(State(backend): State<MockBackend>) -> Json<ProcedureListResponse> {
    Json(ProcedureListResponse {
        procedures: backend.procedures.lock().await.clone(),
    })
}

async fn create_procedure(
    State(backend): State<MockBackend>,
    Json(draft): Json<ProcedureDraft>,
) -> Json<CommandEnvelope> {
    let id = format!("p{}", backend.next_id.fetch_add(1, Ordering::SeqCst));
    let record = ProcedureRecord {
        id: ProcedureId::new(id),
        name: draft.name,
        steps: draft
            .steps
            .into_iter()
            .map(|step| StepRecord {
                temperature: step.temperature,
                duration: step.duration,
                status: StepStatus::Queued,
                elapsed_time: 0,
            })
            .collect(),
        status: ProcedureStatus::Idle,
        current_step: Some(-1),
    };
    backend.procedures.lock().await.push(record.clone());
    envelope(record)
}

async fn start_procedure(
    State(backend): State<MockBackend>,
    Path(id): Path<String>,
) -> Json<CommandEnvelope> {
    let mut procedures = backend.procedures.lock().await;
    if procedures
        .iter()
        .any(|record| record.status == ProcedureStatus::Running)
    {
        return rejected("Another procedure is already running");
    }
    let Some(record) = procedures.iter_mut().find(|record| record.id.as_str() == id) else {
        return rejected("Procedure not found");
    };
    mark_running(record, 0, 0);
    envelope(record.clone())
}

async fn stop_procedure(State(backend): State<MockBackend>) -> Json<CommandEnvelope> {
    let mut procedures = backend.procedures.lock().await;
    let Some(record) = procedures
        .iter_mut()
        .find(|record| record.status == ProcedureStatus::Running)
    else {
        return rejected("No procedure is running");
    };
    record.status = ProcedureStatus::Stopped;
    record.current_step = Some(-1);
    envelope(record.clone())
}

async fn delete_procedure(
    State(backend): State<MockBackend>,
    Path(id): Path<String>,
) -> Json<CommandEnvelope> {
    backend
        .procedures
        .lock()
        .await
        .retain(|record| record.id.as_str() != id);
    Json(CommandEnvelope {
        success: true,
        message: Some("Procedure deleted".into()),
        procedure: None,
    })
}

async fn push_socket(
    ws: WebSocketUpgrade,
    State(backend): State<MockBackend>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_frames(socket, backend))
}

async fn forward_frames(mut socket: WebSocket, backend: MockBackend) {
    let mut frames = backend.frames.subscribe();
    backend.connections.fetch_add(1, Ordering::SeqCst);
    while let Ok(frame) = frames.recv().await {
        if socket.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
}

async fn spawn_backend() -> Result<(ClientSettings, MockBackend)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let backend = MockBackend::new();
    let app = Router::new()
        .route("/procedures", get(list_procedures).post(create_procedure))
        .route("/procedures/stop", post(stop_procedure))
        .route("/procedures/:id", delete(delete_procedure))
        .route("/procedures/:id/start", post(start_procedure))
        .route("/ws", get(push_socket))
        .with_state(backend.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let settings = ClientSettings {
        api_base_url: Url::parse(&format!("http://{addr}"))?,
        ws_url: Url::parse(&format!("ws://{addr}/ws"))?,
        request_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        },
    };
    Ok((settings, backend))
}

async fn wait_for_push_connection(backend: &MockBackend) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.connections.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("push channel connected");
}

async fn wait_for_view(
    client: &ControllerClient,
    predicate: impl Fn(&EngineView) -> bool,
) -> EngineView {
    let mut views = client.engine().watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let view = views.borrow_and_update();
                if predicate(&view) {
                    return view.clone();
                }
            }
            views.changed().await.expect("engine alive");
        }
    })
    .await
    .expect("view condition reached in time")
}

fn bake_draft() -> ProcedureDraft {
    ProcedureDraft::new(
        "Bake",
        vec![
            StepDraft {
                temperature: 120.0,
                duration: 60,
            },
            StepDraft {
                temperature: 25.0,
                duration: 30,
            },
        ],
    )
}

#[tokio::test]
async fn commands_and_progress_converge_on_one_view() {
    let (settings, backend) = spawn_backend().await.expect("spawn backend");
    let client = ControllerClient::connect(&settings).expect("connect");
    wait_for_push_connection(&backend).await;

    client
        .commands()
        .fetch_procedures()
        .await
        .expect("initial fetch");
    assert!(client.view().procedures.is_empty());

    let created = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create");
    assert_eq!(client.view().focused, Some(created.id.clone()));

    let started = client
        .commands()
        .start_procedure(created.id.clone())
        .await
        .expect("start");
    assert!(started.is_running());
    assert!(client.view().exit_requires_confirmation());

    let mut progress = backend.record(created.id.as_str()).await;
    mark_running(&mut progress, 1, 12);
    backend.push(&PushMessage {
        temperature_setpoint: Some(Some(25.0)),
        temperature_actual: Some(Some(61.5)),
        temperature_status: None,
        active_procedure: Some(progress),
    });
    let view = wait_for_view(&client, |view| {
        view.current_focus()
            .and_then(|procedure| procedure.current_step)
            == Some(1)
    })
    .await;
    assert_eq!(view.reading.actual(), Some(61.5));
    assert_eq!(view.reading.setpoint(), Some(25.0));

    client.commands().stop_procedure().await.expect("stop");
    let view = client.view();
    assert_eq!(
        view.current_focus().map(|procedure| procedure.status),
        Some(ProcedureStatus::Stopped)
    );
    assert!(!view.exit_requires_confirmation());
}

#[tokio::test]
async fn deleted_procedure_is_not_resurrected_by_late_progress() {
    let (settings, backend) = spawn_backend().await.expect("spawn backend");
    let client = ControllerClient::connect(&settings).expect("connect");
    wait_for_push_connection(&backend).await;

    let first = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create first");
    let second = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create second");
    let mut stale = backend.record(first.id.as_str()).await;

    client
        .commands()
        .delete_procedure(first.id.clone())
        .await
        .expect("delete");
    mark_running(&mut stale, 0, 3);
    backend.push(&PushMessage {
        temperature_actual: Some(Some(42.0)),
        active_procedure: Some(stale),
        ..PushMessage::default()
    });

    let view = wait_for_view(&client, |view| view.reading.actual() == Some(42.0)).await;
    let ids: Vec<&str> = view.procedures.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str()]);
    assert!(view.running().is_none());
}

#[tokio::test]
async fn conflicting_push_triggers_full_refresh() {
    let (settings, backend) = spawn_backend().await.expect("spawn backend");
    let client = ControllerClient::connect(&settings).expect("connect");
    wait_for_push_connection(&backend).await;
    let mut events = client.subscribe_events();

    let first = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create first");
    let second = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create second");
    client
        .commands()
        .start_procedure(first.id.clone())
        .await
        .expect("start first");

    // Another operator finishes the first run and starts the second one.
    let second_running = {
        let mut procedures = backend.procedures.lock().await;
        for record in procedures.iter_mut() {
            if record.id == first.id {
                record.status = ProcedureStatus::Completed;
                record.current_step = Some(-1);
                for step in record.steps.iter_mut() {
                    step.status = StepStatus::Completed;
                }
            } else if record.id == second.id {
                mark_running(record, 0, 1);
            }
        }
        procedures
            .iter()
            .find(|record| record.id == second.id)
            .cloned()
            .expect("second record")
    };
    backend.push(&PushMessage {
        active_procedure: Some(second_running),
        ..PushMessage::default()
    });

    let view = wait_for_view(&client, |view| {
        view.running().map(|procedure| &procedure.id) == Some(&second.id)
    })
    .await;
    assert_eq!(
        view.get(&first.id).map(|procedure| procedure.status),
        Some(ProcedureStatus::Completed)
    );
    assert_eq!(view.phase(OperationFamily::Fetch), client_core::CommandPhase::Succeeded);

    let mut saw_resync = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::ResyncRequired(_)) {
            saw_resync = true;
        }
    }
    assert!(saw_resync);
}

#[tokio::test]
async fn rejected_start_surfaces_server_message() {
    let (settings, backend) = spawn_backend().await.expect("spawn backend");
    let client = ControllerClient::connect(&settings).expect("connect");
    wait_for_push_connection(&backend).await;

    let first = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create first");
    let second = client
        .commands()
        .create_procedure(bake_draft())
        .await
        .expect("create second");
    client
        .commands()
        .start_procedure(first.id.clone())
        .await
        .expect("start first");
    client
        .commands()
        .start_procedure(second.id.clone())
        .await
        .expect_err("second start rejected");

    let view = client.view();
    assert_eq!(
        view.last_error(OperationFamily::Start),
        Some("Another procedure is already running")
    );
    assert_eq!(view.running().map(|p| &p.id), Some(&first.id));
}
