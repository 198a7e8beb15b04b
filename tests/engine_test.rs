use std::{
    fs,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use flowbot::{
    config::EngineSettings,
    engine::FlowEngine,
    error::ExternalCallError,
    flow::{
        FlowManager,
        model::Flow,
        session::{InMemorySessionStore, SessionManager, VarScope},
    },
    invoker::{
        ActionCall, ActionInvoker, ActionResponse, HttpActionInvoker, Invokers, LlmInvoker,
        LlmRequest, LlmResponse, TokenUsage,
    },
    message::{InboundMessage, TurnOutcome},
};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Counts calls and how many overlap; answers `{"n": <call number>}`.
#[derive(Default)]
struct SlowCounter {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl ActionInvoker for SlowCounter {
    async fn invoke(&self, _call: ActionCall) -> Result<ActionResponse, ExternalCallError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ActionResponse {
            status: 200,
            body: json!({ "n": n }),
            attempts: 1,
        })
    }
}

/// Replays canned model replies in order.
struct CannedLlm {
    replies: Mutex<Vec<String>>,
}

impl CannedLlm {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl LlmInvoker for CannedLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, ExternalCallError> {
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| ExternalCallError::NotConfigured("out of replies".into()))?;
        Ok(LlmResponse {
            text,
            usage: TokenUsage::default(),
            attempts: 1,
        })
    }
}

fn engine_with(action: Arc<dyn ActionInvoker>, llm: Arc<dyn LlmInvoker>, settings: EngineSettings) -> FlowEngine {
    let sessions = SessionManager::new(
        InMemorySessionStore::new(1_000),
        settings.history_window,
        settings.idle_timeout,
    );
    FlowEngine::new(FlowManager::new(), sessions, Invokers::new(action, llm), settings)
}

fn engine() -> FlowEngine {
    engine_with(Arc::new(SlowCounter::default()), CannedLlm::new(&[]), EngineSettings::default())
}

fn flow(doc: Value) -> Flow {
    serde_json::from_value(doc).unwrap()
}

fn menu_flow() -> Flow {
    flow(json!({
        "tenant_id": "libreria",
        "id": "menu",
        "name": "Menú principal",
        "entry_node": "menu",
        "triggers": { "keywords": ["hola", "menu"] },
        "nodes": [
            {
                "id": "menu",
                "kind": "menu",
                "template": "¡Hola! 1) Buscar un libro 2) Libros en inglés",
                "config": { "variable": "opcion", "options": { "1": "buscar", "2": "ingles" } },
                "edges": [
                    { "target": "ingles", "condition": "{{opcion}} equals ingles" },
                    { "target": "buscar", "condition": "{{opcion}} equals buscar" }
                ]
            },
            { "id": "ingles", "kind": "message", "template": "Tenemos libros en inglés ({{opcion}})" },
            {
                "id": "buscar",
                "kind": "input",
                "template": "¿Qué título buscas?",
                "config": { "variable": "titulo" }
            }
        ]
    }))
}

#[tokio::test]
async fn menu_choice_follows_the_guarded_edge() {
    let engine = engine();
    engine.flows().register_flow(menu_flow()).unwrap();

    let reply = engine.handle_turn("libreria", "573001", "Hola").await;
    assert_eq!(reply.outcome, TurnOutcome::Awaiting);
    assert_eq!(reply.messages, vec!["¡Hola! 1) Buscar un libro 2) Libros en inglés"]);

    let reply = engine.handle_turn("libreria", "573001", "2").await;
    assert_eq!(reply.messages, vec!["Tenemos libros en inglés (ingles)"]);
    assert!(!reply.awaiting_input);
    assert_eq!(reply.outcome, TurnOutcome::Completed);
}

#[tokio::test]
async fn menu_branch_into_an_input_keeps_the_session() {
    let engine = engine();
    engine.flows().register_flow(menu_flow()).unwrap();

    engine.handle_turn("libreria", "573001", "menu").await;
    let reply = engine.handle_turn("libreria", "573001", "1").await;
    assert!(reply.awaiting_input);
    assert_eq!(reply.current_node.as_deref(), Some("buscar"));

    let session = engine
        .sessions()
        .load("libreria", "573001", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.get("opcion", VarScope::Global), Some(&json!("buscar")));
    assert_eq!(session.get("opcion", VarScope::Step("menu")), Some(&json!("buscar")));
}

#[tokio::test]
async fn invalid_menu_answer_reprompts_with_counter() {
    let engine = engine();
    engine.flows().register_flow(menu_flow()).unwrap();

    engine.handle_turn("libreria", "573001", "hola").await;
    let reply = engine.handle_turn("libreria", "573001", "7").await;
    assert_eq!(reply.outcome, TurnOutcome::Awaiting);
    assert_eq!(
        reply.messages[0],
        "Please choose one of: buscar, ingles (attempt 2/3)"
    );
}

#[tokio::test]
async fn router_takes_the_not_exists_branch() {
    let engine = engine();
    engine
        .flows()
        .register_flow(flow(json!({
            "tenant_id": "libreria",
            "id": "rutas",
            "name": "Rutas",
            "entry_node": "inicio",
            "triggers": { "mode": "always" },
            "nodes": [
                { "id": "inicio", "kind": "trigger", "edges": [{ "target": "r" }] },
                {
                    "id": "r",
                    "kind": "router",
                    "edges": [
                        { "target": "con", "condition": "{{titulo}} exists" },
                        { "target": "sin", "condition": "{{titulo}} not exists" }
                    ]
                },
                { "id": "con", "kind": "message", "template": "Buscando {{titulo}}" },
                { "id": "sin", "kind": "message", "template": "¿Qué libro buscas?" }
            ]
        })))
        .unwrap();

    // same scope, same branch every time
    for _ in 0..3 {
        let reply = engine.handle_turn("libreria", "573001", "cualquier cosa").await;
        assert_eq!(reply.messages, vec!["¿Qué libro buscas?"]);
        assert_eq!(reply.outcome, TurnOutcome::Completed);
    }
}

fn extractor_flow() -> Flow {
    flow(json!({
        "tenant_id": "libreria",
        "id": "busqueda",
        "name": "Búsqueda",
        "entry_node": "entender",
        "triggers": { "keywords": ["buscar"] },
        "nodes": [
            {
                "id": "entender",
                "kind": "llm",
                "template": "Cuéntame qué libro buscas",
                "config": {
                    "role": "extractor",
                    "fields": [
                        { "name": "titulo", "type": "string", "required": true },
                        { "name": "autor", "type": "string", "required": false }
                    ],
                    "reprompt": "No te entendí, ¿qué título buscas?"
                },
                "edges": [{ "target": "r" }]
            },
            {
                "id": "r",
                "kind": "router",
                "config": { "default": "sin" },
                "edges": [{ "target": "con", "condition": "{{titulo}} exists" }]
            },
            { "id": "con", "kind": "message", "template": "Buscando {{titulo}}{{autor || \"\"}}" },
            { "id": "sin", "kind": "message", "template": "Sin título" }
        ]
    }))
}

#[tokio::test]
async fn extractor_reads_json_wrapped_in_prose() {
    let llm = CannedLlm::new(&["Sure! {\"titulo\":\"X\"} hope that helps"]);
    let engine = engine_with(Arc::new(SlowCounter::default()), llm, EngineSettings::default());
    engine.flows().register_flow(extractor_flow()).unwrap();

    let reply = engine.handle_turn("libreria", "573001", "buscar").await;
    assert_eq!(reply.messages, vec!["Cuéntame qué libro buscas"]);

    let reply = engine.handle_turn("libreria", "573001", "quiero X").await;
    assert_eq!(reply.messages, vec!["Buscando X"]);
    assert_eq!(reply.outcome, TurnOutcome::Completed);
}

#[tokio::test]
async fn extractor_garbage_keeps_waiting_without_variables() {
    let llm = CannedLlm::new(&["I am not sure what you mean", "{\"titulo\": \"Dune\", \"autor\": null}"]);
    let engine = engine_with(Arc::new(SlowCounter::default()), llm, EngineSettings::default());
    engine.flows().register_flow(extractor_flow()).unwrap();

    engine.handle_turn("libreria", "573001", "buscar").await;
    let reply = engine.handle_turn("libreria", "573001", "mmm").await;
    assert_eq!(reply.outcome, TurnOutcome::Awaiting);
    assert_eq!(
        reply.messages,
        vec![
            "No te entendí, ¿qué título buscas? (attempt 2/3)",
            "Cuéntame qué libro buscas"
        ]
    );
    let session = engine
        .sessions()
        .load("libreria", "573001", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.get("titulo", VarScope::Global), None);

    let reply = engine.handle_turn("libreria", "573001", "Dune").await;
    assert_eq!(reply.messages, vec!["Buscando Dune"]);
}

fn counter_flow() -> Flow {
    flow(json!({
        "tenant_id": "libreria",
        "id": "contador",
        "name": "Contador",
        "entry_node": "inicio",
        "triggers": { "keywords": ["hola"] },
        "apis": [{ "id": "visitas", "base_url": "http://visitas.local" }],
        "nodes": [
            { "id": "inicio", "kind": "trigger", "edges": [{ "target": "contar" }] },
            {
                "id": "contar",
                "kind": "action",
                "config": { "api": "visitas", "method": "POST", "path": "/hit", "extract": { "fields": { "n": "n" } } },
                "edges": [{ "target": "eco" }]
            },
            {
                "id": "eco",
                "kind": "message",
                "template": "visita {{n}}",
                "config": { "await_reply": true },
                "edges": [{ "target": "contar" }]
            }
        ]
    }))
}

#[tokio::test]
async fn turns_for_one_contact_never_interleave() {
    let counter = Arc::new(SlowCounter::default());
    let engine = engine_with(counter.clone(), CannedLlm::new(&[]), EngineSettings::default());
    engine.flows().register_flow(counter_flow()).unwrap();

    let (a, b) = tokio::join!(
        engine.handle_turn("libreria", "573001", "hola"),
        engine.handle_turn("libreria", "573001", "hola"),
    );
    assert_eq!(counter.max_in_flight.load(Ordering::SeqCst), 1);

    let mut seen = vec![a.messages, b.messages];
    seen.sort();
    // the second turn resumed the first one's session instead of starting over
    assert_eq!(seen, vec![vec!["visita 1"], vec!["visita 2"]]);
    assert!(engine.sessions().store().get("libreria:573001").await.is_some());
}

#[tokio::test]
async fn different_contacts_run_in_parallel() {
    let counter = Arc::new(SlowCounter::default());
    let engine = engine_with(counter.clone(), CannedLlm::new(&[]), EngineSettings::default());
    engine.flows().register_flow(counter_flow()).unwrap();

    tokio::join!(
        engine.handle_message(InboundMessage::new("libreria", "1", "whatsapp", "hola")),
        engine.handle_message(InboundMessage::new("libreria", "2", "whatsapp", "hola")),
    );
    assert_eq!(counter.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn action_timeout_follows_on_error() {
    // accepts connections and never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let mut settings = EngineSettings::default();
    settings.backoff = Duration::from_millis(1);
    let engine = engine_with(Arc::new(HttpActionInvoker::new()), CannedLlm::new(&[]), settings);
    engine
        .flows()
        .register_flow(flow(json!({
            "tenant_id": "libreria",
            "id": "stock",
            "name": "Stock",
            "entry_node": "consultar",
            "triggers": { "keywords": ["stock"] },
            "apis": [{ "id": "inventario", "base_url": format!("http://{}", addr), "max_attempts": 2 }],
            "nodes": [
                {
                    "id": "consultar",
                    "kind": "action",
                    "template": "Hay {{stock}} unidades",
                    "config": {
                        "api": "inventario",
                        "path": "/stock/:sku",
                        "params": { "sku": "A-1" },
                        "timeout_ms": 100,
                        "on_error": "caido"
                    }
                },
                { "id": "caido", "kind": "message", "template": "El inventario no responde ({{consultar.error || \"?\"}})" }
            ]
        })))
        .unwrap();

    let reply = engine.handle_turn("libreria", "573001", "stock").await;
    assert_eq!(reply.outcome, TurnOutcome::Completed);
    assert_eq!(reply.messages.len(), 1);
    assert!(reply.messages[0].starts_with("El inventario no responde (call to GET"));
    assert!(reply.messages[0].contains("timed out"));
}

#[tokio::test]
async fn action_failure_without_on_error_gets_the_fallback() {
    struct Down;
    #[async_trait]
    impl ActionInvoker for Down {
        async fn invoke(&self, call: ActionCall) -> Result<ActionResponse, ExternalCallError> {
            Err(ExternalCallError::Status {
                target: call.url,
                status: 503,
                body: "maintenance".into(),
                attempts: 3,
            })
        }
    }

    let mut settings = EngineSettings::default();
    settings.human_contact = Some("Escríbenos a soporte@libreria.co".into());
    let engine = engine_with(Arc::new(Down), CannedLlm::new(&[]), settings);
    engine.flows().register_flow(counter_flow()).unwrap();

    let reply = engine.handle_turn("libreria", "573001", "hola").await;
    assert!(matches!(reply.outcome, TurnOutcome::Failed { .. }));
    assert_eq!(
        reply.messages,
        vec![
            engine.settings().fallback_message.clone(),
            "Escríbenos a soporte@libreria.co".to_string()
        ]
    );
    // internal detail never reaches the contact
    assert!(reply.messages.iter().all(|m| !m.contains("503")));
    assert!(engine.sessions().store().get("libreria:573001").await.is_none());
}

#[tokio::test]
async fn idle_sweep_deletes_stale_sessions() {
    let engine = engine();
    engine.flows().register_flow(menu_flow()).unwrap();
    engine.handle_turn("libreria", "573001", "hola").await;

    let sessions = engine.sessions();
    assert_eq!(sessions.sweep_idle(Utc::now()).await, 0);
    assert_eq!(sessions.sweep_idle(Utc::now() + TimeDelta::hours(2)).await, 1);

    // next message starts over with flow selection
    let reply = engine.handle_turn("libreria", "573001", "2").await;
    assert_eq!(reply.outcome, TurnOutcome::NoFlow);
}

#[tokio::test]
async fn flow_directory_loading_skips_invalid_documents() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("menu.jgtc"),
        serde_json::to_string_pretty(&menu_flow()).unwrap(),
    )
    .unwrap();
    let mut broken = serde_json::to_value(menu_flow()).unwrap();
    broken["id"] = json!("roto");
    broken["entry_node"] = json!("no-existe");
    fs::write(tmp.path().join("roto.jgtc"), broken.to_string()).unwrap();
    fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

    let flows = FlowManager::new();
    assert_eq!(flows.load_all_flows_from_dir(tmp.path()).unwrap(), 1);
    assert!(flows.get("libreria", "menu").is_some());
    assert!(flows.get("libreria", "roto").is_none());
}
