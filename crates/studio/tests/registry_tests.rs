#![cfg(unix)]

mod common;

use common::*;
use mcp_studio::{
    ErrorKind, EventKind, EventPayload, FlowRegistry, FlowSpec, FlowStore, JsonFileStore,
    MemoryStore, Phase, Prober, Source, StudioConfig, StudioError, Subject, Target,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    config: StudioConfig,
}

impl Fixture {
    /// The proxy is a shell script that echoes its config path and sleeps
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("proxy.sh");
        std::fs::write(&script, "echo \"config $2\"\nexec sleep 30\n").unwrap();
        let config = StudioConfig {
            proxy_bin: format!("sh {}", script.display()),
            data_path: dir.path().join("flows.json"),
            ..test_config()
        };
        Self { dir, config }
    }

    fn registry(&self, store: Arc<dyn FlowStore>) -> FlowRegistry {
        FlowRegistry::new(store, runtime_with(self.config.clone(), Arc::new(mcp_studio::Prober::new())))
    }
}

fn local(name: &str) -> FlowSpec {
    FlowSpec::new(
        name,
        Source::LocalCommand {
            command: "npx".into(),
            args: vec!["-y".into(), "@modelcontextprotocol/server-everything".into()],
            env: BTreeMap::new(),
        },
        Target::Sse,
    )
}

#[tokio::test]
async fn test_create_list_get() {
    let fixture = Fixture::new();
    let store = Arc::new(MemoryStore::new());
    let registry = fixture.registry(store.clone());

    let a = registry.create(local("Alpha")).await.unwrap();
    let b = registry.create(local("Beta Flow")).await.unwrap();
    assert_eq!(a.route, "alpha");
    assert_eq!(b.route, "beta-flow");
    assert_ne!(a.id, b.id);

    let listed: Vec<String> = registry.list().into_iter().map(|v| v.flow.route).collect();
    assert_eq!(listed, vec!["alpha", "beta-flow"]);
    assert_eq!(store.saved().len(), 2);

    let view = registry.get(&a.id).unwrap();
    assert_eq!(view.flow, a);
    assert_eq!(view.state.phase, Phase::Stopped);

    let err = registry.get(&"missing".into()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_duplicate_route_rejected() {
    let fixture = Fixture::new();
    let registry = fixture.registry(Arc::new(MemoryStore::new()));

    registry.create(local("demo")).await.unwrap();
    let err = registry
        .create(local("Another").with_route("demo"))
        .await
        .unwrap_err();
    assert!(matches!(err, StudioError::DuplicateRoute(route) if route == "demo"));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_invalid_definition_rejected() {
    let fixture = Fixture::new();
    let registry = fixture.registry(Arc::new(MemoryStore::new()));

    let err = registry
        .create(local("x").with_route("not/url safe"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFlow);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_failed_save_leaves_memory_untouched() {
    let fixture = Fixture::new();
    let store = Arc::new(MemoryStore::new());
    let registry = fixture.registry(store.clone());
    let flow = registry.create(local("stable")).await.unwrap();

    store.set_fail_writes(true);
    let err = registry.create(local("lost")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceError);
    assert_eq!(registry.len(), 1);

    let err = registry
        .update(&flow.id, local("renamed"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceError);
    assert_eq!(registry.get(&flow.id).unwrap().flow.route, "stable");

    assert!(registry.set_auto_start(&flow.id, false).await.is_err());
    assert!(registry.get(&flow.id).unwrap().flow.auto_start);

    assert!(registry.delete(&flow.id).await.is_err());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_start_writes_config_and_update_requires_stop() {
    init_tracing();
    let fixture = Fixture::new();
    let registry = fixture.registry(Arc::new(MemoryStore::new()));
    let flow = registry
        .create(local("demo").with_listen_port(9311))
        .await
        .unwrap();

    let state = registry.start(&flow.id).await.unwrap();
    assert_eq!(state.phase, Phase::Running);
    assert_eq!(state.port, Some(9311));

    let config_path = fixture
        .dir
        .path()
        .join("runtime")
        .join(format!("{}.config.json", flow.id));
    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&config_path).unwrap()).unwrap();
    assert_eq!(written["mcpProxy"]["addr"], ":9311");
    assert_eq!(written["mcpServers"]["demo"]["command"], "npx");

    let err = registry.start(&flow.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    let err = registry.update(&flow.id, local("demo2")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FlowBusy);

    // Auto-start may change while running
    let toggled = registry.set_auto_start(&flow.id, false).await.unwrap();
    assert!(!toggled.auto_start);

    registry.stop(&flow.id).await.unwrap();
    assert_eq!(registry.current_state(&flow.id).unwrap().phase, Phase::Stopped);
    let updated = registry.update(&flow.id, local("demo2")).await.unwrap();
    assert_eq!(updated.route, "demo2");
    assert_eq!(updated.created_at, flow.created_at);
}

#[tokio::test]
async fn test_logs_capture_proxy_output() {
    let fixture = Fixture::new();
    let registry = fixture.registry(Arc::new(MemoryStore::new()));
    let flow = registry.create(local("logged")).await.unwrap();

    registry.start(&flow.id).await.unwrap();
    let expected = format!("config {}", fixture.dir.path().join("runtime").join(format!("{}.config.json", flow.id)).display());
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !registry.logs(&flow.id).unwrap().contains(&expected) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    registry.stop(&flow.id).await.unwrap();
}

#[tokio::test]
async fn test_delete_stops_running_flow() {
    let fixture = Fixture::new();
    let store = Arc::new(MemoryStore::new());
    let registry = fixture.registry(store.clone());
    let flow = registry.create(local("doomed")).await.unwrap();
    let keep = registry.create(local("kept")).await.unwrap();

    let pid = registry.start(&flow.id).await.unwrap().pid.unwrap();
    assert!(pid_alive(pid));

    registry.delete(&flow.id).await.unwrap();
    assert!(!pid_alive(pid));
    assert_eq!(registry.get(&flow.id).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.saved().len(), 1);
    assert_eq!(store.saved()[0].id, keep.id);
    assert!(
        !fixture
            .dir
            .path()
            .join("runtime")
            .join(format!("{}.config.json", flow.id))
            .exists()
    );

    let err = registry.start(&flow.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_flows_sharing_a_listen_port_do_not_run_together() {
    let fixture = Fixture::new();
    let runtime = runtime_with(fixture.config.clone(), Arc::new(Prober::new()));
    let mut events = runtime.bus.subscribe();
    let registry = FlowRegistry::new(Arc::new(MemoryStore::new()), runtime);
    // Both fall back to the SSE category port
    let first = registry.create(local("first")).await.unwrap();
    let second = registry.create(local("second")).await.unwrap();
    let other = registry
        .create(local("elsewhere").with_listen_port(9321))
        .await
        .unwrap();

    registry.start(&first.id).await.unwrap();
    let err = registry.start(&second.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PortInUse);
    assert!(matches!(
        &err,
        StudioError::PortInUse { port, holder } if *port == fixture.config.sse_port && *holder == first.id.to_string()
    ));
    assert_eq!(registry.current_state(&second.id).unwrap().phase, Phase::Stopped);

    let failed = next_of(&mut events, EventKind::Failed).await;
    assert_eq!(failed.subject, Subject::Flow(second.id.clone()));
    assert!(matches!(
        failed.payload,
        EventPayload::Failed {
            error: ErrorKind::PortInUse,
            ..
        }
    ));

    // A different port is unaffected
    registry.start(&other.id).await.unwrap();

    registry.stop(&first.id).await.unwrap();
    registry.start(&second.id).await.unwrap();
    let err = registry.start(&first.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PortInUse);
    registry.stop_all().await;
}

#[tokio::test]
async fn test_concurrent_starts_on_one_port_admit_one_flow() {
    let fixture = Fixture::new();
    let registry = fixture.registry(Arc::new(MemoryStore::new()));
    let a = registry.create(local("a")).await.unwrap();
    let b = registry.create(local("b")).await.unwrap();

    let (ra, rb) = tokio::join!(registry.start(&a.id), registry.start(&b.id));
    let kinds: Vec<Option<ErrorKind>> = [ra, rb]
        .into_iter()
        .map(|r| r.err().map(|e| e.kind()))
        .collect();
    assert_eq!(kinds.iter().filter(|k| k.is_none()).count(), 1, "{kinds:?}");
    assert!(kinds.contains(&Some(ErrorKind::PortInUse)));
    registry.stop_all().await;
}

#[tokio::test]
async fn test_preview_without_spawning() {
    let fixture = Fixture::new();
    let registry = fixture.registry(Arc::new(MemoryStore::new()));
    let flow = registry.create(local("preview")).await.unwrap();

    let preview = registry.preview(&flow.id).unwrap();
    assert!(preview.helper.is_none());
    assert_eq!(preview.exposed.program, "sh");
    assert!(preview.exposed.found);
    assert_eq!(preview.port, 8002);
    assert_eq!(registry.current_state(&flow.id).unwrap().phase, Phase::Stopped);
}

#[tokio::test]
async fn test_json_store_survives_reload() {
    let fixture = Fixture::new();
    let store = Arc::new(JsonFileStore::new(fixture.config.data_path.clone()));

    let first = fixture.registry(store.clone());
    let a = first.create(local("one")).await.unwrap();
    let b = first.create(local("two").with_auto_start(false)).await.unwrap();

    let second = fixture.registry(store);
    assert_eq!(second.load().await.unwrap(), 2);
    let flows: Vec<_> = second.list().into_iter().map(|v| v.flow).collect();
    assert_eq!(flows, vec![a, b]);
    assert!(flows.iter().all(|f| second.current_state(&f.id).unwrap().phase == Phase::Stopped));
}

#[tokio::test]
async fn test_openapi_flow_attaches_proxy_to_helper() {
    let fixture = Fixture::new();
    let helper = fixture.dir.path().join("helper.sh");
    std::fs::write(&helper, "exec sleep 30\n").unwrap();
    let config = StudioConfig {
        openapi_helper_bin: format!("sh {}", helper.display()),
        ..fixture.config.clone()
    };
    let probe = Arc::new(FakeProbe::Ready(std::time::Duration::from_millis(20)));
    let registry = FlowRegistry::new(Arc::new(MemoryStore::new()), runtime_with(config, probe));

    let flow = registry
        .create(
            FlowSpec::new(
                "F",
                Source::Openapi {
                    base_url: "http://x/api".into(),
                    spec_url: "http://x/spec.json".into(),
                },
                Target::Sse,
            )
            .with_route("demo"),
        )
        .await
        .unwrap();
    assert_eq!(flow.target, Target::StreamableHttp);

    let state = registry.start(&flow.id).await.unwrap();
    assert_eq!(state.phase, Phase::Running);
    let port = state.port.unwrap();
    assert_eq!(state.exposed_port, Some(8001));
    let helper_pid = state.helper_pid.unwrap();
    assert!(pid_alive(helper_pid));

    let config_path = fixture
        .dir
        .path()
        .join("runtime")
        .join(format!("{}.config.json", flow.id));
    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(config_path).unwrap()).unwrap();
    assert_eq!(
        written["mcpServers"]["demo"]["url"],
        format!("http://127.0.0.1:{port}/mcp")
    );

    registry.stop(&flow.id).await.unwrap();
    assert!(!pid_alive(helper_pid));
}
