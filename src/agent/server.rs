use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::errors::{TowerError, TowerResult};
use crate::recognition::registry::RecognitionRegistry;
use crate::recognition::traits::{CustomRecognition, RecognitionHost};
use crate::recognition::types::{AnalyzeArgs, AnalyzeResult};

/// The framework side of an agent process: registration, the session
/// lifecycle and nothing else. The host drives every invocation.
pub trait AgentBackend: Send + Sync + 'static {
    fn register_recognition(&self, name: &str, handler: Arc<dyn CustomRecognition>) -> TowerResult<()>;

    /// Connect to the host listening under `identifier`.
    fn start_up(&self, identifier: &str) -> TowerResult<()>;

    /// Block until the host ends the session.
    fn join(&self);

    fn shut_down(&self);
}

/// Registers every known custom recognition and keeps the host session alive.
pub struct AgentServer<B: AgentBackend> {
    backend: Arc<B>,
    registry: RecognitionRegistry,
    started: bool,
}

impl<B: AgentBackend> AgentServer<B> {
    pub fn new(backend: B, registry: RecognitionRegistry) -> Self {
        Self {
            backend: Arc::new(backend),
            registry,
            started: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn start_up(&mut self, identifier: &str) -> TowerResult<()> {
        if self.started {
            return Err(TowerError::Agent("agent server already started".into()));
        }
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(TowerError::Config("socket identifier is empty".into()));
        }

        for name in self.registry.list_names() {
            let handler = self.registry.get(&name)?;
            self.backend.register_recognition(&name, handler)?;
            tracing::info!(recognition = %name, "custom recognition registered");
        }

        self.backend.start_up(identifier)?;
        self.started = true;
        tracing::info!(identifier = %identifier, "agent server started");
        Ok(())
    }

    /// Wait until the host ends the session or the process is interrupted.
    ///
    /// A panic on the session thread is reported as soon as it happens.
    pub async fn join(&self) -> TowerResult<()> {
        if !self.started {
            return Ok(());
        }
        let backend = self.backend.clone();
        let mut session = tokio::task::spawn_blocking(move || backend.join());

        tokio::select! {
            joined = &mut session => session_outcome(joined),
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::info!("interrupt received, leaving session");
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for interrupts, waiting for host");
                    session_outcome(session.await)
                }
            },
        }
    }

    pub fn shut_down(&mut self) {
        if self.started {
            self.backend.shut_down();
            self.started = false;
            tracing::info!("agent server shut down");
        }
    }
}

fn session_outcome(joined: Result<(), tokio::task::JoinError>) -> TowerResult<()> {
    match joined {
        Ok(()) => {
            tracing::info!("host ended the session");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "agent session task failed");
            Err(TowerError::Agent(format!("agent session task failed: {e}")))
        }
    }
}

/// Run one invocation to completion on `runtime`.
///
/// Handler errors are logged and reported to the host as "nothing
/// recognized", with the error text as detail.
pub fn run_analysis(
    runtime: &Runtime,
    handler: &dyn CustomRecognition,
    host: &dyn RecognitionHost,
    args: AnalyzeArgs<'_>,
) -> AnalyzeResult {
    match runtime.block_on(handler.analyze(host, args)) {
        Ok(result) => {
            tracing::info!(
                task = %args.task,
                recognition = %args.name,
                detail = %result.detail,
                "analyze finished"
            );
            result
        }
        Err(e) => {
            tracing::warn!(task = %args.task, recognition = %args.name, error = %e, "analyze failed");
            AnalyzeResult {
                rect: None,
                detail: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::config::AppConfig;
    use crate::recognition::types::{test_frame, Frame, RecognitionDetail, Rect};

    #[derive(Default)]
    struct FakeBackend {
        events: Mutex<Vec<String>>,
        reject_registration: bool,
        panic_on_join: bool,
    }

    impl FakeBackend {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl AgentBackend for FakeBackend {
        fn register_recognition(&self, name: &str, _handler: Arc<dyn CustomRecognition>) -> TowerResult<()> {
            if self.reject_registration {
                return Err(TowerError::Agent(format!("refused {name}")));
            }
            self.record(format!("register {name}"));
            Ok(())
        }

        fn start_up(&self, identifier: &str) -> TowerResult<()> {
            self.record(format!("start {identifier}"));
            Ok(())
        }

        fn join(&self) {
            if self.panic_on_join {
                panic!("session thread crashed");
            }
            self.record("join".into());
        }

        fn shut_down(&self) {
            self.record("shut_down".into());
        }
    }

    fn server(backend: FakeBackend) -> AgentServer<FakeBackend> {
        AgentServer::new(backend, RecognitionRegistry::from_config(&AppConfig::default()))
    }

    #[tokio::test]
    async fn lifecycle_registers_before_start() {
        let mut server = server(FakeBackend::default());
        server.start_up(" 7b1c-socket ").unwrap();
        server.join().await.unwrap();
        server.shut_down();
        server.shut_down();

        assert_eq!(
            server.backend().events(),
            vec!["register auto_tower", "start 7b1c-socket", "join", "shut_down"]
        );
    }

    #[tokio::test]
    async fn empty_identifier_is_rejected() {
        let mut server = server(FakeBackend::default());
        let err = server.start_up("   ").unwrap_err();
        assert!(matches!(err, TowerError::Config(_)));
        assert!(server.backend().events().is_empty());
    }

    #[tokio::test]
    async fn failed_registration_stops_start_up() {
        let mut server = server(FakeBackend {
            reject_registration: true,
            ..FakeBackend::default()
        });
        let err = server.start_up("sock").unwrap_err();
        assert!(matches!(err, TowerError::Agent(_)));
        assert!(server.backend().events().is_empty());

        // Never started, so there is nothing to wait for or stop.
        server.join().await.unwrap();
        server.shut_down();
        assert!(server.backend().events().is_empty());
    }

    #[tokio::test]
    async fn second_start_up_is_rejected() {
        let mut server = server(FakeBackend::default());
        server.start_up("sock").unwrap();
        assert!(matches!(server.start_up("sock"), Err(TowerError::Agent(_))));
    }

    #[tokio::test]
    async fn session_panic_is_reported_from_join() {
        let mut server = server(FakeBackend {
            panic_on_join: true,
            ..FakeBackend::default()
        });
        server.start_up("sock").unwrap();

        let err = server.join().await.unwrap_err();
        assert!(matches!(err, TowerError::Agent(ref m) if m.contains("session task failed")));
    }

    /// Host that finds one label and misses everything else.
    struct OneLabelHost {
        label: &'static str,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecognitionHost for OneLabelHost {
        async fn run_recognition(
            &self,
            entry: &str,
            _frame: &Frame,
            pipeline_override: Value,
        ) -> TowerResult<Option<RecognitionDetail>> {
            let node = &pipeline_override[entry];
            let target = node["expected"]
                .as_str()
                .or_else(|| node["template"][0].as_str())
                .unwrap_or_default()
                .to_string();
            self.calls.lock().unwrap().push(target.clone());
            Ok(Some(if target == self.label {
                RecognitionDetail::hit(Rect::new(40, 50, 60, 20))
            } else {
                RecognitionDetail::miss()
            }))
        }
    }

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn run_analysis_returns_found_box() {
        let registry = RecognitionRegistry::from_config(&AppConfig::default());
        let handler = registry.get("auto_tower").unwrap();
        let host = OneLabelHost {
            label: "C",
            calls: Mutex::new(Vec::new()),
        };
        // The framework hands the parameter block over as JSON text.
        let param = Value::String(json!({"work": r#"{"3": ["A", "B"], "2": ["C"]}"#}).to_string());
        let frame = test_frame(320, 240);

        let result = run_analysis(
            &runtime(),
            handler.as_ref(),
            &host,
            AnalyzeArgs {
                task: "PickTower",
                name: "auto_tower",
                custom_param: &param,
                frame: &frame,
            },
        );

        assert_eq!(result.rect, Some(Rect::new(40, 50, 60, 20)));
        assert_eq!(result.detail, "Found C with priority 2");
        assert_eq!(*host.calls.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn run_analysis_turns_errors_into_no_result() {
        let registry = RecognitionRegistry::from_config(&AppConfig::default());
        let handler = registry.get("auto_tower").unwrap();
        let host = OneLabelHost {
            label: "C",
            calls: Mutex::new(Vec::new()),
        };
        let param = json!({"work": "{not json"});
        let frame = test_frame(32, 32);

        let result = run_analysis(
            &runtime(),
            handler.as_ref(),
            &host,
            AnalyzeArgs {
                task: "PickTower",
                name: "auto_tower",
                custom_param: &param,
                frame: &frame,
            },
        );

        assert_eq!(result.rect, None);
        assert!(result.detail.contains("Configuration error"));
        assert!(host.calls.lock().unwrap().is_empty());
    }
}
