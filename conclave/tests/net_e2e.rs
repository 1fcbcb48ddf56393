//! End-to-end over real sockets: three engines on loopback TCP, full
//! handshake + framing + peer reconnect machinery, one value delivered
//! everywhere.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use conclave::app::{Application, DeliveryStatus};
use conclave::engine::{Engine, Env};
use conclave::fsm::{self, FsmEvent};
use conclave::msg::{AppData, Cargo, Member};
use conclave::net;
use conclave::site::Site;
use conclave::synode::{NULL_SYNODE, Synode};
use conclave::EngineConfig;
use conclave_core::{NetworkAddress, NetworkProvider, NodeUid, TcpListenerTrait, TokioProviders};

#[derive(Default)]
struct RecordingApp {
    delivered: RefCell<Vec<Vec<u8>>>,
}

impl Application for RecordingApp {
    fn deliver(&self, _site: Option<&Site>, data: &AppData, status: DeliveryStatus) {
        if status != DeliveryStatus::Ok {
            return;
        }
        if let Cargo::App(bytes) = &data.cargo {
            self.delivered.borrow_mut().push(bytes.clone());
        }
    }

    fn deliver_view(&self, _site: &Site, _synode: Synode) {}

    fn app_snapshot(&self) -> (Vec<u8>, Synode) {
        (Vec::new(), NULL_SYNODE)
    }

    fn handle_app_snapshot(&self, _blob: &[u8], _log_start: Synode, _log_end: Synode) {}
}

const GROUP: u32 = 0x7E57;

#[tokio::test]
async fn three_nodes_over_loopback_tcp() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    tokio::task::LocalSet::new()
        .run_until(async {
            let env = Rc::new(Env::new(TokioProviders::new()));

            // Bind first so the member list carries real ports.
            let mut listeners = Vec::new();
            let mut members = Vec::new();
            for i in 0..3u64 {
                let listener = env
                    .network()
                    .bind("127.0.0.1:0")
                    .await
                    .expect("bind loopback");
                let addr: NetworkAddress = listener
                    .local_addr()
                    .expect("local addr")
                    .parse()
                    .expect("parse addr");
                members.push(Member::new(addr, NodeUid::new(0xE2E, i + 1)));
                listeners.push(listener);
            }

            let mut engines = Vec::new();
            let mut apps = Vec::new();
            for member in &members {
                let app = Rc::new(RecordingApp::default());
                let engine = Engine::new(
                    EngineConfig::for_tests(),
                    member.address,
                    member.uid,
                    member.address.port as u32,
                    app.clone(),
                );
                engines.push(engine);
                apps.push(app);
            }

            for (engine, listener) in engines.iter().zip(listeners) {
                fsm::dispatch(engine, &env, FsmEvent::Init);
                let mut boot = AppData::command(GROUP, Cargo::UnifiedBoot(members.clone()));
                boot.app_key = Synode::new(GROUP, 1, 0);
                let state = fsm::dispatch(engine, &env, FsmEvent::NetBoot(boot));
                assert_eq!(state, conclave::FsmState::Run);
                net::start_network::<TokioProviders>(engine, &env, listener);
            }

            engines[0].submit(AppData::app(b"over-the-wire".to_vec()));

            let deadline = std::time::Instant::now() + Duration::from_secs(30);
            loop {
                let all_delivered = apps.iter().all(|app| {
                    app.delivered
                        .borrow()
                        .iter()
                        .any(|v| v == b"over-the-wire")
                });
                if all_delivered {
                    break;
                }
                assert!(
                    std::time::Instant::now() < deadline,
                    "value should be delivered everywhere within the deadline"
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            // Everyone delivered the same application sequence.
            let reference = apps[0].delivered.borrow().clone();
            for app in &apps[1..] {
                assert_eq!(*app.delivered.borrow(), reference);
            }
        })
        .await;
}
