//! Lifecycle manager behaviour with in-memory streams standing in for the
//! module connections.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use watermelon::client::{Functions, Runtime, Services, WorkServer};
use watermelon::error::{Error, Result};
use watermelon::module::{LifecycleManager, LifecycleStream};
use watermelon::proto::LifecycleMsg;

struct ChanStream {
    tx: flume::Sender<LifecycleMsg>,
    rx: flume::Receiver<LifecycleMsg>,
}

impl LifecycleStream for ChanStream {
    fn send(&mut self, msg: &LifecycleMsg) -> Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| Error::Protocol("stream closed".into()))
    }

    fn recv(&mut self) -> Result<LifecycleMsg> {
        self.rx
            .recv()
            .map_err(|_| Error::Protocol("stream closed".into()))
    }
}

fn duplex() -> (ChanStream, ChanStream) {
    let (atx, arx) = flume::unbounded();
    let (btx, brx) = flume::unbounded();
    (
        ChanStream { tx: atx, rx: brx },
        ChanStream { tx: btx, rx: arx },
    )
}

struct Fixture {
    mgr: Arc<LifecycleManager>,
    _dir: tempfile::TempDir,
    terms: Arc<AtomicUsize>,
}

/// A manager whose module script spawns an in-process fake module: it
/// connects back immediately and answers pings until terminated.
fn fixture(modules: &[&str], worker_port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    for m in modules {
        let path = dir.path().join(*m);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("module.w"), "#!/bin/sh\n").unwrap();
    }

    let slot: Arc<OnceCell<Arc<LifecycleManager>>> = Arc::new(OnceCell::new());
    let terms = Arc::new(AtomicUsize::new(0));

    let mut mgr = LifecycleManager::new();
    mgr.module_lookup_dirs = vec![dir.path().to_path_buf()];
    mgr.run_module_script = {
        let slot = slot.clone();
        let terms = terms.clone();
        Arc::new(move |_first, _dir: &std::path::Path| {
            let mgr = slot.get().expect("manager registered").clone();
            let (server_side, mut client_side) = duplex();
            let terms = terms.clone();
            std::thread::spawn(move || {
                client_side
                    .send(&LifecycleMsg::Connect { port: worker_port })
                    .unwrap();
                loop {
                    match client_side.recv() {
                        Ok(LifecycleMsg::Ping) => {
                            client_side.send(&LifecycleMsg::Pong).unwrap();
                        }
                        Ok(LifecycleMsg::Term) | Err(_) => {
                            terms.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                        Ok(_) => {}
                    }
                }
            });
            std::thread::spawn(move || {
                let _ = mgr.connect(server_side);
            });
            Ok(())
        })
    };
    let mgr = Arc::new(mgr);
    slot.set(mgr.clone()).ok().expect("slot set once");
    Fixture {
        mgr,
        _dir: dir,
        terms,
    }
}

#[test]
fn load_registers_and_caches_the_module() {
    let fx = fixture(&["db"], 1);
    let a = fx.mgr.load("db").unwrap();
    let b = fx.mgr.load("db").unwrap();
    assert_eq!(a.server, "localhost:1");
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn missing_module_fails() {
    let fx = fixture(&["db"], 1);
    assert!(matches!(
        fx.mgr.load("nope"),
        Err(Error::ModuleNotFound(_))
    ));
}

#[test]
fn ping_round_trips_and_updates_last_ping() {
    let fx = fixture(&["db"], 1);
    let mi = fx.mgr.load("db").unwrap();
    assert!(mi.last_ping().is_none());
    mi.ping().unwrap();
    let first = mi.last_ping().unwrap();
    mi.ping().unwrap();
    assert!(mi.last_ping().unwrap() >= first);
}

#[test]
fn pings_are_serialised_per_module() {
    let fx = fixture(&["db"], 1);
    let mi = fx.mgr.load("db").unwrap();
    std::thread::scope(|scope| {
        for _ in 0..8 {
            let mi = &mi;
            scope.spawn(move || {
                for _ in 0..16 {
                    mi.ping().unwrap();
                }
            });
        }
    });
    assert!(mi.last_ping().is_some());
}

#[test]
fn concurrent_loads_do_not_corrupt_the_scratch_slot() {
    let names: Vec<String> = (0..50)
        .flat_map(|i| [format!("a{}", i), format!("b{}", i)])
        .collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let fx = fixture(&name_refs, 1);

    let failed = AtomicBool::new(false);
    std::thread::scope(|scope| {
        for half in [0usize, 1] {
            let mgr = fx.mgr.clone();
            let names = &names;
            let failed = &failed;
            scope.spawn(move || {
                for name in names.iter().skip(half).step_by(2) {
                    if mgr.load(name).is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                }
            });
        }
    });
    assert!(!failed.load(Ordering::SeqCst));
    for name in &names {
        assert!(fx.mgr.get_module(name).is_some());
    }
}

#[test]
fn close_terminates_every_module() {
    let fx = fixture(&["a", "b", "c"], 1);
    for m in ["a", "b", "c"] {
        fx.mgr.load(m).unwrap();
    }
    fx.mgr.close();
    for m in ["a", "b", "c"] {
        assert!(fx.mgr.get_module(m).is_none());
    }
    // term is best-effort but the in-memory modules all see it
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while fx.terms.load(Ordering::SeqCst) < 3 {
        assert!(std::time::Instant::now() < deadline, "modules not terminated");
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

#[test]
fn send_request_reaches_the_module_worker() {
    // a real request processor on a loopback port
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let rt = Arc::new(Runtime::new("127.0.0.1:1", port));
    let mut functions = Functions::new();
    functions.add("greet", |_s, name: String| {
        Ok(format!("hello {}", name))
    });
    let server = Arc::new(WorkServer::new(rt, functions, Services::new()));
    std::thread::spawn({
        let server = server.clone();
        move || server.serve(listener)
    });

    let fx = fixture(&["greeter"], port);
    let rsp = fx
        .mgr
        .send_request("s-x", "greeter", "greet", br#""world""#)
        .unwrap();
    assert!(rsp.success, "error: {}", rsp.error_msg);
    assert_eq!(rsp.data, br#""hello world""#);
    assert_eq!(rsp.func_name, "greet");
}

#[test]
fn module_dirs_resolve_nested_names() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("pkg/sub");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("module.w"), "").unwrap();

    let mut mgr = LifecycleManager::new();
    mgr.module_lookup_dirs = vec![PathBuf::from("/nonexistent"), dir.path().to_path_buf()];
    assert_eq!(mgr.search_module_dir("pkg/sub"), Some(nested));
    assert!(mgr.search_module_dir("pkg").is_none());
}
