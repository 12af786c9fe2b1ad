//! End-to-end remote operations: a real orchestrator listener, a client
//! runtime dialing it, and hosts backed by the local machine.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use watermelon::client::{Runtime, Session as ClientSession};
use watermelon::host::backend::init_backends;
use watermelon::host::{FileDesc, Host, HostInfo};
use watermelon::inventory::{InvServer, Selector, ALL_HOSTS};
use watermelon::module::LifecycleManager;
use watermelon::{server, session};

fn local_host(id: &str, labels: &[&str]) -> Arc<Host> {
    Arc::new(Host {
        info: HostInfo {
            id: id.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            ..HostInfo::default()
        },
        backend: "localhost".to_string(),
        ..Host::default()
    })
}

struct Fixture {
    session: Arc<session::Session>,
    client: ClientSession,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.session.close();
    }
}

fn setup(hosts: Vec<Arc<Host>>) -> Fixture {
    init_backends();
    let s = session::new_session();
    s.set_inv(Arc::new(InvServer::new(hosts)));
    let mgr = Arc::new(LifecycleManager::new());
    s.set_modules(mgr.clone());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    server::spawn(listener, mgr);

    let rt = Arc::new(Runtime::new(addr, 0));
    let client = rt.session(s.id());
    Fixture { session: s, client }
}

#[test]
fn select_by_label_over_the_wire() {
    let fx = setup(vec![
        local_host("h1", &["l1", "l2"]),
        local_host("h2", &[]),
        local_host("h3", &["lx"]),
    ]);
    let inv = fx
        .client
        .select(ALL_HOSTS, vec![Selector::has_all_of(&["l1"])]);
    assert_eq!(fx.client.get_host_ids(&inv), vec!["h1"]);
    fx.client.release(&inv);
}

#[test]
fn union_and_make_over_the_wire() {
    let fx = setup(vec![local_host("h1", &[]), local_host("h2", &[])]);
    let a = fx.client.make(vec!["h1".into()]);
    let b = fx.client.make(vec!["h2".into()]);
    let u = fx.client.union(vec![a.clone(), b.clone()]);
    assert_eq!(fx.client.get_host_ids(&u), vec!["h1", "h2"]);
    let grown = fx.client.add(&a, vec!["h2".into()]);
    assert_eq!(fx.client.get_host_ids(&grown), vec!["h1", "h2"]);
    // canonicalisation applies across the wire as well
    assert_eq!(u, grown);
}

#[test]
fn command_reports_exit_codes() {
    let fx = setup(vec![local_host("h1", &[])]);
    let out = fx.client.command_may_fail("h1", "printf hi; exit 7").unwrap();
    assert_eq!(out.exit_code, 7);
    assert_eq!(out.out(), "hi");
}

#[test]
fn invalid_session_is_a_wire_error() {
    let fx = setup(vec![local_host("h1", &[])]);
    let rt = fx.client.runtime().clone();
    let bogus = rt.session("no-such-session");
    assert!(bogus.command_may_fail("h1", "true").is_err());
}

#[test]
fn write_if_different_is_idempotent() {
    let fx = setup(vec![local_host("h1", &[])]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg").to_string_lossy().into_owned();

    let first = fx
        .client
        .write_file_if_different("h1", &path, 0o644, b"content".to_vec())
        .unwrap();
    assert!(first);
    let second = fx
        .client
        .write_file_if_different("h1", &path, 0o644, b"content".to_vec())
        .unwrap();
    assert!(!second);
    assert!(fx.client.modified());
}

#[test]
fn template_write_only_when_output_differs() {
    let fx = setup(vec![local_host("h1", &[])]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeting").to_string_lossy().into_owned();
    std::fs::write(&path, "hello world").unwrap();

    let changed = fx
        .client
        .write_file_from_template("h1", &path, 0o644, "hello {{ name }}", &json!({"name": "world"}))
        .unwrap();
    assert!(!changed);

    std::fs::write(&path, "hello there").unwrap();
    let changed = fx
        .client
        .write_file_from_template("h1", &path, 0o644, "hello {{ name }}", &json!({"name": "world"}))
        .unwrap();
    assert!(changed);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
}

#[test]
fn copy_only_when_destination_differs() {
    let fx = setup(vec![local_host("ha", &[]), local_host("hb", &[])]);
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src").to_string_lossy().into_owned();
    let dst = dir.path().join("dst").to_string_lossy().into_owned();
    std::fs::write(&src, "x").unwrap();
    std::fs::write(&dst, "x").unwrap();

    let changed = fx.client.copy_if_different("ha", &src, "hb", &dst).unwrap();
    assert!(!changed);

    std::fs::write(&src, "y").unwrap();
    let changed = fx.client.copy_if_different("ha", &src, "hb", &dst).unwrap();
    assert!(changed);
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "y");
}

#[test]
fn copy_of_a_missing_source_is_a_command_error() {
    let fx = setup(vec![local_host("ha", &[]), local_host("hb", &[])]);
    let err = fx
        .client
        .copy_if_different("ha", "/definitely/not/there", "hb", "/tmp/unused")
        .unwrap_err();
    assert!(err.msg.contains("does not exist"));
}

#[test]
fn ensure_converges() {
    let fx = setup(vec![local_host("h1", &[])]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").to_string_lossy().into_owned();

    let desc = FileDesc::new().ensure_dir().ensure_mode(0o750);
    let changed = fx.client.ensure("h1", &path, desc.clone()).unwrap();
    assert!(changed);
    let changed = fx.client.ensure("h1", &path, desc).unwrap();
    assert!(!changed);

    let (info, _) = fx.client.get_file_info("h1", &path);
    let info = info.unwrap();
    assert!(info.dir);
    assert_eq!(info.mode & 0o777, 0o750);
}

#[test]
fn read_missing_file_returns_nothing() {
    let fx = setup(vec![local_host("h1", &[])]);
    let (info, data) = fx.client.read_file("h1", "/definitely/not/there");
    assert!(info.is_none());
    assert!(data.is_none());
    assert!(!fx.client.exists("h1", "/definitely/not/there"));
}

#[test]
fn fan_out_isolates_failures() {
    let fx = setup(vec![
        local_host("h1", &[]),
        local_host("h2", &[]),
        local_host("h3", &[]),
    ]);
    let calls = Arc::new(AtomicUsize::new(0));
    let per_host: Arc<parking_lot::Mutex<HashMap<String, usize>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));

    let ok = fx.client.for_all(ALL_HOSTS, |host| {
        calls.fetch_add(1, Ordering::SeqCst);
        *per_host.lock().entry(host.id.clone()).or_insert(0) += 1;
        if host.id == "h2" {
            return Err("synthetic failure".into());
        }
        Ok(())
    });
    assert!(!ok);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let per_host = per_host.lock();
    for h in ["h1", "h2", "h3"] {
        assert_eq!(per_host.get(h), Some(&1));
    }
}

#[test]
fn serial_fan_out_short_circuits() {
    let fx = setup(vec![
        local_host("h1", &[]),
        local_host("h2", &[]),
        local_host("h3", &[]),
    ]);
    let calls = Arc::new(AtomicUsize::new(0));
    let ok = fx.client.for_all_serial(ALL_HOSTS, |host| {
        calls.fetch_add(1, Ordering::SeqCst);
        if host.id == "h2" {
            return Err("stop".into());
        }
        Ok(())
    });
    assert!(!ok);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn wait_host_succeeds_for_a_reachable_host() {
    let fx = setup(vec![local_host("h1", &[])]);
    fx.client
        .wait_host("h1", Duration::from_secs(30))
        .unwrap();
}

#[test]
fn cfg_lookup_with_reference_expansion() {
    let fx = setup(vec![local_host("h1", &[])]);
    fx.session.set_config(Some(json!({
        "common": {"user": "svc"},
        "db": {"owner": {"valueFrom": "/common/user"}}
    })));
    fx.session
        .register_expander(Arc::new(watermelon::session::ext::ValueFromExpander));

    let owner: String = fx.client.get_cfg("/db/owner").unwrap();
    assert_eq!(owner, "svc");
    assert!(fx.client.get_cfg_json("/db/missing").is_none());
}

#[test]
fn args_round_trip() {
    let fx = setup(vec![local_host("h1", &[])]);
    fx.session.set_args(vec!["--flag".into(), "value".into()]);
    assert_eq!(fx.client.args(), vec!["--flag", "value"]);
}
