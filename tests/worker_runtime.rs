//! The request processor inside a module: dispatch, panic capture, the
//! modified flag.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use watermelon::client::{Functions, Runtime, Service, Services, WorkServer};
use watermelon::proto::CallRequest;

fn worker(functions: Functions, services: Services) -> WorkServer {
    // nothing listens on this address; the runtime is only dialed on demand
    let rt = Arc::new(Runtime::new("127.0.0.1:9", 0));
    WorkServer::new(rt, functions, services)
}

fn call(name: &str, data: &[u8]) -> CallRequest {
    CallRequest {
        session: "s-test".to_string(),
        func_name: name.to_string(),
        data: data.to_vec(),
    }
}

#[derive(Default, Deserialize)]
struct AddReq {
    a: i64,
    b: i64,
}

#[derive(Serialize)]
struct AddRsp {
    sum: i64,
}

#[test]
fn exact_name_dispatch_with_json_mapping() {
    let mut functions = Functions::new();
    functions.add("math.Add", |_s, req: AddReq| Ok(AddRsp { sum: req.a + req.b }));
    let w = worker(functions, Services::new());

    let rsp = w.process(call("math.Add", br#"{"a":2,"b":3}"#));
    assert!(rsp.success);
    assert_eq!(rsp.func_name, "math.Add");
    assert_eq!(rsp.data, br#"{"sum":5}"#);
}

#[test]
fn service_method_dispatch() {
    let mut services = Services::new();
    services.register(
        "pkg",
        Service::new().method("Install", |_s, name: String| {
            Ok(format!("installed {}", name))
        }),
    );
    let w = worker(Functions::new(), services);

    let rsp = w.process(call("pkg.Install", br#""nginx""#));
    assert!(rsp.success);
    assert_eq!(rsp.data, br#""installed nginx""#);

    let rsp = w.process(call("pkg.Remove", b""));
    assert!(!rsp.success);
    assert!(rsp.error_msg.contains("Not found"));
}

#[test]
fn exact_name_wins_over_service_split() {
    let mut functions = Functions::new();
    functions.add_raw("pkg.Install", |_s, _d| Ok(b"exact".to_vec()));
    let mut services = Services::new();
    services.register(
        "pkg",
        Service::new().method("Install", |_s, _name: String| Ok("service")),
    );
    let w = worker(functions, services);

    let rsp = w.process(call("pkg.Install", b""));
    assert_eq!(rsp.data, b"exact");
}

#[test]
fn panic_in_user_code_becomes_a_failed_response() {
    let mut functions = Functions::new();
    functions.add_raw("boom", |_s, _d| panic!("exploded while working"));
    let w = worker(functions, Services::new());

    let rsp = w.process(call("boom", b""));
    assert!(!rsp.success);
    assert!(rsp.error_msg.contains("exploded while working"));

    // the worker survives and keeps serving
    let rsp = w.process(call("boom", b""));
    assert!(!rsp.success);
}

#[test]
fn user_error_is_reported_not_panicking() {
    let mut functions = Functions::new();
    functions.add_nullary("fail", |_s| Err("deliberate".into()));
    let w = worker(functions, Services::new());

    let rsp = w.process(call("fail", b""));
    assert!(!rsp.success);
    assert_eq!(rsp.error_msg, "deliberate");
}

#[test]
fn modified_flag_rides_on_the_response() {
    let mut functions = Functions::new();
    functions.add_raw("touch", |s, _d| {
        s.set_modified();
        Ok(Vec::new())
    });
    functions.add_raw("noop", |_s, _d| Ok(Vec::new()));
    let w = worker(functions, Services::new());

    assert!(w.process(call("touch", b"")).modified);
    assert!(!w.process(call("noop", b"")).modified);
}

#[test]
fn empty_payload_decodes_to_default() {
    let mut functions = Functions::new();
    functions.add("sum", |_s, req: AddReq| Ok(req.a + req.b));
    let w = worker(functions, Services::new());

    let rsp = w.process(call("sum", b""));
    assert!(rsp.success);
    assert_eq!(rsp.data, b"0");
}
