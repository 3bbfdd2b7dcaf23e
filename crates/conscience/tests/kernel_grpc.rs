use conscience::grpc::NervousSystemService;
use conscience::nervous_v1::{nervous_system_client::NervousSystemClient, *};
use conscience::Kernel;
use futures_util::stream::StreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tonic::Request;

const TOKEN: &str = "test-token";

async fn spawn_server(
    mode: &str,
) -> (String, Arc<Kernel>, tokio::task::JoinHandle<()>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = store::Store::open(dir.path().join("kernel.db")).unwrap();
    let kernel = Arc::new(
        Kernel::new(
            store,
            audit_log::AuditLog::in_memory(),
            kernel_core::config::DEFAULT_BLOCKED_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            TOKEN.to_string(),
        )
        .unwrap(),
    );
    kernel.set_mode_from(mode).unwrap();
    let svc = NervousSystemService::new(Arc::clone(&kernel)).into_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let h = tokio::spawn(async move {
        let stream = futures_util::stream::unfold(listener, |listener| async move {
            Some((listener.accept().await.ok()?.0, listener))
        })
        .filter_map(|s| async move { Some(Ok::<_, std::io::Error>(s)) });
        Server::builder().add_service(svc).serve_with_incoming(stream).await.unwrap();
    });
    (format!("http://{}", addr), kernel, h, dir)
}

fn authed<T>(msg: T) -> Request<T> {
    let mut req = Request::new(msg);
    req.metadata_mut().insert("authorization", TOKEN.parse().unwrap());
    req
}

fn write_request(request_id: &str, with_override: bool) -> PermissionRequest {
    PermissionRequest {
        request_id: request_id.to_string(),
        intent: "save draft".to_string(),
        actions: vec![Action {
            kind: "WRITE".to_string(),
            payload: [
                ("path".to_string(), "data/draft.md".to_string()),
                ("content".to_string(), "hi".to_string()),
            ]
            .into_iter()
            .collect(),
            risk: 0,
        }],
        expected_window: String::new(),
        trace_id: "trace-1".to_string(),
        r#override: with_override,
        agent_message: String::new(),
    }
}

#[tokio::test]
async fn unauthenticated_calls_are_rejected() {
    let (addr, _kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();
    let res = client.get_system_state(Request::new(Empty {})).await;
    assert_eq!(res.err().unwrap().code(), tonic::Code::Unauthenticated);
}

#[tokio::test]
async fn override_write_flows_to_the_action_stream() {
    let (addr, kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();
    kernel.report_focus("Notes — draft.md", "notes");

    // Without the override the proposal is parked.
    let held = client
        .request_permission(authed(write_request("p-held", false)))
        .await
        .unwrap()
        .into_inner();
    assert!(held.approved && !held.blocked);
    assert_eq!(held.status, "WAITING_FOR_USER");
    assert_eq!(held.risk_level, 7);

    // With it, the command reaches the stream.
    let approved = client
        .request_permission(authed(write_request("p-auto", true)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(approved.status, "APPROVED");

    let mut actions = client
        .stream_actions(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let cmd = actions.message().await.unwrap().unwrap();
    assert_eq!(cmd.proposal_id, "p-auto");
    assert_eq!(cmd.action.as_ref().unwrap().kind, "WRITE");

    // Sentinel reports completion; trust budges.
    client
        .approve_action(authed(ApprovalDecision {
            id: cmd.command_id.clone(),
            approved: false,
            status: "COMPLETED".to_string(),
            response: String::new(),
        }))
        .await
        .unwrap();
    let after = client
        .request_permission(authed(write_request("p-next", true)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(after.trust_score, 1);
}

#[tokio::test]
async fn absolute_path_never_reaches_the_stream() {
    let (addr, _kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();

    let mut req = write_request("p-bad", true);
    req.actions[0]
        .payload
        .insert("path".to_string(), "/etc/passwd".to_string());
    let verdict = client
        .request_permission(authed(req))
        .await
        .unwrap()
        .into_inner();
    assert!(!verdict.approved && verdict.blocked);
    assert!(verdict.reason.contains("unsafe path"));
    assert_eq!(verdict.risk_level, 10);

    let mut actions = client
        .stream_actions(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let nothing =
        tokio::time::timeout(std::time::Duration::from_millis(200), actions.message()).await;
    assert!(nothing.is_err(), "denied proposals must not emit commands");
}

#[tokio::test]
async fn focus_reports_gate_the_expected_window() {
    let (addr, _kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();

    let reports = tokio_stream::iter(vec![FocusState {
        window_title: "Terminal".to_string(),
        process_name: "alacritty".to_string(),
        ts_ms: 1,
    }]);
    let mut req = Request::new(reports);
    req.metadata_mut().insert("authorization", TOKEN.parse().unwrap());
    let ack = client.report_focus(req).await.unwrap().into_inner();
    assert!(ack.ok);

    let mut perm = write_request("p-focus", true);
    perm.expected_window = "Gmail".to_string();
    let verdict = client
        .request_permission(authed(perm))
        .await
        .unwrap()
        .into_inner();
    assert!(verdict.blocked);
    assert_eq!(verdict.error_code, -32003);

    let state = client
        .get_system_state(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.focused_window, "Terminal");
}

#[tokio::test]
async fn pending_queue_is_served_and_decidable() {
    let (addr, _kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();

    client
        .request_permission(authed(write_request("p-queue", false)))
        .await
        .unwrap();
    let pending = client
        .get_pending_approvals(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(pending.approvals.len(), 1);
    assert_eq!(pending.approvals[0].id, "p-queue");
    assert_eq!(pending.approvals[0].status, "WAITING_FOR_USER");
    assert_eq!(pending.approvals[0].risk_score, 70);

    client
        .approve_action(authed(ApprovalDecision {
            id: "p-queue".to_string(),
            approved: true,
            status: String::new(),
            response: String::new(),
        }))
        .await
        .unwrap();

    let mut actions = client
        .stream_actions(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let cmd = actions.message().await.unwrap().unwrap();
    assert_eq!(cmd.proposal_id, "p-queue");

    let empty = client
        .get_pending_approvals(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert!(empty.approvals.is_empty());
}

#[tokio::test]
async fn paused_mode_denies_with_reason() {
    let (addr, _kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();

    client
        .set_system_mode(authed(ModeRequest { mode: "PAUSED".to_string() }))
        .await
        .unwrap();
    let verdict = client
        .request_permission(authed(write_request("p-paused", true)))
        .await
        .unwrap()
        .into_inner();
    assert!(verdict.blocked);
    assert_eq!(verdict.reason, "paused");

    let state = client
        .get_system_state(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.mode, "PAUSED");

    let bad = client
        .set_system_mode(authed(ModeRequest { mode: "HALTED".to_string() }))
        .await;
    assert_eq!(bad.err().unwrap().code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn clarifications_round_trip_through_approve_action() {
    let (addr, _kernel, _h, _dir) = spawn_server("ACTIVE").await;
    let mut client = NervousSystemClient::connect(addr).await.unwrap();

    let verdict = client
        .request_permission(authed(PermissionRequest {
            request_id: "c-1".to_string(),
            intent: "book flight".to_string(),
            actions: vec![],
            expected_window: String::new(),
            trace_id: "t".to_string(),
            r#override: false,
            agent_message: "from which airport?".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(verdict.status, "WAITING_FOR_CONTEXT");

    let pending = client
        .get_pending_approvals(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(pending.approvals[0].interaction_type, "CLARIFICATION");
    assert_eq!(pending.approvals[0].agent_message, "from which airport?");

    client
        .approve_action(authed(ApprovalDecision {
            id: "c-1".to_string(),
            approved: false,
            status: String::new(),
            response: "JFK".to_string(),
        }))
        .await
        .unwrap();

    let state = client
        .get_pending_approvals(authed(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert!(state.approvals.is_empty(), "answered clarification leaves the queue");
}
