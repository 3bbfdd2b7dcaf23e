//! Binary RPC plane: the `NervousSystem` tonic service.
//!
//! A thin adaptor: every call authenticates against the boot token and
//! delegates to the kernel pipeline. No approval logic lives here.

use approval::{ApprovalError, PendingApproval};
use kernel_core::action::{Action, Proposal};
use kernel_core::state::ClientType;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};
use tracing::{instrument, warn};

use crate::auth::check_grpc_auth;
use crate::kernel::{Kernel, KernelError, PermissionVerdict};
use crate::nervous_v1::{
    nervous_system_server::{NervousSystem, NervousSystemServer},
    Ack, ActionCommand, ApprovalDecision, Empty, FocusState, ModeRequest, PendingList,
    PermissionRequest, PermissionResponse, SystemState,
};

/// gRPC front of the kernel.
#[derive(Clone)]
pub struct NervousSystemService {
    kernel: Arc<Kernel>,
}

impl NervousSystemService {
    /// Service over a shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Wrap into the generated tonic server.
    pub fn into_server(self) -> NervousSystemServer<Self> {
        NervousSystemServer::new(self)
    }

    fn authed<T>(&self, req: &Request<T>) -> Result<(), Status> {
        check_grpc_auth(req.metadata(), self.kernel.token())
    }
}

#[tonic::async_trait]
impl NervousSystem for NervousSystemService {
    #[instrument(skip_all)]
    async fn report_focus(
        &self,
        req: Request<Streaming<FocusState>>,
    ) -> Result<Response<Ack>, Status> {
        self.authed(&req)?;
        let mut stream = req.into_inner();
        let mut reports = 0u64;
        while let Some(state) = stream.message().await? {
            self.kernel.report_focus(&state.window_title, &state.process_name);
            reports += 1;
        }
        Ok(Response::new(Ack { ok: true, message: format!("{reports} focus reports") }))
    }

    #[instrument(skip_all)]
    async fn request_permission(
        &self,
        req: Request<PermissionRequest>,
    ) -> Result<Response<PermissionResponse>, Status> {
        self.authed(&req)?;
        let proposal = proposal_from_request(req.into_inner());
        let verdict = self.kernel.request_permission(proposal).map_err(kernel_status)?;
        Ok(Response::new(verdict_to_response(verdict)))
    }

    type StreamActionsStream =
        tokio_stream::wrappers::ReceiverStream<Result<ActionCommand, Status>>;

    #[instrument(skip_all)]
    async fn stream_actions(
        &self,
        req: Request<Empty>,
    ) -> Result<Response<Self::StreamActionsStream>, Status> {
        self.authed(&req)?;
        self.kernel.registry().register("grpc-sentinel-stream", ClientType::Sentinel);
        let (tx, rx) = mpsc::channel(16);
        let receiver = self.kernel.dispatcher().receiver();
        let metrics = self.kernel.dispatcher().metrics().clone();
        let kernel = Arc::clone(&self.kernel);
        tokio::spawn(async move {
            // Exactly one stream drains at a time; a reconnecting Sentinel
            // takes over once this lock drops. Watching tx.closed() releases
            // the lock as soon as the client goes away, not on the next
            // command.
            let mut commands = receiver.lock().await;
            loop {
                tokio::select! {
                    cmd = commands.recv() => {
                        let Some(cmd) = cmd else { break };
                        let message = ActionCommand {
                            command_id: cmd.command_id.clone(),
                            proposal_id: cmd.proposal_id.clone(),
                            action: Some(action_to_proto(&cmd.action)),
                        };
                        if tx.send(Ok(message)).await.is_err() {
                            warn!(command_id = %cmd.command_id, "sentinel stream gone; command lost");
                            break;
                        }
                        metrics.record_delivered();
                    }
                    _ = tx.closed() => break,
                }
            }
            kernel.registry().remove("grpc-sentinel-stream");
        });
        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    #[instrument(skip_all)]
    async fn get_system_state(
        &self,
        req: Request<Empty>,
    ) -> Result<Response<SystemState>, Status> {
        self.authed(&req)?;
        let snapshot = self.kernel.session_snapshot().map_err(kernel_status)?;
        Ok(Response::new(SystemState {
            mode: snapshot.mode,
            focused_window: snapshot.focus.window_title,
            focused_process: snapshot.focus.process_name,
            pending_count: snapshot.pending.len() as u32,
            uptime_ms: snapshot.uptime_ms,
        }))
    }

    #[instrument(skip_all)]
    async fn get_pending_approvals(
        &self,
        req: Request<Empty>,
    ) -> Result<Response<PendingList>, Status> {
        self.authed(&req)?;
        let pending = self.kernel.coordinator().list_pending().map_err(approval_status)?;
        Ok(Response::new(PendingList {
            approvals: pending.iter().map(pending_to_proto).collect(),
        }))
    }

    #[instrument(skip_all)]
    async fn approve_action(
        &self,
        req: Request<ApprovalDecision>,
    ) -> Result<Response<Ack>, Status> {
        self.authed(&req)?;
        let r = req.into_inner();
        match r.status.as_str() {
            "COMPLETED" | "FAILED" => {
                self.kernel
                    .report_outcome(&r.id, r.status == "COMPLETED")
                    .map_err(kernel_status)?;
                Ok(Response::new(Ack { ok: true, message: format!("{} {}", r.id, r.status) }))
            }
            "" => {
                if r.response.is_empty() {
                    let decided =
                        self.kernel.decide_approval(&r.id, r.approved).map_err(kernel_status)?;
                    Ok(Response::new(Ack {
                        ok: true,
                        message: decided.status.as_str().to_string(),
                    }))
                } else {
                    let updated = self
                        .kernel
                        .reply_clarification(&r.id, &r.response)
                        .map_err(kernel_status)?;
                    Ok(Response::new(Ack {
                        ok: true,
                        message: updated.status.as_str().to_string(),
                    }))
                }
            }
            other => Err(Status::invalid_argument(format!("unknown status {other:?}"))),
        }
    }

    #[instrument(skip_all)]
    async fn set_system_mode(
        &self,
        req: Request<ModeRequest>,
    ) -> Result<Response<Ack>, Status> {
        self.authed(&req)?;
        let r = req.into_inner();
        let mode = self.kernel.set_mode_from(&r.mode).map_err(kernel_status)?;
        Ok(Response::new(Ack { ok: true, message: mode.as_str().to_string() }))
    }
}

fn proposal_from_request(r: PermissionRequest) -> Proposal {
    Proposal {
        id: r.request_id,
        intent: r.intent,
        actions: r.actions.into_iter().map(action_from_proto).collect(),
        expected_window: (!r.expected_window.is_empty()).then_some(r.expected_window),
        trace_id: r.trace_id,
        override_requested: r.r#override,
        agent_message: (!r.agent_message.is_empty()).then_some(r.agent_message),
    }
}

fn action_from_proto(a: crate::nervous_v1::Action) -> Action {
    Action {
        kind: a.kind,
        payload: a.payload.into_iter().collect(),
        risk: (a.risk > 0).then(|| a.risk.min(10) as u8),
    }
}

fn action_to_proto(a: &Action) -> crate::nervous_v1::Action {
    crate::nervous_v1::Action {
        kind: a.kind.clone(),
        payload: a.payload.clone().into_iter().collect(),
        risk: u32::from(a.risk.unwrap_or(0)),
    }
}

fn verdict_to_response(v: PermissionVerdict) -> PermissionResponse {
    PermissionResponse {
        request_id: v.request_id,
        approved: v.approved,
        blocked: v.blocked,
        reason: v.reason.unwrap_or_default(),
        risk_level: u32::from(v.risk_level),
        trust_score: u32::from(v.trust_score),
        status: v.status.as_str().to_string(),
        cached_plan: v.cached_plan.unwrap_or_default(),
        error_code: v.error_code.map_or(0, |c| c as i32),
    }
}

fn pending_to_proto(p: &PendingApproval) -> crate::nervous_v1::PendingApproval {
    crate::nervous_v1::PendingApproval {
        id: p.id.clone(),
        intent: p.proposal.intent.clone(),
        risk_score: u32::from(p.risk_score),
        status: p.status.as_str().to_string(),
        created_at_ms: p.created_at_ms,
        interaction_type: p.interaction_type.as_str().to_string(),
        agent_message: p.agent_message.clone().unwrap_or_default(),
        user_response: p.user_response.clone().unwrap_or_default(),
    }
}

fn kernel_status(e: KernelError) -> Status {
    match e {
        KernelError::Validator => Status::internal("validator error"),
        KernelError::UnknownMode(m) => Status::invalid_argument(format!("unknown mode {m:?}")),
        KernelError::UnknownCommand(c) => Status::not_found(format!("unknown command {c}")),
        KernelError::Approval(inner) => approval_status(inner),
        KernelError::Store(_) => Status::internal("storage error"),
    }
}

fn approval_status(e: ApprovalError) -> Status {
    match e {
        ApprovalError::NotFound(id) => Status::not_found(format!("proposal {id} not found")),
        ApprovalError::InvalidTransition { id, actual, expected } => Status::failed_precondition(
            format!("proposal {id} is {actual}, expected {expected}"),
        ),
        ApprovalError::Store(_) | ApprovalError::Corrupt(_) => Status::internal("storage error"),
    }
}
