//! Client service implementation
//!
//! Exposes the key-value state machine and cluster administration over
//! gRPC. Writes go through Raft and answer once applied.

use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::metrics::record_metrics;
use crate::pb::client_service_server::ClientService;
use crate::pb::{
    ChangeKind, ChangeServerRequest, ChangeServerResponse, DeleteRequest, ErrorCode, PutRequest,
    Server, StatusRequest, StatusResponse, TransferLeadershipRequest,
    TransferLeadershipResponse, WriteResponse,
};
use crate::raft::node::RaftHandle;
use crate::state_kv::KvCommand;

#[derive(Clone)]
pub struct ClientServiceSVC {
    handle: RaftHandle,
}

impl ClientServiceSVC {
    pub fn new(handle: RaftHandle) -> Self {
        ClientServiceSVC { handle }
    }

    async fn write(&self, command: KvCommand) -> Result<Response<WriteResponse>, Status> {
        let payload = command
            .to_payload()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let response = match self.handle.propose(payload).await {
            Ok(previous) => WriteResponse {
                previous,
                ..WriteResponse::default()
            },
            Err(e) => {
                let mut response = WriteResponse {
                    message: e.to_string(),
                    ..WriteResponse::default()
                };
                response.set_code(error_code(&e));
                if let RaftError::NotLeader {
                    leader: Some(leader),
                } = e
                {
                    response.leader_id = leader;
                }
                response
            }
        };
        Ok(Response::new(response))
    }
}

/// Wire code of a client-visible failure.
pub fn error_code(err: &RaftError) -> ErrorCode {
    match err {
        RaftError::NotLeader { .. } => ErrorCode::NotLeader,
        RaftError::EntryDropped { .. } => ErrorCode::EntryDropped,
        RaftError::LeadershipTransferInProgress => ErrorCode::TransferInProgress,
        RaftError::LeadershipTransferFailed { .. } => ErrorCode::TransferFailed,
        RaftError::Halted { .. } => ErrorCode::Halted,
        RaftError::InvalidPayload { .. } => ErrorCode::InvalidPayload,
        RaftError::Stopped => ErrorCode::Stopped,
        RaftError::Config { .. } => ErrorCode::Internal,
    }
}

fn stopped(e: RaftError) -> Status {
    Status::unavailable(e.to_string())
}

#[tonic::async_trait]
impl ClientService for ClientServiceSVC {
    async fn put(&self, request: Request<PutRequest>) -> Result<Response<WriteResponse>, Status> {
        record_metrics("put", || async {
            let PutRequest { key, value } = request.into_inner();
            log::debug!("put {}", key);
            self.write(KvCommand::Put { key, value }).await
        })
        .await
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<WriteResponse>, Status> {
        record_metrics("delete", || async {
            let key = request.into_inner().key;
            log::debug!("delete {}", key);
            self.write(KvCommand::Delete { key }).await
        })
        .await
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        record_metrics("status", || async {
            let status = self.handle.status().await.map_err(stopped)?;
            Ok(Response::new(StatusResponse {
                id: status.id(),
                role: status.role().to_string(),
                term: status.term(),
                leader_id: status.leader_id().unwrap_or(0),
                commit_index: status.commit_index(),
                last_applied: status.last_applied(),
                last_index: status.last_index(),
                snapshot_index: status.snapshot_index(),
                servers: status
                    .cluster()
                    .servers()
                    .map(|s| Server {
                        id: s.id,
                        voting: s.voting,
                    })
                    .collect(),
                halted: status.halted().clone().unwrap_or_default(),
            }))
        })
        .await
    }

    async fn change_server(
        &self,
        request: Request<ChangeServerRequest>,
    ) -> Result<Response<ChangeServerResponse>, Status> {
        record_metrics("change_server", || async {
            let request = request.into_inner();
            log::info!("server change {:?}", request);
            let status = match request.kind() {
                ChangeKind::Add => self.handle.add_server(request.id, request.voting).await,
                ChangeKind::Remove => self.handle.remove_server(request.id).await,
                ChangeKind::ChangeVoting => {
                    self.handle.change_voting(request.id, request.voting).await
                }
            }
            .map_err(stopped)?;
            Ok(Response::new(ChangeServerResponse {
                status: status.to_string(),
            }))
        })
        .await
    }

    async fn transfer_leadership(
        &self,
        request: Request<TransferLeadershipRequest>,
    ) -> Result<Response<TransferLeadershipResponse>, Status> {
        record_metrics("transfer_leadership", || async {
            let target = Some(request.into_inner().target).filter(|t| *t != 0);
            let mut response = TransferLeadershipResponse::default();
            if let Err(e) = self.handle.transfer_leadership(target).await {
                response.set_code(error_code(&e));
                response.message = e.to_string();
            }
            Ok(Response::new(response))
        })
        .await
    }
}
