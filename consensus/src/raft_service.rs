//! Inbound side of the gRPC transport: frames posted by peers are handed to
//! the local node's mailbox.

use bytes::Bytes;
use tokio::sync::mpsc::Sender;
use tonic::{Request, Response, Status, Streaming};

use crate::pb::raft_service_server::RaftService;
use crate::pb::{PostDataRequest, PostDataResponse, ResultCode};

#[derive(Debug, Clone)]
pub struct RaftServiceSVC {
    mailbox: Sender<Bytes>,
}

impl RaftServiceSVC {
    pub fn new(mailbox: Sender<Bytes>) -> Self {
        RaftServiceSVC { mailbox }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn post_data(
        &self,
        request: Request<Streaming<PostDataRequest>>,
    ) -> Result<Response<PostDataResponse>, Status> {
        let mut stream = request.into_inner();
        let mut response = PostDataResponse::default();
        while let Some(request) = stream.message().await? {
            for data in request.data {
                match self.mailbox.send(Bytes::from(data)).await {
                    Ok(()) => response.push_ret(ResultCode::Ok),
                    Err(_) => {
                        log::warn!("mailbox closed, dropping frame from {}", request.from);
                        response.push_ret(ResultCode::Fail);
                    }
                }
            }
        }
        Ok(Response::new(response))
    }
}
