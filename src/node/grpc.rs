//! gRPC node client

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use super::proto::{self, paths};
use super::tls::{self, error_chain, is_stale_tls_error};
use super::{
    ApplyMode, ApplyOutcome, NodeClient, NodeConnector, NodeError, NodeTarget, TlsVerification,
};
use crate::disk::DiskRecord;
use crate::secrets::ClientIdentity;

/// Default TCP + TLS connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to the node API over gRPC
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    connect_timeout: Duration,
}

impl GrpcConnector {
    /// Connector with the default connect timeout
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeConnector for GrpcConnector {
    async fn connect(
        &self,
        target: &NodeTarget,
        identity: &ClientIdentity,
        verification: TlsVerification,
    ) -> Result<Box<dyn NodeClient>, NodeError> {
        let (host, port) = target
            .host_port()
            .map_err(|e| NodeError::transport(e.to_string()))?;

        let config = tls::client_config(identity, verification)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| NodeError::transport(format!("invalid node address {host:?}: {e}")))?;

        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        debug!(endpoint = %authority, verification = ?verification, "Connecting to node");

        let address = authority.clone();
        let channel = Endpoint::from_shared(format!("http://{authority}"))
            .map_err(|e| NodeError::transport(format!("invalid endpoint {authority}: {e}")))?
            .connect_timeout(self.connect_timeout)
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let connector = connector.clone();
                let server_name = server_name.clone();
                let address = address.clone();
                async move {
                    let tcp = TcpStream::connect(address).await?;
                    let stream = connector.connect(server_name, tcp).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| transport_error(&e))?;

        let node = target
            .node
            .as_deref()
            .map(|node| {
                MetadataValue::try_from(node)
                    .map_err(|e| NodeError::transport(format!("invalid node name {node:?}: {e}")))
            })
            .transpose()?;

        Ok(Box::new(GrpcNodeClient { channel, node }))
    }
}

/// Open connection to one node
struct GrpcNodeClient {
    channel: Channel,
    node: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl GrpcNodeClient {
    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(node) = &self.node {
            request
                .metadata_mut()
                .insert(proto::NODE_METADATA_KEY, node.clone());
        }
        request
    }

    async fn grpc(&self) -> Result<tonic::client::Grpc<Channel>, NodeError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| transport_error(&e))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp, NodeError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc().await?;
        let response = grpc
            .unary(
                self.request(message),
                PathAndQuery::from_static(path),
                ProstCodec::default(),
            )
            .await
            .map_err(status_error)?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl NodeClient for GrpcNodeClient {
    async fn disks(&self) -> Result<Vec<DiskRecord>, NodeError> {
        let response: proto::DisksResponse = self.unary(paths::DISKS, proto::Empty {}).await?;

        let mut disks = Vec::new();
        for message in response.messages {
            check_metadata(message.metadata.as_ref())?;
            disks.extend(message.disks.into_iter().map(DiskRecord::from));
        }
        Ok(disks)
    }

    async fn bootstrap(&self) -> Result<(), NodeError> {
        let response: proto::BootstrapResponse = self
            .unary(paths::BOOTSTRAP, proto::BootstrapRequest::default())
            .await?;
        for message in &response.messages {
            check_metadata(message.metadata.as_ref())?;
        }
        Ok(())
    }

    async fn kubeconfig(&self) -> Result<Vec<u8>, NodeError> {
        let mut grpc = self.grpc().await?;
        let response = grpc
            .server_streaming(
                self.request(proto::Empty {}),
                PathAndQuery::from_static(paths::KUBECONFIG),
                ProstCodec::<proto::Empty, proto::Data>::default(),
            )
            .await
            .map_err(status_error)?;

        let mut stream = response.into_inner();
        let mut archive = Vec::new();
        while let Some(chunk) = stream.message().await.map_err(status_error)? {
            check_metadata(chunk.metadata.as_ref())?;
            archive.extend_from_slice(&chunk.bytes);
        }
        Ok(archive)
    }

    async fn apply_configuration(
        &self,
        data: &[u8],
        mode: ApplyMode,
        dry_run: bool,
    ) -> Result<ApplyOutcome, NodeError> {
        let request = proto::ApplyConfigurationRequest {
            data: data.to_vec(),
            mode: proto::ApplyConfigurationMode::from(mode) as i32,
            dry_run,
        };
        let response: proto::ApplyConfigurationResponse =
            self.unary(paths::APPLY_CONFIGURATION, request).await?;

        let mut outcome = ApplyOutcome {
            mode,
            ..Default::default()
        };
        for message in response.messages {
            check_metadata(message.metadata.as_ref())?;
            if let Ok(applied) = proto::ApplyConfigurationMode::try_from(message.mode) {
                outcome.mode = applied.into();
            }
            outcome.mode_details = message.mode_details;
            outcome.warnings.extend(message.warnings);
        }
        Ok(outcome)
    }

    async fn close(self: Box<Self>) {
        // Dropping the last channel handle tears down the connection.
        drop(self);
    }
}

/// Per-node errors are reported inside otherwise successful responses
fn check_metadata(metadata: Option<&proto::Metadata>) -> Result<(), NodeError> {
    match metadata {
        Some(metadata) if !metadata.error.is_empty() => Err(NodeError::Rpc {
            code: tonic::Code::Unknown,
            message: if metadata.hostname.is_empty() {
                metadata.error.clone()
            } else {
                format!("{}: {}", metadata.hostname, metadata.error)
            },
        }),
        _ => Ok(()),
    }
}

fn transport_error(err: &(dyn std::error::Error + 'static)) -> NodeError {
    let message = error_chain(err);
    if is_stale_tls_error(err) {
        NodeError::stale_tls(message)
    } else {
        NodeError::transport(message)
    }
}

/// Map a gRPC status into the node error taxonomy
pub(crate) fn status_error(status: tonic::Status) -> NodeError {
    if is_stale_tls_error(&status) {
        return NodeError::stale_tls(error_chain(&status));
    }

    let message = status.message().to_string();
    match status.code() {
        tonic::Code::Unavailable | tonic::Code::Cancelled | tonic::Code::Unknown
            if message.is_empty() || status.source().is_some() =>
        {
            NodeError::transport(error_chain(&status))
        }
        code => NodeError::Rpc { code, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_node_errors() {
        let err = status_error(tonic::Status::invalid_argument("bad config"));
        match err {
            NodeError::Rpc { code, message } => {
                assert_eq!(code, tonic::Code::InvalidArgument);
                assert_eq!(message, "bad config");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Node-side "not yet" answers stay ordinary statuses.
        assert!(matches!(
            status_error(tonic::Status::not_found("kubeconfig not generated yet")),
            NodeError::Rpc {
                code: tonic::Code::NotFound,
                ..
            }
        ));
        assert!(matches!(
            status_error(tonic::Status::failed_precondition("bootstrap is not available yet")),
            NodeError::Rpc {
                code: tonic::Code::FailedPrecondition,
                ..
            }
        ));
        assert!(matches!(
            status_error(tonic::Status::unavailable("")),
            NodeError::Transport { stale_tls: false, .. }
        ));
    }

    #[test]
    fn certificate_rejection_status_is_stale_tls() {
        let status = tonic::Status::unavailable("remote error: tls: bad certificate");
        assert!(status_error(status).is_stale_tls());
    }

    #[test]
    fn metadata_errors_become_rpc_errors() {
        let metadata = proto::Metadata {
            hostname: "cp-1".to_string(),
            error: "etcd is not running".to_string(),
        };
        let err = check_metadata(Some(&metadata)).unwrap_err();
        assert!(err.to_string().contains("cp-1: etcd is not running"), "{err}");
        assert!(check_metadata(None).is_ok());
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_a_transport_error() {
        let bundle = crate::secrets::SecretsBundle::generate(&crate::secrets::SystemClock, None)
            .unwrap();
        let identity = bundle.client_identity(&crate::secrets::SystemClock).unwrap();

        // Bind then drop a listener to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = GrpcConnector::new().with_connect_timeout(Duration::from_secs(2));
        let result = connector
            .connect(
                &NodeTarget::new(format!("127.0.0.1:{port}")),
                &identity,
                TlsVerification::Disabled,
            )
            .await;

        match result {
            Err(NodeError::Transport { stale_tls, .. }) => assert!(!stale_tls),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
