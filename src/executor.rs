//! Remote operation executor
//!
//! Every call runs an explicit state loop per attempt:
//!
//! ```text
//! Connecting(disabled) -> Probing -> Executing -> done
//!        |                   |
//!        +---- stale TLS ----+--> Connecting(enabled) -> Probing -> Executing
//! ```
//!
//! Failed attempts are classified and retried with backoff until the
//! operation's deadline, see [`classify`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::node::{
    GrpcConnector, NodeClient, NodeConnector, NodeError, NodeTarget, TlsVerification,
};
use crate::retry::{retry_until, RetryClass, RetryConfig, RetryError};
use crate::secrets::ClientIdentity;
use crate::{Error, Result, DEFAULT_OPERATION_TIMEOUT};

/// A call made against an established node connection
#[async_trait]
pub trait NodeOperation: Send + Sync {
    /// Value the operation produces
    type Output: Send;

    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Run the call
    async fn run(&self, client: &dyn NodeClient) -> std::result::Result<Self::Output, NodeError>;
}

/// Per-call options
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    /// Overall deadline for the call, retries included
    /// (defaults to [`DEFAULT_OPERATION_TIMEOUT`])
    pub timeout: Option<Duration>,
    /// Aborts the call, including in-flight waits
    pub cancel: CancellationToken,
}

impl ExecuteOptions {
    /// Options with an explicit timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    /// Use `cancel` to abort the call
    pub fn cancelled_by(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT)
    }
}

/// Classify a failed attempt
///
/// Only a configuration the node refuses to decode and an inventory without
/// a matching disk end the call early. Node statuses such as `NotFound` or
/// `FailedPrecondition` mean "not yet" and are retried like network errors.
pub fn classify(err: &NodeError) -> RetryClass {
    match err {
        NodeError::Rpc {
            code: tonic::Code::InvalidArgument,
            ..
        } => RetryClass::NonRetryable,
        NodeError::NotFound(_) => RetryClass::NonRetryable,
        NodeError::Identity(_) => RetryClass::Fatal,
        _ => RetryClass::Retryable,
    }
}

/// Step of a single attempt
enum CallState {
    Connecting(TlsVerification),
    Probing(Box<dyn NodeClient>, TlsVerification),
    Executing(Box<dyn NodeClient>),
}

/// Runs [`NodeOperation`]s with connection fallback, retries and a deadline
#[derive(Clone)]
pub struct Executor {
    connector: Arc<dyn NodeConnector>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor using `connector` with the default retry policy
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            connector,
            retry: RetryConfig::until_deadline(),
        }
    }

    /// Executor talking gRPC to real nodes
    pub fn grpc() -> Self {
        Self::new(Arc::new(GrpcConnector::new()))
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run `operation` against `target` until it succeeds, fails terminally,
    /// the deadline passes or `options.cancel` fires
    pub async fn execute<O: NodeOperation>(
        &self,
        target: &NodeTarget,
        identity: &ClientIdentity,
        operation: &O,
        options: &ExecuteOptions,
    ) -> Result<O::Output> {
        let name = operation.name();
        let timeout = options.timeout();

        info!(
            operation = %name,
            endpoint = %target.endpoint,
            node = ?target.node,
            timeout_secs = timeout.as_secs(),
            "Executing node operation"
        );

        let result = retry_until(
            &self.retry,
            name,
            Instant::now() + timeout,
            &options.cancel,
            classify,
            |attempt| self.attempt(target, identity, operation, attempt),
        )
        .await;

        match result {
            Ok(output) => {
                info!(operation = %name, endpoint = %target.endpoint, "Node operation succeeded");
                Ok(output)
            }
            Err(RetryError::Failed(e) | RetryError::Fatal(e)) => Err(Error::from_node(name, e)),
            Err(RetryError::Exhausted { last, .. }) => Err(Error::from_node(name, last)),
            Err(RetryError::DeadlineExceeded { last }) => Err(Error::DeadlineExceeded {
                operation: name.to_string(),
                timeout,
                last_error: last.map_or_else(
                    || "no attempt completed before the deadline".to_string(),
                    |e| e.to_string(),
                ),
            }),
            Err(RetryError::Cancelled { .. }) => Err(Error::Cancelled {
                operation: name.to_string(),
            }),
        }
    }

    /// One connect/probe/execute pass
    ///
    /// The client is closed on every exit. An attempt dropped by the deadline
    /// or cancellation drops its client, which closes the connection.
    async fn attempt<O: NodeOperation>(
        &self,
        target: &NodeTarget,
        identity: &ClientIdentity,
        operation: &O,
        attempt: u32,
    ) -> std::result::Result<O::Output, NodeError> {
        let mut state = CallState::Connecting(TlsVerification::Disabled);

        loop {
            state = match state {
                CallState::Connecting(verification) => {
                    debug!(
                        operation = %operation.name(),
                        endpoint = %target,
                        attempt = attempt,
                        verification = ?verification,
                        "Connecting"
                    );
                    match self.connector.connect(target, identity, verification).await {
                        Ok(client) => CallState::Probing(client, verification),
                        Err(e) if should_reconnect(verification, &e) => {
                            debug!(error = %e, "Handshake rejected, reconnecting with verification");
                            CallState::Connecting(TlsVerification::Enabled)
                        }
                        Err(e) => return Err(e),
                    }
                }
                CallState::Probing(client, verification) => match client.disks().await {
                    Ok(_) => CallState::Executing(client),
                    Err(e) => {
                        client.close().await;
                        if should_reconnect(verification, &e) {
                            debug!(
                                error = %e,
                                "Probe hit a stale handshake, reconnecting with verification"
                            );
                            CallState::Connecting(TlsVerification::Enabled)
                        } else {
                            return Err(e);
                        }
                    }
                },
                CallState::Executing(client) => {
                    debug!(operation = %operation.name(), attempt = attempt, "Executing");
                    let result = operation.run(client.as_ref()).await;
                    client.close().await;
                    return result;
                }
            };
        }
    }
}

fn should_reconnect(verification: TlsVerification, err: &NodeError) -> bool {
    verification == TlsVerification::Disabled && err.is_stale_tls()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::disk::DiskRecord;
    use crate::node::{ApplyMode, ApplyOutcome};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const BAD_CERTIFICATE: &str = "connection error: desc = \"transport: authentication \
                                   handshake failed: remote error: tls: bad certificate\"";

    /// Scripted node shared by every connection a [`FakeConnector`] opens
    #[derive(Default)]
    pub(crate) struct FakeNode {
        /// Probes over unverified connections fail with a certificate alert
        pub requires_verification: bool,
        /// Number of connect calls that fail with a plain network error
        pub refused_connects: AtomicU32,
        /// Results returned by successive operation calls; `Ok` once drained
        pub script: Mutex<VecDeque<NodeError>>,
        /// Every call fails as downstream-unavailable
        pub never_ready: bool,
        /// Disk inventory
        pub disks: Vec<DiskRecord>,
        /// Kubeconfig archive
        pub kubeconfig: Vec<u8>,
        /// Configurations pushed, with their mode and dry-run flag
        pub applied: Mutex<Vec<(Vec<u8>, ApplyMode, bool)>>,
        /// TLS mode of every connect call
        pub connects: Mutex<Vec<TlsVerification>>,
        /// Number of closed clients
        pub closes: AtomicU32,
    }

    impl FakeNode {
        pub(crate) fn scripted(errors: impl IntoIterator<Item = NodeError>) -> Self {
            Self {
                script: Mutex::new(errors.into_iter().collect()),
                ..Default::default()
            }
        }

        pub(crate) fn connects(&self) -> Vec<TlsVerification> {
            self.connects.lock().unwrap().clone()
        }

        pub(crate) fn closes(&self) -> u32 {
            self.closes.load(Ordering::SeqCst)
        }

        fn next_result(&self) -> std::result::Result<(), NodeError> {
            if self.never_ready {
                return Err(NodeError::DownstreamUnavailable(
                    "kubernetes API is not ready".to_string(),
                ));
            }
            match self.script.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    pub(crate) struct FakeConnector(pub Arc<FakeNode>);

    #[async_trait]
    impl NodeConnector for FakeConnector {
        async fn connect(
            &self,
            _target: &NodeTarget,
            _identity: &ClientIdentity,
            verification: TlsVerification,
        ) -> std::result::Result<Box<dyn NodeClient>, NodeError> {
            self.0.connects.lock().unwrap().push(verification);

            let refused = self
                .0
                .refused_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(NodeError::transport("tcp connect error: connection refused"));
            }

            Ok(Box::new(FakeClient {
                node: self.0.clone(),
                verification,
            }))
        }
    }

    struct FakeClient {
        node: Arc<FakeNode>,
        verification: TlsVerification,
    }

    #[async_trait]
    impl NodeClient for FakeClient {
        async fn disks(&self) -> std::result::Result<Vec<DiskRecord>, NodeError> {
            if self.node.requires_verification && self.verification == TlsVerification::Disabled {
                // Message only, so detection has to fall back to the text.
                return Err(NodeError::transport(BAD_CERTIFICATE));
            }
            Ok(self.node.disks.clone())
        }

        async fn bootstrap(&self) -> std::result::Result<(), NodeError> {
            self.node.next_result()
        }

        async fn kubeconfig(&self) -> std::result::Result<Vec<u8>, NodeError> {
            self.node.next_result()?;
            Ok(self.node.kubeconfig.clone())
        }

        async fn apply_configuration(
            &self,
            data: &[u8],
            mode: ApplyMode,
            dry_run: bool,
        ) -> std::result::Result<ApplyOutcome, NodeError> {
            self.node.next_result()?;
            self.node
                .applied
                .lock()
                .unwrap()
                .push((data.to_vec(), mode, dry_run));
            Ok(ApplyOutcome {
                mode,
                mode_details: "Applied configuration without a reboot".to_string(),
                warnings: Vec::new(),
            })
        }

        async fn close(self: Box<Self>) {
            self.node.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn identity() -> ClientIdentity {
        ClientIdentity {
            ca_certificate: String::new(),
            client_certificate: String::new(),
            client_key: String::new(),
        }
    }

    pub(crate) fn fast_executor(node: &Arc<FakeNode>) -> Executor {
        Executor::new(Arc::new(FakeConnector(node.clone()))).with_retry(RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
    }

    struct Bootstrap;

    #[async_trait]
    impl NodeOperation for Bootstrap {
        type Output = ();

        fn name(&self) -> &str {
            "bootstrap"
        }

        async fn run(&self, client: &dyn NodeClient) -> std::result::Result<(), NodeError> {
            client.bootstrap().await
        }
    }

    fn target() -> NodeTarget {
        NodeTarget::new("10.5.0.2")
    }

    #[tokio::test]
    async fn stale_handshake_reconnects_once_with_verification() {
        let node = Arc::new(FakeNode {
            requires_verification: true,
            ..Default::default()
        });

        fast_executor(&node)
            .execute(
                &target(),
                &identity(),
                &Bootstrap,
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            node.connects(),
            vec![TlsVerification::Disabled, TlsVerification::Enabled]
        );
        assert_eq!(node.closes(), 2);
    }

    #[tokio::test]
    async fn invalid_argument_aborts_without_reconnecting() {
        let node = Arc::new(FakeNode::scripted([NodeError::Rpc {
            code: tonic::Code::InvalidArgument,
            message: "unknown keys found during decoding".to_string(),
        }]));

        let err = fast_executor(&node)
            .execute(
                &target(),
                &identity(),
                &Bootstrap,
                &ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NodeRejected { .. }), "{err}");
        assert_eq!(node.connects(), vec![TlsVerification::Disabled]);
        assert_eq!(node.closes(), 1);
    }

    #[tokio::test]
    async fn ordinary_network_failures_retry_without_fallback() {
        let node = Arc::new(FakeNode {
            refused_connects: AtomicU32::new(2),
            ..Default::default()
        });

        fast_executor(&node)
            .execute(
                &target(),
                &identity(),
                &Bootstrap,
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(node.connects(), vec![TlsVerification::Disabled; 3]);
        assert_eq!(node.closes(), 1);
    }

    #[tokio::test]
    async fn downstream_unavailable_retries_until_ready() {
        let node = Arc::new(FakeNode::scripted(
            (0..3).map(|_| NodeError::DownstreamUnavailable("etcd is not ready".to_string())),
        ));

        fast_executor(&node)
            .execute(
                &target(),
                &identity(),
                &Bootstrap,
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(node.connects().len(), 4);
        assert_eq!(node.closes(), 4);
    }

    #[tokio::test]
    async fn node_not_ready_statuses_are_retried() {
        use crate::node::status_error;

        for status in [
            tonic::Status::failed_precondition("bootstrap is not available yet"),
            tonic::Status::not_found("kubeconfig not generated yet"),
        ] {
            let node = Arc::new(FakeNode::scripted([status_error(status)]));

            fast_executor(&node)
                .execute(
                    &target(),
                    &identity(),
                    &Bootstrap,
                    &ExecuteOptions::default(),
                )
                .await
                .unwrap();

            assert_eq!(node.connects().len(), 2);
            assert_eq!(node.closes(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_wraps_last_downstream_error() {
        let node = Arc::new(FakeNode {
            never_ready: true,
            ..Default::default()
        });

        let err = fast_executor(&node)
            .execute(
                &target(),
                &identity(),
                &Bootstrap,
                &ExecuteOptions::with_timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();

        match err {
            Error::DeadlineExceeded {
                operation,
                timeout,
                last_error,
            } => {
                assert_eq!(operation, "bootstrap");
                assert_eq!(timeout, Duration::from_secs(2));
                assert!(last_error.contains("kubernetes API is not ready"), "{last_error}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(node.connects().len() > 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_connection() {
        let node = Arc::new(FakeNode::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fast_executor(&node)
            .execute(
                &target(),
                &identity(),
                &Bootstrap,
                &ExecuteOptions::default().cancelled_by(cancel),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled { .. }), "{err}");
        assert!(node.connects().is_empty());
    }

    #[test]
    fn classification() {
        let rpc = |code| NodeError::Rpc {
            code,
            message: String::new(),
        };

        assert_eq!(
            classify(&rpc(tonic::Code::InvalidArgument)),
            RetryClass::NonRetryable
        );
        assert_eq!(
            classify(&NodeError::NotFound(String::new())),
            RetryClass::NonRetryable
        );
        assert_eq!(
            classify(&NodeError::Identity(String::new())),
            RetryClass::Fatal
        );
        for retryable in [
            rpc(tonic::Code::NotFound),
            rpc(tonic::Code::FailedPrecondition),
            rpc(tonic::Code::Internal),
            NodeError::DownstreamUnavailable(String::new()),
            NodeError::transport("connection reset"),
        ] {
            assert_eq!(classify(&retryable), RetryClass::Retryable, "{retryable}");
        }
    }
}
