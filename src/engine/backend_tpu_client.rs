use {
    super::{
        cluster_source::ClusterInfoSource,
        leader_tpu_service::LeaderTpuService,
        recent_leaders_slot::TpuClientConfig,
        slot_watcher::SlotEvent,
    },
    bincode::serialize,
    log::*,
    solana_measure::measure::Measure,
    solana_pubsub_client::nonblocking::pubsub_client::PubsubClientError,
    solana_rpc_client_api::client_error::Error as ClientError,
    solana_sdk::{signature::Signature, transaction::Transaction},
    std::{
        future::Future,
        io,
        net::{Ipv4Addr, Ipv6Addr, SocketAddr},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    thiserror::Error,
    tokio::{net::UdpSocket, sync::mpsc},
};

/// Extra dial attempts made for a destination after the first one fails.
pub const MAX_CONNECTION_RETRIES: usize = 3;

#[derive(Error, Debug)]
pub enum TpuSenderError {
    #[error("Pubsub error: {0:?}")]
    PubsubError(#[from] PubsubClientError),
    #[error("RPC error: {0:?}")]
    RpcError(#[from] ClientError),
    #[error("IO error: {0:?}")]
    IoError(#[from] io::Error),
    #[error("Encoding error: {0}")]
    EncodingError(#[from] bincode::Error),
    #[error("Transaction has no signature")]
    NoSignature,
    #[error("Failed to send transaction to any leader: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, TpuSenderError>;

/// Client which sends transactions directly to the current leader's TPU port over UDP.
/// The client uses RPC to determine the current leader and fetch node contact info
pub struct BackendTpuClient {
    fanout_slots: u64,
    leader_tpu_service: LeaderTpuService,
    exit: Arc<AtomicBool>,
}

impl BackendTpuClient {
    /// Create a new client that disconnects when dropped
    pub async fn new(
        source: Arc<dyn ClusterInfoSource>,
        websocket_url: &str,
        config: TpuClientConfig,
    ) -> Result<Self> {
        let exit = Arc::new(AtomicBool::new(false));
        let leader_tpu_service =
            LeaderTpuService::new(source, websocket_url, &config, exit.clone()).await?;
        Ok(Self::from_service(leader_tpu_service, &config, exit))
    }

    /// Create a new client whose slot tracking is driven by `slot_events`
    pub async fn new_with_slot_events(
        source: Arc<dyn ClusterInfoSource>,
        slot_events: Option<mpsc::Receiver<SlotEvent>>,
        config: TpuClientConfig,
    ) -> Result<Self> {
        let exit = Arc::new(AtomicBool::new(false));
        let leader_tpu_service =
            LeaderTpuService::with_slot_events(source, slot_events, &config, exit.clone()).await?;
        Ok(Self::from_service(leader_tpu_service, &config, exit))
    }

    fn from_service(
        leader_tpu_service: LeaderTpuService,
        config: &TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            fanout_slots: config.clamped_fanout_slots(),
            leader_tpu_service,
            exit,
        }
    }

    /// Serialize and send transaction to the upcoming leader TPUs according to fanout size.
    /// Returns the first signature of the transaction once at least one datagram went out.
    pub async fn send_transaction(
        &self,
        transaction: &Transaction,
        repeat_count: usize,
    ) -> Result<Signature> {
        let signature = first_signature(transaction)?;
        let wire_transaction = serialize(transaction)?;
        self.send_wire_transaction(&wire_transaction, repeat_count)
            .await?;
        Ok(signature)
    }

    /// Send a wire transaction `repeat_count` times to each of the upcoming leader TPUs.
    /// Returns the last error if all sends fail
    pub async fn send_wire_transaction(
        &self,
        wire_transaction: &[u8],
        repeat_count: usize,
    ) -> Result<()> {
        let leaders = self.leader_tpu_service.leader_tpu_sockets(self.fanout_slots);
        send_wire_transaction_to_addrs(&leaders.addresses, wire_transaction, repeat_count).await
    }

    /// Like [`BackendTpuClient::send_transaction`], writing every datagram through
    /// the caller's `socket`.
    pub async fn send_transaction_through_socket(
        &self,
        transaction: &Transaction,
        repeat_count: usize,
        socket: &UdpSocket,
    ) -> Result<Signature> {
        let signature = first_signature(transaction)?;
        let wire_transaction = serialize(transaction)?;
        self.send_wire_transaction_through_socket(&wire_transaction, repeat_count, socket)
            .await;
        Ok(signature)
    }

    /// Writes the wire transaction through an already bound `socket`. Every
    /// write is attempted, failures are only logged.
    pub async fn send_wire_transaction_through_socket(
        &self,
        wire_transaction: &[u8],
        repeat_count: usize,
        socket: &UdpSocket,
    ) {
        let leaders = self.leader_tpu_service.leader_tpu_sockets(self.fanout_slots);
        for tpu_address in &leaders.sockets {
            for _ in 0..repeat_count {
                if let Err(err) = socket.send_to(wire_transaction, tpu_address).await {
                    warn!("Failed to send transaction to {}: {:?}", tpu_address, err);
                }
            }
        }
    }

    pub fn leader_tpu_service(&self) -> &LeaderTpuService {
        &self.leader_tpu_service
    }

    pub fn fanout_slots(&self) -> u64 {
        self.fanout_slots
    }

    pub async fn shutdown(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        self.leader_tpu_service.join().await;
    }
}

impl Drop for BackendTpuClient {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
    }
}

fn first_signature(transaction: &Transaction) -> Result<Signature> {
    transaction
        .signatures
        .first()
        .copied()
        .ok_or(TpuSenderError::NoSignature)
}

/// Opens a connected datagram socket towards `tpu_address`.
async fn connect_to_addr(tpu_address: String) -> io::Result<UdpSocket> {
    let addr = tokio::net::lookup_host(tpu_address.as_str())
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{tpu_address} did not resolve to any address"),
            )
        })?;
    let bind_addr: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

async fn connect_with_retries<F, Fut>(tpu_address: &str, connect: &F) -> io::Result<UdpSocket>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = io::Result<UdpSocket>>,
{
    let mut retries = 0;
    loop {
        match connect(tpu_address.to_string()).await {
            Ok(socket) => return Ok(socket),
            Err(err) if retries < MAX_CONNECTION_RETRIES => {
                trace!("Connecting to {} failed, retrying: {}", tpu_address, err);
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sends `wire_transaction` `repeat_count` times to every address.
///
/// A destination that cannot be connected to after [`MAX_CONNECTION_RETRIES`]
/// retries is skipped. Succeeds when at least one datagram was written
/// anywhere, otherwise fails with the last error seen.
pub async fn send_wire_transaction_to_addrs(
    tpu_addresses: &[String],
    wire_transaction: &[u8],
    repeat_count: usize,
) -> Result<()> {
    send_wire_transaction_with(tpu_addresses, wire_transaction, repeat_count, connect_to_addr).await
}

async fn send_wire_transaction_with<F, Fut>(
    tpu_addresses: &[String],
    wire_transaction: &[u8],
    repeat_count: usize,
    connect: F,
) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = io::Result<UdpSocket>>,
{
    let mut measure = Measure::start("send_wire_transaction_to_addrs");
    let mut successes = 0usize;
    let mut last_error: Option<String> = None;

    for tpu_address in tpu_addresses {
        let socket = match connect_with_retries(tpu_address, &connect).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("Skipping leader TPU {}: {}", tpu_address, err);
                last_error = Some(err.to_string());
                continue;
            }
        };
        for _ in 0..repeat_count {
            match socket.send(wire_transaction).await {
                Ok(_) => successes += 1,
                Err(err) => last_error = Some(err.to_string()),
            }
        }
    }

    measure.stop();
    debug!(
        "Fanned out {} datagrams to {} leaders in {}us",
        successes,
        tpu_addresses.len(),
        measure.as_us()
    );

    if successes == 0 {
        return Err(TpuSenderError::SendFailed(last_error.unwrap_or_else(|| {
            "no leader TPU addresses available".to_string()
        })));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::{
            cluster_source::tests::{node, MockClusterInfoSource},
            leader_tpu_service::tests::fast_config,
        },
        solana_sdk::{
            hash::Hash, signature::Keypair, signer::Signer, system_transaction,
        },
        std::sync::atomic::AtomicUsize,
        tokio::time::{timeout, Duration},
    };

    async fn local_receiver() -> (UdpSocket, String) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = receiver.local_addr().unwrap().to_string();
        (receiver, address)
    }

    async fn recv_datagram(receiver: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let len = timeout(Duration::from_secs(5), receiver.recv(&mut buf))
            .await
            .expect("datagram should arrive")
            .unwrap();
        buf.truncate(len);
        buf
    }

    fn signed_transaction() -> Transaction {
        let payer = Keypair::new();
        system_transaction::transfer(&payer, &payer.pubkey(), 42, Hash::new_unique())
    }

    #[tokio::test]
    async fn test_one_reachable_destination_is_enough() {
        let (receiver, address) = local_receiver().await;
        let addresses = vec!["not-an-address".to_string(), address];

        send_wire_transaction_to_addrs(&addresses, b"payload", 2)
            .await
            .unwrap();

        assert_eq!(recv_datagram(&receiver).await, b"payload");
        assert_eq!(recv_datagram(&receiver).await, b"payload");
    }

    async fn failure_reason(addresses: &[&str]) -> String {
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        match send_wire_transaction_to_addrs(&addresses, b"payload", 1).await {
            Err(TpuSenderError::SendFailed(reason)) => reason,
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_destinations_failing_reports_last_error() {
        let reason = failure_reason(&["127.0.0.1:notaport", "not-an-address"]).await;
        assert_eq!(reason, "invalid socket address");

        let reason = failure_reason(&["not-an-address", "127.0.0.1:notaport"]).await;
        assert_ne!(reason, "invalid socket address");
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_dialed_a_bounded_number_of_times() {
        let attempts = AtomicUsize::new(0);
        let result = send_wire_transaction_with(
            &["10.0.0.1:8003".to_string()],
            b"payload",
            1,
            |_tpu_address| {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                async move {
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("dial {attempt} refused"),
                    ))
                }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::Relaxed), 1 + MAX_CONNECTION_RETRIES);
        match result {
            Err(TpuSenderError::SendFailed(reason)) => {
                assert_eq!(reason, format!("dial {MAX_CONNECTION_RETRIES} refused"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dial_retries_recover_a_destination() {
        let (receiver, address) = local_receiver().await;
        let attempts = AtomicUsize::new(0);
        send_wire_transaction_with(&[address], b"payload", 1, |tpu_address| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < MAX_CONNECTION_RETRIES {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                } else {
                    connect_to_addr(tpu_address).await
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::Relaxed), 1 + MAX_CONNECTION_RETRIES);
        assert_eq!(recv_datagram(&receiver).await, b"payload");
    }

    #[tokio::test]
    async fn test_no_destinations_is_a_failure() {
        assert!(matches!(
            send_wire_transaction_to_addrs(&[], b"payload", 1).await,
            Err(TpuSenderError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_transaction_delivers_encoded_bytes() {
        let (receiver, address) = local_receiver().await;
        let source = Arc::new(MockClusterInfoSource::new(
            100,
            432_000,
            vec![node(Some(&address)), node(None)],
        ));
        let mut client = BackendTpuClient::new_with_slot_events(source, None, fast_config(12))
            .await
            .unwrap();

        let transaction = signed_transaction();
        let signature = client.send_transaction(&transaction, 1).await.unwrap();
        assert_eq!(signature, transaction.signatures[0]);

        let datagram = recv_datagram(&receiver).await;
        assert_eq!(datagram, serialize(&transaction).unwrap());
        let decoded: Transaction = bincode::deserialize(&datagram).unwrap();
        assert_eq!(decoded, transaction);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsigned_transaction_is_rejected() {
        let source = Arc::new(MockClusterInfoSource::new(
            100,
            432_000,
            vec![node(Some("127.0.0.1:9"))],
        ));
        let mut client = BackendTpuClient::new_with_slot_events(source, None, fast_config(12))
            .await
            .unwrap();

        assert!(matches!(
            client.send_transaction(&Transaction::default(), 1).await,
            Err(TpuSenderError::NoSignature)
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_through_caller_socket() {
        let (receiver, address) = local_receiver().await;
        let source = Arc::new(MockClusterInfoSource::new(
            100,
            432_000,
            vec![node(Some(&address)), node(Some("validator.example:8003"))],
        ));
        let mut client = BackendTpuClient::new_with_slot_events(source, None, fast_config(12))
            .await
            .unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let transaction = signed_transaction();
        let signature = client
            .send_transaction_through_socket(&transaction, 3, &socket)
            .await
            .unwrap();
        assert_eq!(signature, transaction.signatures[0]);

        let wire_transaction = serialize(&transaction).unwrap();
        for _ in 0..3 {
            assert_eq!(recv_datagram(&receiver).await, wire_transaction);
        }
        client.shutdown().await;
    }
}
