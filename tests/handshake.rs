//! End-to-end scenarios driving two real `Multiplexer`s over loopback UDP:
//! the three-way handshake, a short write, and an active close with full
//! teardown (spec.md §8 scenarios 1, 2, and 5). MTU fragmentation and STB
//! are covered at the unit level in `src/packet.rs`'s `fragments_oversized_payload`
//! test; retransmit exhaustion is covered in `src/connection`'s tests.

use async_trait::async_trait;
use ptcp::{
    application::{ClientFactory, PtcpProtocol, PtcpTransport, ServerFactory},
    error::ConnectError,
    isn::ClosedIsn,
    message::Message,
    timer::TokioScheduler,
    transport::{DatagramTransport, UdpTransport},
    Config, Multiplexer, PtcpAddress,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct Recorder {
    received: Arc<Mutex<Vec<u8>>>,
    closed_tx: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl PtcpProtocol for Recorder {
    async fn make_connection(&mut self, _transport: Arc<dyn PtcpTransport>) {}

    async fn data_received(&mut self, data: Message) {
        self.received.lock().unwrap().extend(data.to_vec());
    }

    async fn connection_lost(&mut self, _reason: Option<String>) {
        if let Some(tx) = self.closed_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct EchoServerFactory {
    received: Arc<Mutex<Vec<u8>>>,
    closed_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ServerFactory for EchoServerFactory {
    fn build_protocol(&self, _peer: PtcpAddress) -> Box<dyn PtcpProtocol> {
        Box::new(Recorder {
            received: self.received.clone(),
            closed_tx: self.closed_tx.lock().unwrap().take(),
        })
    }
}

struct NoopClientFactory;

impl ClientFactory for NoopClientFactory {
    fn client_connection_failed(&mut self, _reason: ConnectError) {}
}

struct Client {
    transport: Arc<Mutex<Option<Arc<dyn PtcpTransport>>>>,
}

#[async_trait]
impl PtcpProtocol for Client {
    async fn make_connection(&mut self, transport: Arc<dyn PtcpTransport>) {
        *self.transport.lock().unwrap() = Some(transport);
    }
    async fn data_received(&mut self, _data: Message) {}
    async fn connection_lost(&mut self, _reason: Option<String>) {}
}

#[tokio::test]
async fn handshake_write_and_close() {
    let server_transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let server_addr = server_transport.local_addr().unwrap();
    let (server_scheduler, server_timer_rx) = TokioScheduler::new();
    let mut server = Multiplexer::new(
        Arc::new(server_transport),
        server_scheduler,
        server_timer_rx,
        Box::new(ClosedIsn),
        Config::default(),
    );

    let received = Arc::new(Mutex::new(Vec::new()));
    let (closed_tx, closed_rx) = oneshot::channel();
    server.listen(
        Config::default().listen_port,
        Arc::new(EchoServerFactory {
            received: received.clone(),
            closed_tx: Mutex::new(Some(closed_tx)),
        }),
    );
    tokio::spawn(async move {
        server.run().await;
    });

    let client_transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let (client_scheduler, client_timer_rx) = TokioScheduler::new();
    let mut client = Multiplexer::new(
        Arc::new(client_transport),
        client_scheduler,
        client_timer_rx,
        Box::new(ClosedIsn),
        Config::default(),
    );

    let client_handle = Arc::new(Mutex::new(None));
    client
        .connect(
            server_addr,
            Config::default().listen_port,
            Box::new(Client {
                transport: client_handle.clone(),
            }),
            Box::new(NoopClientFactory),
        )
        .await;

    tokio::spawn(async move {
        client.run().await;
    });

    // Give the handshake a moment to complete, then write and close.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let handle = client_handle.lock().unwrap().clone().expect("connected");
    handle.write(Message::new(b"hello, ptcp".to_vec())).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.lose_connection().await;

    tokio::time::timeout(std::time::Duration::from_secs(5), closed_rx)
        .await
        .expect("server connection_lost within timeout")
        .unwrap();

    assert_eq!(&received.lock().unwrap()[..], b"hello, ptcp");
}
